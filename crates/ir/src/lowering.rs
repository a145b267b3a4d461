//! Lowering of normalized modules into the compiled-artifact format.

use crate::builder::{Module, Task};
use crate::dialect::{ActivationKind, Operation};
use crate::error::{Error, Result};
use crate::passes::PassContext;
use crate::schedule::Schedule;
use crate::target::Target;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ARTIFACT_FORMAT: &str = "tunebridge.artifact";
pub const ARTIFACT_VERSION: u32 = 1;
pub const ARTIFACT_STEM: &str = "compiled_lib";

/// `compiled_lib` with the host's shared-library extension.
pub fn artifact_file_name() -> String {
    format!("{ARTIFACT_STEM}.{}", std::env::consts::DLL_EXTENSION)
}

pub fn artifact_path(work_dir: &Path) -> PathBuf {
    work_dir.join(artifact_file_name())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoweredTask {
    pub name: String,
    pub signature: String,
    pub op: Operation,
    pub schedule: Schedule,
    pub kernel: String,
    pub fused_epilogue: bool,
    /// Schedule came from the tuning database.
    pub tuned: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledArtifact {
    pub format: String,
    pub version: u32,
    pub target: Target,
    pub opt_level: u8,
    pub tasks: Vec<LoweredTask>,
}

impl CompiledArtifact {
    /// Lower an already normalized and optimized module.
    pub fn lower(module: &Module, target: &Target, ctx: &PassContext) -> Self {
        let tasks = module
            .tasks
            .iter()
            .map(|task| LoweredTask {
                name: task.name.clone(),
                signature: task.signature(),
                kernel: kernel_name(task, target),
                fused_epilogue: epilogue_fused(&task.op),
                tuned: ctx.is_tuned(task),
                op: task.op.clone(),
                schedule: task.schedule,
            })
            .collect();
        Self {
            format: ARTIFACT_FORMAT.to_string(),
            version: ARTIFACT_VERSION,
            target: target.clone(),
            opt_level: ctx.opt_level,
            tasks,
        }
    }

    pub fn tuned_count(&self) -> usize {
        self.tasks.iter().filter(|task| task.tuned).count()
    }

    /// Write through a sibling temp file so readers never observe a partial artifact.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|err| Error::Engine(format!("failed to serialize artifact: {err}")))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, text).map_err(|err| Error::io(&tmp, err))?;
        if let Err(err) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(Error::io(path, err));
        }
        debug!(path = %path.display(), tasks = self.tasks.len(), "wrote compiled artifact");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
        let artifact: Self = serde_json::from_str(&text)
            .map_err(|err| Error::Engine(format!("corrupt artifact {}: {err}", path.display())))?;
        if artifact.format != ARTIFACT_FORMAT || artifact.version != ARTIFACT_VERSION {
            return Err(Error::Engine(format!(
                "{} is not a {ARTIFACT_FORMAT} v{ARTIFACT_VERSION} artifact",
                path.display()
            )));
        }
        Ok(artifact)
    }
}

fn epilogue_fused(op: &Operation) -> bool {
    matches!(op, Operation::Matmul(matmul) if matmul.fuse_epilogue)
}

fn kernel_name(task: &Task, target: &Target) -> String {
    let base = match &task.op {
        Operation::Matmul(op) if op.fuse_epilogue => match op.activation {
            ActivationKind::None => "matmul_bias_fused",
            ActivationKind::Relu => "matmul_relu_fused",
            ActivationKind::Gelu => "matmul_gelu_fused",
        },
        Operation::Matmul(_) => "matmul_tiled",
        Operation::Attention(_) => "attention_tiled",
        Operation::Mlp(_) => "mlp_fused",
        Operation::LayerNorm(_) => "layernorm_rows",
    };
    let mode = if task.schedule.parallel { "par" } else { "seq" };
    format!("{}.{}.{}.v{}", target.kind, base, mode, task.schedule.vector_width)
}
