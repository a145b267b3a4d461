//! Module construction, serialization and sample modules.

use crate::dialect::{
    ActivationKind, AttentionOp, DataType, LayerNormOp, MatmulOp, MlpOp, Operation, TensorSpec,
};
use crate::error::{Error, Result};
use crate::schedule::Schedule;
use serde::{Deserialize, Serialize};

pub const MODULE_FORMAT: &str = "tunebridge.module";
pub const MODULE_VERSION: u32 = 1;

/// One schedulable unit of computation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub name: String,
    pub op: Operation,
    #[serde(default)]
    pub schedule: Schedule,
}

impl Task {
    pub fn new<N: Into<String>>(name: N, op: Operation) -> Self {
        Self {
            name: name.into(),
            op,
            schedule: Schedule::default(),
        }
    }

    pub fn signature(&self) -> String {
        self.op.signature()
    }
}

#[derive(Debug, Default, Clone)]
pub struct ModuleBuilder {
    tasks: Vec<Task>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn add_matmul<N: Into<String>>(
        mut self,
        name: N,
        lhs: TensorSpec,
        rhs: TensorSpec,
        result: TensorSpec,
        bias: Option<TensorSpec>,
        activation: ActivationKind,
    ) -> Self {
        let op = MatmulOp {
            lhs,
            rhs,
            result,
            bias,
            activation,
            fuse_epilogue: false,
        };
        self.tasks.push(Task::new(name, Operation::Matmul(op)));
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_attention<N: Into<String>>(
        mut self,
        name: N,
        query: TensorSpec,
        key: TensorSpec,
        value: TensorSpec,
        mask: Option<TensorSpec>,
        result: TensorSpec,
        scale: f32,
    ) -> Self {
        let op = AttentionOp {
            query,
            key,
            value,
            mask,
            result,
            scale,
        };
        self.tasks.push(Task::new(name, Operation::Attention(op)));
        self
    }

    pub fn add_mlp<N: Into<String>>(
        mut self,
        name: N,
        input: TensorSpec,
        hidden: TensorSpec,
        output: TensorSpec,
        activation: ActivationKind,
    ) -> Self {
        let op = MlpOp {
            input,
            hidden,
            output,
            activation,
        };
        self.tasks.push(Task::new(name, Operation::Mlp(op)));
        self
    }

    pub fn add_layer_norm<N: Into<String>>(
        mut self,
        name: N,
        input: TensorSpec,
        epsilon: f32,
        result: TensorSpec,
    ) -> Self {
        let op = LayerNormOp {
            input,
            epsilon,
            result,
        };
        self.tasks.push(Task::new(name, Operation::LayerNorm(op)));
        self
    }

    /// Override the schedule of the most recently added task.
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        if let Some(task) = self.tasks.last_mut() {
            task.schedule = schedule;
        }
        self
    }

    pub fn build(self) -> Module {
        Module { tasks: self.tasks }
    }
}

/// In-memory task graph handed between the pipeline stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub tasks: Vec<Task>,
}

#[derive(Serialize, Deserialize)]
struct ModuleDocument {
    format: String,
    version: u32,
    tasks: Vec<Task>,
}

impl Module {
    pub fn builder() -> ModuleBuilder {
        ModuleBuilder::new()
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.name == name)
    }

    pub fn to_json(&self) -> Result<String> {
        let document = ModuleDocument {
            format: MODULE_FORMAT.to_string(),
            version: MODULE_VERSION,
            tasks: self.tasks.clone(),
        };
        serde_json::to_string_pretty(&document)
            .map_err(|err| Error::Engine(format!("failed to serialize module: {err}")))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let document: ModuleDocument =
            serde_json::from_str(text).map_err(|err| Error::ModuleParse(err.to_string()))?;
        if document.format != MODULE_FORMAT {
            return Err(Error::ModuleParse(format!(
                "unexpected format tag '{}'",
                document.format
            )));
        }
        if document.version != MODULE_VERSION {
            return Err(Error::ModuleParse(format!(
                "unsupported module version {}",
                document.version
            )));
        }
        Ok(Self {
            tasks: document.tasks,
        })
    }

    /// Human-readable listing, one task per line.
    pub fn to_text(&self) -> String {
        let mut text = String::from("module {\n");
        for task in &self.tasks {
            text.push_str(&format!(
                "  task @{} = {} schedule({})\n",
                task.name, task.op, task.schedule
            ));
        }
        text.push_str("}\n");
        text
    }
}

pub fn tensor(name: &str, shape: &[usize], dtype: DataType) -> TensorSpec {
    TensorSpec::new(name, shape.to_vec(), dtype)
}

fn tensor_f32(name: &str, shape: &[usize]) -> TensorSpec {
    tensor(name, shape, DataType::F32)
}

/// A single 128x128x128 matmul.
pub fn simple_matmul_module() -> Module {
    ModuleBuilder::new()
        .add_matmul(
            "matmul",
            tensor_f32("A", &[128, 128]),
            tensor_f32("B", &[128, 128]),
            tensor_f32("C", &[128, 128]),
            None,
            ActivationKind::None,
        )
        .build()
}

/// A projection matmul followed by a layer norm: two distinct workloads.
pub fn two_task_module() -> Module {
    ModuleBuilder::new()
        .add_matmul(
            "proj",
            tensor_f32("x", &[64, 96]),
            tensor_f32("w", &[96, 64]),
            tensor_f32("y", &[64, 64]),
            None,
            ActivationKind::Relu,
        )
        .add_layer_norm("norm", tensor_f32("y", &[64, 64]), 1e-5, tensor_f32("z", &[64, 64]))
        .build()
}

/// Attention block with projection, attention, MLP and post norm.
pub fn transformer_block_module(seq_len: usize, d_model: usize) -> Module {
    ModuleBuilder::new()
        .add_matmul(
            "q_proj",
            tensor_f32("x", &[seq_len, d_model]),
            tensor_f32("w_q", &[d_model, d_model]),
            tensor_f32("q", &[seq_len, d_model]),
            None,
            ActivationKind::None,
        )
        .add_attention(
            "self_attn",
            tensor_f32("q", &[seq_len, d_model]),
            tensor_f32("k", &[seq_len, d_model]),
            tensor_f32("v", &[seq_len, d_model]),
            None,
            tensor_f32("attn_out", &[seq_len, d_model]),
            1.0 / (d_model as f32).sqrt(),
        )
        .add_mlp(
            "ffn",
            tensor_f32("ffn_in", &[seq_len, d_model]),
            tensor_f32("ffn_hidden", &[seq_len, 4 * d_model]),
            tensor_f32("ffn_out", &[seq_len, d_model]),
            ActivationKind::Gelu,
        )
        .add_layer_norm(
            "post_ln",
            tensor_f32("ln_in", &[seq_len, d_model]),
            1e-5,
            tensor_f32("ln_out", &[seq_len, d_model]),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_keeps_tasks_and_schedules() {
        let module = ModuleBuilder::new()
            .add_matmul(
                "mm",
                tensor_f32("a", &[8, 16]),
                tensor_f32("b", &[16, 4]),
                tensor_f32("c", &[8, 4]),
                Some(tensor_f32("bias", &[1, 4])),
                ActivationKind::Gelu,
            )
            .with_schedule(Schedule {
                tile_m: 4,
                tile_n: 2,
                tile_k: 8,
                vector_width: 4,
                parallel: true,
            })
            .add_layer_norm("ln", tensor_f32("c", &[8, 4]), 1e-5, tensor_f32("d", &[8, 4]))
            .build();

        let text = module.to_json().expect("serialize");
        let decoded = Module::from_json(&text).expect("parse");
        assert_eq!(decoded, module);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = Module::from_json("{not json").unwrap_err();
        assert_eq!(err.kind_name(), "ModuleParseError");
    }

    #[test]
    fn wrong_format_tag_is_a_parse_error() {
        let err = Module::from_json(r#"{"format":"other","version":1,"tasks":[]}"#).unwrap_err();
        assert!(matches!(err, Error::ModuleParse(_)));
    }

    #[test]
    fn text_listing_names_every_task() {
        let text = transformer_block_module(16, 8).to_text();
        for name in ["q_proj", "self_attn", "ffn", "post_ln"] {
            assert!(text.contains(&format!("@{name}")));
        }
    }
}
