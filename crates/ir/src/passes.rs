//! Transformation passes for tunebridge modules.
//!
//! Two pipelines exist. The baseline ("zero") pipeline legalizes every
//! module before it is tuned or built. The optimization-level pipeline runs
//! after database schedules have been substituted and only touches tasks
//! that were left at their default schedule.

use crate::builder::{Module, Task};
use crate::dialect::{ActivationKind, MatmulOp, Operation, TensorSpec};
use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

pub const MAX_OPT_LEVEL: u8 = 3;

/// State shared by the passes of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PassContext {
    pub opt_level: u8,
    /// Tasks whose schedule came from the tuning database.
    pub tuned: BTreeSet<String>,
}

impl PassContext {
    pub fn new(opt_level: u8) -> Self {
        Self {
            opt_level,
            tuned: BTreeSet::new(),
        }
    }

    pub fn with_tuned<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tuned.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn is_tuned(&self, task: &Task) -> bool {
        self.tuned.contains(&task.name)
    }
}

pub trait Pass {
    fn name(&self) -> &str;
    fn run(&self, module: &mut Module, ctx: &PassContext) -> Result<()>;
}

pub struct LegalizeShapes;

impl Pass for LegalizeShapes {
    fn name(&self) -> &str {
        "legalize-shapes"
    }

    fn run(&self, module: &mut Module, _ctx: &PassContext) -> Result<()> {
        if module.tasks.is_empty() {
            return Err(Error::normalization("<module>", "module has no tasks"));
        }
        for task in &module.tasks {
            legalize_task(task)?;
        }
        debug!(pass = self.name(), tasks = module.tasks.len(), "shapes legal");
        Ok(())
    }
}

fn legalize_task(task: &Task) -> Result<()> {
    let fail = |detail: String| Error::normalization(task.name.clone(), detail);

    for tensor in task.op.tensors() {
        let (rows, cols) = tensor
            .dims2()
            .ok_or_else(|| fail(format!("tensor '{}' must be rank 2", tensor.name)))?;
        if rows == 0 || cols == 0 {
            return Err(fail(format!("tensor '{}' has a zero-sized dimension", tensor.name)));
        }
        if tensor.byte_size().is_none() {
            return Err(fail(format!(
                "tensor '{}' ({rows}x{cols}) is too large to address",
                tensor.name
            )));
        }
        if tensor.dtype.element_type() != "f32" {
            return Err(fail(format!(
                "tensor '{}' has unsupported dtype {}",
                tensor.name,
                tensor.dtype.element_type()
            )));
        }
    }

    let dims = |spec: &TensorSpec| spec.dims2().unwrap_or((0, 0));
    match &task.op {
        Operation::Matmul(op) => {
            let (m, k) = dims(&op.lhs);
            let (k2, n) = dims(&op.rhs);
            if k != k2 {
                return Err(fail(format!("reduction mismatch: lhs k={k}, rhs k={k2}")));
            }
            if dims(&op.result) != (m, n) {
                return Err(fail(format!(
                    "result {} does not match {m}x{n}",
                    op.result.type_string()
                )));
            }
            if let Some(bias) = &op.bias {
                let (rows, cols) = dims(bias);
                if cols != n || (rows != 1 && rows != m) {
                    return Err(fail(format!(
                        "bias {} cannot broadcast to {m}x{n}",
                        bias.type_string()
                    )));
                }
            }
        }
        Operation::Attention(op) => {
            let (s, d) = dims(&op.query);
            let (t, dk) = dims(&op.key);
            let (t2, dv) = dims(&op.value);
            if d != dk || t != t2 {
                return Err(fail("query/key/value shapes disagree".to_string()));
            }
            if dims(&op.result) != (s, dv) {
                return Err(fail(format!(
                    "result {} does not match {s}x{dv}",
                    op.result.type_string()
                )));
            }
            if let Some(mask) = &op.mask {
                if dims(mask) != (s, t) {
                    return Err(fail(format!("mask {} is not {s}x{t}", mask.type_string())));
                }
            }
            if !op.scale.is_finite() {
                return Err(fail("scale must be finite".to_string()));
            }
        }
        Operation::Mlp(op) => {
            let (m, d) = dims(&op.input);
            let (hm, _) = dims(&op.hidden);
            if hm != m || dims(&op.output) != (m, d) {
                return Err(fail("mlp input/hidden/output rows disagree".to_string()));
            }
        }
        Operation::LayerNorm(op) => {
            if op.input.shape != op.result.shape {
                return Err(fail("layer norm must preserve its input shape".to_string()));
            }
            if op.epsilon.is_nan() || op.epsilon <= 0.0 {
                return Err(fail("epsilon must be positive".to_string()));
            }
        }
    }
    Ok(())
}

/// Rewrite every MLP block into an up projection and a down projection.
pub struct DecomposeMlp;

impl Pass for DecomposeMlp {
    fn name(&self) -> &str {
        "decompose-mlp"
    }

    fn run(&self, module: &mut Module, _ctx: &PassContext) -> Result<()> {
        let mut decomposed = 0;
        let mut tasks = Vec::with_capacity(module.tasks.len());
        for task in module.tasks.drain(..) {
            let Operation::Mlp(mlp) = &task.op else {
                tasks.push(task);
                continue;
            };
            let (_, d) = mlp.input.dims2().unwrap_or((1, 1));
            let (_, h) = mlp.hidden.dims2().unwrap_or((1, 1));
            let dtype = mlp.input.dtype;

            let up = MatmulOp {
                lhs: mlp.input.clone(),
                rhs: TensorSpec::new(format!("{}.w_up", task.name), vec![d, h], dtype),
                result: mlp.hidden.clone(),
                bias: None,
                activation: mlp.activation,
                fuse_epilogue: false,
            };
            let down = MatmulOp {
                lhs: mlp.hidden.clone(),
                rhs: TensorSpec::new(format!("{}.w_down", task.name), vec![h, d], dtype),
                result: mlp.output.clone(),
                bias: None,
                activation: ActivationKind::None,
                fuse_epilogue: false,
            };
            tasks.push(Task {
                name: format!("{}.up", task.name),
                op: Operation::Matmul(up),
                schedule: task.schedule,
            });
            tasks.push(Task {
                name: format!("{}.down", task.name),
                op: Operation::Matmul(down),
                schedule: task.schedule,
            });
            decomposed += 1;
        }
        module.tasks = tasks;
        debug!(pass = self.name(), decomposed, "decomposed mlp blocks");
        Ok(())
    }
}

pub struct UniqueTaskNames;

impl Pass for UniqueTaskNames {
    fn name(&self) -> &str {
        "unique-task-names"
    }

    fn run(&self, module: &mut Module, _ctx: &PassContext) -> Result<()> {
        let mut seen = HashSet::new();
        for task in &module.tasks {
            if task.name.is_empty() {
                return Err(Error::normalization("<unnamed>", "task name must not be empty"));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(Error::normalization(task.name.clone(), "duplicate task name"));
            }
        }
        Ok(())
    }
}

pub struct CanonicalizeSchedules;

impl Pass for CanonicalizeSchedules {
    fn name(&self) -> &str {
        "canonicalize-schedules"
    }

    fn run(&self, module: &mut Module, _ctx: &PassContext) -> Result<()> {
        let mut changed = 0;
        for task in module.tasks.iter_mut() {
            let canonical = task.schedule.canonicalize(task.op.loop_extents());
            if canonical != task.schedule {
                task.schedule = canonical;
                changed += 1;
            }
        }
        debug!(pass = self.name(), changed, "canonicalized schedules");
        Ok(())
    }
}

pub struct FuseEpilogue;

impl Pass for FuseEpilogue {
    fn name(&self) -> &str {
        "fuse-epilogue"
    }

    fn run(&self, module: &mut Module, _ctx: &PassContext) -> Result<()> {
        let mut fused = 0;
        for task in module.tasks.iter_mut() {
            if let Operation::Matmul(matmul) = &mut task.op {
                let has_epilogue =
                    matmul.bias.is_some() || !matches!(matmul.activation, ActivationKind::None);
                if has_epilogue && !matmul.fuse_epilogue {
                    matmul.fuse_epilogue = true;
                    fused += 1;
                }
            }
        }
        debug!(pass = self.name(), fused, "fused matmul epilogues");
        Ok(())
    }
}

pub struct VectorizeRows;

impl Pass for VectorizeRows {
    fn name(&self) -> &str {
        "vectorize-rows"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext) -> Result<()> {
        let mut vectorized = 0;
        for task in module.tasks.iter_mut() {
            if ctx.is_tuned(task) || task.schedule.vector_width > 1 {
                continue;
            }
            task.schedule.vector_width = 4;
            vectorized += 1;
        }
        debug!(pass = self.name(), vectorized, "vectorized default schedules");
        Ok(())
    }
}

pub struct ParallelizeDefaults;

impl Pass for ParallelizeDefaults {
    fn name(&self) -> &str {
        "parallelize-defaults"
    }

    fn run(&self, module: &mut Module, ctx: &PassContext) -> Result<()> {
        let mut parallelized = 0;
        for task in module.tasks.iter_mut() {
            if ctx.is_tuned(task) || task.schedule.parallel {
                continue;
            }
            task.schedule.parallel = true;
            parallelized += 1;
        }
        debug!(pass = self.name(), parallelized, "parallelized default schedules");
        Ok(())
    }
}

pub struct PassPipeline {
    passes: Vec<Box<dyn Pass + Send + Sync>>,
}

impl PassPipeline {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Baseline legalization every module goes through before tuning or building.
    pub fn zero() -> Self {
        Self {
            passes: vec![
                Box::new(LegalizeShapes),
                Box::new(DecomposeMlp),
                Box::new(UniqueTaskNames),
                Box::new(CanonicalizeSchedules),
            ],
        }
    }

    /// Generic passes enabled at `opt_level`, ending with a re-canonicalization.
    pub fn for_opt_level(opt_level: u8) -> Result<Self> {
        if opt_level > MAX_OPT_LEVEL {
            return Err(Error::InvalidArgument(format!(
                "opt_level must be within 0..={MAX_OPT_LEVEL}, got {opt_level}"
            )));
        }
        let mut pipeline = Self::new();
        if opt_level >= 1 {
            pipeline.add_pass(FuseEpilogue);
        }
        if opt_level >= 2 {
            pipeline.add_pass(VectorizeRows);
        }
        if opt_level >= 3 {
            pipeline.add_pass(ParallelizeDefaults);
        }
        pipeline.add_pass(CanonicalizeSchedules);
        Ok(pipeline)
    }

    pub fn add_pass<P>(&mut self, pass: P)
    where
        P: Pass + Send + Sync + 'static,
    {
        self.passes.push(Box::new(pass));
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|pass| pass.name()).collect()
    }

    pub fn run(&self, module: &mut Module, ctx: &PassContext) -> Result<()> {
        for pass in &self.passes {
            pass.run(module, ctx)?;
        }
        Ok(())
    }
}

impl Default for PassPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the baseline pipeline over `module`.
pub fn normalize(module: &mut Module) -> Result<()> {
    PassPipeline::zero().run(module, &PassContext::default())
}
