//! Turns a compiled artifact into built kernels ready for execution.

use tracing::debug;
use tunebridge_ir::{CompiledArtifact, Error, LoweredTask, Result, Task};
use tunebridge_kernels::{build, BuiltKernel};

pub struct PlannedTask {
    pub lowered: LoweredTask,
    pub kernel: BuiltKernel,
}

pub struct CpuPlan {
    pub tasks: Vec<PlannedTask>,
}

pub struct CpuPlanner;

impl CpuPlanner {
    /// Build one kernel per lowered task. Artifacts for other target kinds
    /// cannot run on the host.
    pub fn plan(artifact: &CompiledArtifact) -> Result<CpuPlan> {
        if artifact.target.is_accelerator() {
            return Err(Error::Engine(format!(
                "artifact was compiled for '{}', the CPU executor cannot run it",
                artifact.target.kind
            )));
        }
        let limit = artifact.target.tile_footprint_limit();
        let mut tasks = Vec::with_capacity(artifact.tasks.len());
        for lowered in &artifact.tasks {
            let task = Task {
                name: lowered.name.clone(),
                op: lowered.op.clone(),
                schedule: lowered.schedule,
            };
            let kernel = build(&task, limit)?;
            debug!(task = %lowered.name, kernel = %lowered.kernel, "planned task");
            tasks.push(PlannedTask {
                lowered: lowered.clone(),
                kernel,
            });
        }
        Ok(CpuPlan { tasks })
    }
}
