//! CPU runtime entrypoints.

use crate::planner::{CpuPlan, CpuPlanner};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::info;
use tunebridge_ir::{CompiledArtifact, Result};
use tunebridge_kernels::{materialize, operand_specs, result_spec, KernelProfile};

pub struct ExecutionReport {
    /// Final value of every tensor a task produced, by tensor name.
    pub outputs: BTreeMap<String, Array2<f32>>,
    pub profiles: Vec<KernelProfile>,
}

impl ExecutionReport {
    pub fn total_ms(&self) -> f64 {
        self.profiles
            .iter()
            .map(|profile| profile.average_time_ms)
            .sum()
    }
}

/// Runs every task of an artifact in order. A task reads the output of an
/// earlier task when the tensor name and shape match; other operands get
/// deterministic contents.
pub struct CpuExecutor {
    artifact: CompiledArtifact,
    plan: CpuPlan,
}

impl CpuExecutor {
    pub fn new(artifact: CompiledArtifact) -> Result<Self> {
        let plan = CpuPlanner::plan(&artifact)?;
        Ok(Self { artifact, plan })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::new(CompiledArtifact::load(path)?)
    }

    pub fn artifact(&self) -> &CompiledArtifact {
        &self.artifact
    }

    pub fn run(&self) -> Result<ExecutionReport> {
        let mut tensors: BTreeMap<String, Array2<f32>> = BTreeMap::new();
        let mut profiles = Vec::with_capacity(self.plan.tasks.len());

        for planned in &self.plan.tasks {
            let op = planned.kernel.op();
            let operands: Vec<Array2<f32>> = operand_specs(op)
                .into_iter()
                .map(|spec| match tensors.get(&spec.name) {
                    Some(value) if Some(value.dim()) == spec.dims2() => value.clone(),
                    _ => materialize(spec),
                })
                .collect();

            let start = Instant::now();
            let output = planned.kernel.execute(&operands)?;
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

            profiles.push(KernelProfile::new(
                &planned.lowered.kernel,
                op.flops(),
                elapsed_ms,
            ));
            tensors.insert(result_spec(op).name.clone(), output);
        }

        let report = ExecutionReport {
            outputs: tensors,
            profiles,
        };
        info!(
            tasks = self.plan.tasks.len(),
            total_ms = report.total_ms(),
            "executed artifact"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunebridge_ir::{artifact_path, normalize, two_task_module, PassContext, Target};

    #[test]
    fn executes_saved_artifact_and_chains_outputs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut module = two_task_module();
        normalize(&mut module).expect("normalize");
        let artifact = CompiledArtifact::lower(&module, &Target::cpu(), &PassContext::new(1));
        let path = artifact_path(dir.path());
        artifact.save(&path).expect("save");

        let executor = CpuExecutor::load(&path).expect("load");
        let report = executor.run().expect("run");

        assert_eq!(report.profiles.len(), 2);
        let normalized = &report.outputs["z"];
        assert_eq!(normalized.dim(), (64, 64));
        // The layer norm consumed the projection output, so each row is centred.
        for row in normalized.rows() {
            assert!(row.sum().abs() < 1e-2);
        }
        assert!(report.outputs.contains_key("y"));
    }

    #[test]
    fn missing_artifact_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = CpuExecutor::load(&dir.path().join("compiled_lib.so"))
            .err()
            .expect("should fail");
        assert_eq!(err.kind_name(), "IoError");
    }
}
