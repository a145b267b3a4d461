//! Candidate builds: schedule legality checks and kernel instantiation.

use crate::attention::{scaled_dot_product_attention, scheduled_attention};
use crate::layernorm::{layer_norm_inplace, scheduled_layer_norm};
use crate::matmul::{reference_matmul, MatmulInputs, ScheduledMatmul};
use crate::utils::deterministic_tensor;
use anyhow::{ensure, Result};
use ndarray::Array2;
use tracing::trace;
use tunebridge_ir::{ActivationKind, DataType, Error, Operation, Schedule, Task, TensorSpec};

/// Tensors a task reads, in the order [`BuiltKernel::execute`] expects them.
pub fn operand_specs(op: &Operation) -> Vec<&TensorSpec> {
    match op {
        Operation::Matmul(op) => {
            let mut specs = vec![&op.lhs, &op.rhs];
            specs.extend(op.bias.as_ref());
            specs
        }
        Operation::Attention(op) => {
            let mut specs = vec![&op.query, &op.key, &op.value];
            specs.extend(op.mask.as_ref());
            specs
        }
        Operation::Mlp(op) => vec![&op.input],
        Operation::LayerNorm(op) => vec![&op.input],
    }
}

pub fn result_spec(op: &Operation) -> &TensorSpec {
    match op {
        Operation::Matmul(op) => &op.result,
        Operation::Attention(op) => &op.result,
        Operation::Mlp(op) => &op.output,
        Operation::LayerNorm(op) => &op.result,
    }
}

/// Deterministic contents for a rank-2 tensor spec.
pub fn materialize(spec: &TensorSpec) -> Array2<f32> {
    let (rows, cols) = spec.dims2().unwrap_or((1, 1));
    deterministic_tensor(rows, cols)
}

/// A task instantiated with one schedule and its own deterministic inputs.
pub struct BuiltKernel {
    task: String,
    op: Operation,
    schedule: Schedule,
    operands: Vec<Array2<f32>>,
    weights: Vec<Array2<f32>>,
}

/// Check `task.schedule` against the task's loop nest and the target's tile
/// footprint limit without instantiating anything.
pub fn validate(task: &Task, footprint_limit: usize) -> tunebridge_ir::Result<usize> {
    let fail = |reason: String| Error::Build {
        task: task.name.clone(),
        reason,
    };

    task.schedule.check(task.op.loop_extents()).map_err(&fail)?;
    for tensor in task.op.tensors() {
        if tensor.dtype != DataType::F32 {
            return Err(fail(format!(
                "tensor '{}' has non-executable dtype {}",
                tensor.name,
                tensor.dtype.element_type()
            )));
        }
        if tensor.dims2().is_none() {
            return Err(fail(format!("tensor '{}' is not rank 2", tensor.name)));
        }
    }
    let footprint = task
        .schedule
        .tile_footprint_bytes(DataType::F32.size_bytes())
        .ok_or_else(|| fail(format!("tile footprint of {} overflows", task.schedule)))?;
    if footprint > footprint_limit {
        return Err(fail(format!(
            "tile footprint {footprint} B exceeds target limit {footprint_limit} B"
        )));
    }
    Ok(footprint)
}

/// Validate `task`, then instantiate the kernel with deterministic operands.
pub fn build(task: &Task, footprint_limit: usize) -> tunebridge_ir::Result<BuiltKernel> {
    let footprint = validate(task, footprint_limit)?;

    let operands = operand_specs(&task.op)
        .into_iter()
        .map(materialize)
        .collect();
    let weights = match &task.op {
        Operation::Mlp(op) => {
            let (_, d) = op.input.dims2().unwrap_or((1, 1));
            let (_, h) = op.hidden.dims2().unwrap_or((1, 1));
            vec![deterministic_tensor(d, h), deterministic_tensor(h, d)]
        }
        _ => Vec::new(),
    };

    trace!(task = %task.name, schedule = %task.schedule, footprint, "built kernel");
    Ok(BuiltKernel {
        task: task.name.clone(),
        op: task.op.clone(),
        schedule: task.schedule,
        operands,
        weights,
    })
}

impl BuiltKernel {
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn name(&self) -> String {
        format!("{}[{}]", self.op.kind(), self.schedule)
    }

    pub fn op(&self) -> &Operation {
        &self.op
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn operands(&self) -> &[Array2<f32>] {
        &self.operands
    }

    /// Run on the inputs materialized at build time.
    pub fn run(&self) -> Result<Array2<f32>> {
        self.execute(&self.operands)
    }

    pub fn execute(&self, operands: &[Array2<f32>]) -> Result<Array2<f32>> {
        let specs = operand_specs(&self.op);
        ensure!(
            operands.len() == specs.len(),
            "task '{}' expects {} operands, got {}",
            self.task,
            specs.len(),
            operands.len()
        );
        for (spec, operand) in specs.iter().zip(operands) {
            ensure!(
                Some(operand.dim()) == spec.dims2(),
                "operand '{}' has shape {:?}, expected {}",
                spec.name,
                operand.shape(),
                spec.type_string()
            );
        }

        match &self.op {
            Operation::Matmul(op) => {
                let bias = op.bias.as_ref().map(|_| operands[2].view());
                let inputs =
                    MatmulInputs::new(operands[0].view(), operands[1].view(), bias, op.activation);
                ScheduledMatmul::new(self.schedule, op.fuse_epilogue).run(&inputs)
            }
            Operation::Attention(op) => scheduled_attention(
                operands[0].view(),
                operands[1].view(),
                operands[2].view(),
                op.mask.as_ref().map(|_| operands[3].view()),
                op.scale,
                &self.schedule,
            ),
            Operation::LayerNorm(op) => {
                scheduled_layer_norm(operands[0].view(), op.epsilon, &self.schedule)
            }
            Operation::Mlp(op) => {
                let up = MatmulInputs::new(
                    operands[0].view(),
                    self.weights[0].view(),
                    None,
                    op.activation,
                );
                let hidden = ScheduledMatmul::new(self.schedule, true).run(&up)?;
                let down = MatmulInputs::new(
                    hidden.view(),
                    self.weights[1].view(),
                    None,
                    ActivationKind::None,
                );
                ScheduledMatmul::new(self.schedule, false).run(&down)
            }
        }
    }

    /// Unscheduled result on the build-time inputs.
    pub fn reference(&self) -> Result<Array2<f32>> {
        let operands = &self.operands;
        match &self.op {
            Operation::Matmul(op) => reference_matmul(&MatmulInputs::new(
                operands[0].view(),
                operands[1].view(),
                op.bias.as_ref().map(|_| operands[2].view()),
                op.activation,
            )),
            Operation::Attention(op) => scaled_dot_product_attention(
                operands[0].view(),
                operands[1].view(),
                operands[2].view(),
                op.mask.as_ref().map(|_| operands[3].view()),
                op.scale,
            ),
            Operation::LayerNorm(op) => {
                let mut output = operands[0].clone();
                layer_norm_inplace(output.view_mut(), op.epsilon)?;
                Ok(output)
            }
            Operation::Mlp(op) => {
                let hidden = reference_matmul(&MatmulInputs::new(
                    operands[0].view(),
                    self.weights[0].view(),
                    None,
                    op.activation,
                ))?;
                reference_matmul(&MatmulInputs::new(
                    hidden.view(),
                    self.weights[1].view(),
                    None,
                    ActivationKind::None,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::max_abs_diff;
    use tunebridge_ir::{
        tensor, transformer_block_module, two_task_module, CPU_TILE_FOOTPRINT_LIMIT,
    };

    fn relative_error(kernel: &BuiltKernel) -> f32 {
        let out = kernel.run().expect("run");
        let reference = kernel.reference().expect("reference");
        let scale = reference.iter().fold(1.0f32, |acc, v| acc.max(v.abs()));
        max_abs_diff(&out.view(), &reference.view()) / scale
    }

    #[test]
    fn every_sample_task_builds_and_matches_reference() {
        let mut tasks = transformer_block_module(8, 8).tasks;
        tasks.extend(two_task_module().tasks);
        for mut task in tasks {
            task.schedule = Schedule {
                tile_m: 4,
                tile_n: 4,
                tile_k: 1,
                vector_width: 4,
                parallel: true,
            };
            let kernel = build(&task, CPU_TILE_FOOTPRINT_LIMIT).expect("build");
            assert!(relative_error(&kernel) < 1e-4, "{}", task.name);
        }
    }

    #[test]
    fn oversized_tile_is_a_build_failure() {
        let mut task = two_task_module().tasks.remove(0);
        task.schedule.tile_m = 128;
        let err = build(&task, CPU_TILE_FOOTPRINT_LIMIT).err().expect("should fail");
        assert_eq!(err.kind_name(), "BuildFailure");
    }

    #[test]
    fn footprint_limit_is_enforced() {
        let mut task = two_task_module().tasks.remove(0);
        task.schedule = Schedule {
            tile_m: 64,
            tile_n: 64,
            tile_k: 64,
            vector_width: 1,
            parallel: false,
        };
        // 3 * 64 * 64 * 4 bytes = 48 KiB
        assert!(build(&task, 48 * 1024).is_ok());
        assert!(build(&task, 48 * 1024 - 1).is_err());
    }

    #[test]
    fn overflowing_footprint_is_a_build_failure() {
        let huge = 1usize << 33;
        let mut task = Task::new(
            "huge",
            Operation::Matmul(tunebridge_ir::MatmulOp {
                lhs: tensor("a", &[huge, huge], DataType::F32),
                rhs: tensor("b", &[huge, huge], DataType::F32),
                result: tensor("c", &[huge, huge], DataType::F32),
                bias: None,
                activation: ActivationKind::None,
                fuse_epilogue: false,
            }),
        );
        task.schedule = Schedule {
            tile_m: huge,
            tile_n: huge,
            tile_k: huge,
            vector_width: 1,
            parallel: false,
        };
        let err = validate(&task, usize::MAX).unwrap_err();
        assert_eq!(err.kind_name(), "BuildFailure");
        assert!(err.to_string().contains("overflows"), "{err}");
    }

    #[test]
    fn non_f32_tasks_do_not_build() {
        let task = Task::new(
            "half",
            tunebridge_ir::Operation::LayerNorm(tunebridge_ir::LayerNormOp {
                input: tensor("x", &[4, 4], DataType::F16),
                epsilon: 1e-5,
                result: tensor("y", &[4, 4], DataType::F16),
            }),
        );
        assert!(build(&task, CPU_TILE_FOOTPRINT_LIMIT).is_err());
    }

    #[test]
    fn execute_rejects_wrong_operand_shapes() {
        let task = two_task_module().tasks.remove(1);
        let kernel = build(
            &Task {
                schedule: Schedule::default().canonicalize(task.op.loop_extents()),
                ..task
            },
            CPU_TILE_FOOTPRINT_LIMIT,
        )
        .expect("build");
        assert!(kernel.execute(&[Array2::zeros((3, 3))]).is_err());
        assert!(kernel.execute(&[]).is_err());
    }
}
