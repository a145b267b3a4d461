//! Matrix multiplication kernels.

use crate::utils::{activate, apply_bias_activation, bias_at, validate_bias, validate_matmul_inputs};
use anyhow::{anyhow, Result};
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use tunebridge_ir::{ActivationKind, Schedule};

pub struct MatmulInputs<'a> {
    pub lhs: ArrayView2<'a, f32>,
    pub rhs: ArrayView2<'a, f32>,
    pub bias: Option<ArrayView2<'a, f32>>,
    pub activation: ActivationKind,
}

impl<'a> MatmulInputs<'a> {
    pub fn new(
        lhs: ArrayView2<'a, f32>,
        rhs: ArrayView2<'a, f32>,
        bias: Option<ArrayView2<'a, f32>>,
        activation: ActivationKind,
    ) -> Self {
        Self {
            lhs,
            rhs,
            bias,
            activation,
        }
    }
}

pub fn reference_matmul(inputs: &MatmulInputs<'_>) -> Result<Array2<f32>> {
    validate_matmul_inputs(&inputs.lhs, &inputs.rhs)?;
    let result = inputs.lhs.dot(&inputs.rhs);
    apply_bias_activation(result, inputs.bias.as_ref(), inputs.activation)
}

/// Blocked matmul driven by a [`Schedule`].
///
/// Row blocks of `tile_m` are the unit of parallelism; inside a block the
/// `tile_n x tile_k` loops accumulate with `vector_width` lanes. With
/// `fuse_epilogue` the bias and activation are applied to each output tile
/// as soon as its reduction completes.
pub struct ScheduledMatmul {
    schedule: Schedule,
    fuse_epilogue: bool,
}

impl ScheduledMatmul {
    pub fn new(schedule: Schedule, fuse_epilogue: bool) -> Self {
        Self {
            schedule,
            fuse_epilogue,
        }
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn run(&self, inputs: &MatmulInputs<'_>) -> Result<Array2<f32>> {
        validate_matmul_inputs(&inputs.lhs, &inputs.rhs)?;
        let (m, k) = inputs.lhs.dim();
        let n = inputs.rhs.ncols();
        if let Some(bias) = &inputs.bias {
            validate_bias(bias, m, n)?;
        }
        let mut output = Array2::<f32>::zeros((m, n));
        if m == 0 || n == 0 {
            return Ok(output);
        }

        let lhs = inputs.lhs.as_standard_layout();
        let rhs = inputs.rhs.as_standard_layout();
        let a = lhs
            .as_slice()
            .ok_or_else(|| anyhow!("lhs is not contiguous"))?;
        let b = rhs
            .as_slice()
            .ok_or_else(|| anyhow!("rhs is not contiguous"))?;

        let tm = self.schedule.tile_m.clamp(1, m);
        let tn = self.schedule.tile_n.clamp(1, n);
        let tk = self.schedule.tile_k.clamp(1, k.max(1));
        let vw = self.schedule.vector_width.max(1);
        let epilogue = if self.fuse_epilogue {
            Some((inputs.bias.as_ref(), inputs.activation))
        } else {
            None
        };

        let compute_block = |block: usize, rows: &mut [f32]| {
            let i0 = block * tm;
            let i_max = (i0 + tm).min(m);
            for j0 in (0..n).step_by(tn) {
                let j_max = (j0 + tn).min(n);
                for p0 in (0..k).step_by(tk) {
                    let p_max = (p0 + tk).min(k);
                    for i in i0..i_max {
                        let offset = (i - i0) * n;
                        let c_row = &mut rows[offset + j0..offset + j_max];
                        for p in p0..p_max {
                            axpy(c_row, a[i * k + p], &b[p * n + j0..p * n + j_max], vw);
                        }
                    }
                }
                if let Some((bias, activation)) = epilogue {
                    for i in i0..i_max {
                        let offset = (i - i0) * n;
                        for j in j0..j_max {
                            let value = &mut rows[offset + j];
                            if let Some(bias) = bias {
                                *value += bias_at(bias, i, j);
                            }
                            *value = activate(*value, activation);
                        }
                    }
                }
            }
        };

        let out = output
            .as_slice_mut()
            .ok_or_else(|| anyhow!("output is not contiguous"))?;
        if self.schedule.parallel {
            out.par_chunks_mut(tm * n)
                .enumerate()
                .for_each(|(block, rows)| compute_block(block, rows));
        } else {
            out.chunks_mut(tm * n)
                .enumerate()
                .for_each(|(block, rows)| compute_block(block, rows));
        }

        if self.fuse_epilogue {
            Ok(output)
        } else {
            apply_bias_activation(output, inputs.bias.as_ref(), inputs.activation)
        }
    }
}

/// `dst += alpha * src`, `width` lanes at a time.
#[inline]
fn axpy(dst: &mut [f32], alpha: f32, src: &[f32], width: usize) {
    let mut dst_chunks = dst.chunks_exact_mut(width);
    let mut src_chunks = src.chunks_exact(width);
    for (d, s) in (&mut dst_chunks).zip(&mut src_chunks) {
        for lane in 0..width {
            d[lane] += alpha * s[lane];
        }
    }
    for (d, s) in dst_chunks
        .into_remainder()
        .iter_mut()
        .zip(src_chunks.remainder())
    {
        *d += alpha * *s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{deterministic_tensor, max_abs_diff};
    use ndarray::Array2;

    fn schedule(tm: usize, tn: usize, tk: usize, vw: usize, parallel: bool) -> Schedule {
        Schedule {
            tile_m: tm,
            tile_n: tn,
            tile_k: tk,
            vector_width: vw,
            parallel,
        }
    }

    #[test]
    fn scheduled_matmul_matches_reference() {
        let lhs = Array2::from_shape_fn((33, 20), |(i, j)| (i + j) as f32 * 0.1);
        let rhs = Array2::from_shape_fn((20, 17), |(i, j)| (i * j + 1) as f32 * 0.05);
        let inputs = MatmulInputs::new(lhs.view(), rhs.view(), None, ActivationKind::None);
        let reference = reference_matmul(&inputs).expect("reference");

        for sched in [
            schedule(1, 1, 1, 1, false),
            schedule(8, 4, 16, 4, false),
            schedule(16, 17, 20, 16, true),
            schedule(33, 8, 3, 2, true),
        ] {
            let out = ScheduledMatmul::new(sched, false)
                .run(&inputs)
                .expect("scheduled");
            let scale = reference.iter().fold(1.0f32, |acc, v| acc.max(v.abs()));
            assert!(max_abs_diff(&out.view(), &reference.view()) <= 1e-5 * scale, "{sched}");
        }
    }

    #[test]
    fn fused_and_separate_epilogues_agree() {
        let lhs = deterministic_tensor(12, 8);
        let rhs = deterministic_tensor(8, 10);
        let bias = Array2::from_shape_fn((1, 10), |(_, j)| (j as f32 - 5.0) * 4.0);
        let inputs =
            MatmulInputs::new(lhs.view(), rhs.view(), Some(bias.view()), ActivationKind::Relu);
        let sched = schedule(4, 4, 4, 2, true);

        let fused = ScheduledMatmul::new(sched, true).run(&inputs).expect("fused");
        let separate = ScheduledMatmul::new(sched, false).run(&inputs).expect("separate");
        let reference = reference_matmul(&inputs).expect("reference");

        assert!(max_abs_diff(&fused.view(), &separate.view()) < 1e-4);
        assert!(max_abs_diff(&fused.view(), &reference.view()) < 1e-3);
        assert!(fused.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn mismatched_operands_error() {
        let lhs = Array2::<f32>::zeros((4, 3));
        let rhs = Array2::<f32>::zeros((4, 3));
        let inputs = MatmulInputs::new(lhs.view(), rhs.view(), None, ActivationKind::None);
        assert!(ScheduledMatmul::new(Schedule::default(), false).run(&inputs).is_err());
    }
}
