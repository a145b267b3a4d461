//! Shared helpers for kernel implementations.

use anyhow::{bail, Result};
use ndarray::{Array2, ArrayView2, ArrayViewMut2, Axis};
use rayon::prelude::*;
use tunebridge_ir::ActivationKind;

pub fn validate_matmul_inputs(lhs: &ArrayView2<'_, f32>, rhs: &ArrayView2<'_, f32>) -> Result<()> {
    if lhs.ncols() != rhs.nrows() {
        bail!(
            "matmul dimension mismatch: lhs {}x{} vs rhs {}x{}",
            lhs.nrows(),
            lhs.ncols(),
            rhs.nrows(),
            rhs.ncols()
        );
    }
    Ok(())
}

/// Bias must be `[m, n]` or a broadcast row `[1, n]`.
pub fn validate_bias(bias: &ArrayView2<'_, f32>, rows: usize, cols: usize) -> Result<()> {
    if bias.ncols() != cols || (bias.nrows() != 1 && bias.nrows() != rows) {
        bail!(
            "bias shape {:?} incompatible with output {:?}",
            bias.shape(),
            [rows, cols]
        );
    }
    Ok(())
}

#[inline]
pub fn activate(x: f32, activation: ActivationKind) -> f32 {
    match activation {
        ActivationKind::None => x,
        ActivationKind::Relu => x.max(0.0),
        ActivationKind::Gelu => {
            // Approximate GELU (tanh formulation).
            let c = (2.0 / std::f32::consts::PI).sqrt();
            0.5 * x * (1.0 + (c * (x + 0.044715 * x.powi(3))).tanh())
        }
    }
}

/// Bias value for output element `(row, col)`, honouring row broadcast.
#[inline]
pub fn bias_at(bias: &ArrayView2<'_, f32>, row: usize, col: usize) -> f32 {
    if bias.nrows() == 1 {
        bias[(0, col)]
    } else {
        bias[(row, col)]
    }
}

pub fn apply_bias_activation(
    mut output: Array2<f32>,
    bias: Option<&ArrayView2<'_, f32>>,
    activation: ActivationKind,
) -> Result<Array2<f32>> {
    if let Some(bias) = bias {
        validate_bias(bias, output.nrows(), output.ncols())?;
        output += bias;
    }
    if !matches!(activation, ActivationKind::None) {
        output.mapv_inplace(|x| activate(x, activation));
    }
    Ok(output)
}

fn softmax_row(row: &mut ndarray::ArrayViewMut1<'_, f32>) {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    row.mapv_inplace(|x| (x - max).exp());
    let sum = row.sum();
    *row /= sum.max(f32::EPSILON);
}

pub fn softmax_inplace(mut scores: ArrayViewMut2<'_, f32>, parallel: bool) {
    if parallel {
        scores
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .for_each(|mut row| softmax_row(&mut row));
    } else {
        scores
            .axis_iter_mut(Axis(0))
            .for_each(|mut row| softmax_row(&mut row));
    }
}

/// Reproducible operand contents in `[1, 2)`.
pub fn deterministic_tensor(rows: usize, cols: usize) -> Array2<f32> {
    let mut tensor = Array2::zeros((rows, cols));
    tensor
        .axis_iter_mut(Axis(0))
        .enumerate()
        .for_each(|(row_idx, mut row)| {
            row.iter_mut().enumerate().for_each(|(col_idx, value)| {
                let seed = ((row_idx * 1313) ^ (col_idx * 7331)) as f32;
                *value = 1.0 + (seed % 17.0) / 16.0;
            });
        });
    tensor
}

/// Largest element-wise absolute difference; `f32::INFINITY` on shape mismatch.
pub fn max_abs_diff(lhs: &ArrayView2<'_, f32>, rhs: &ArrayView2<'_, f32>) -> f32 {
    if lhs.dim() != rhs.dim() {
        return f32::INFINITY;
    }
    lhs.iter()
        .zip(rhs.iter())
        .fold(0.0f32, |acc, (a, b)| acc.max((a - b).abs()))
}
