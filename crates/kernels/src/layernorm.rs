//! Layer normalization kernels.

use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis};
use rayon::prelude::*;
use tunebridge_ir::Schedule;

fn normalize_row(row: &mut ArrayViewMut1<'_, f32>, epsilon: f32, lanes: usize) {
    let len = row.len() as f32;
    let mut partial = [0.0f32; tunebridge_ir::MAX_VECTOR_WIDTH];
    for (idx, value) in row.iter().enumerate() {
        partial[idx % lanes] += *value;
    }
    let mean = partial[..lanes].iter().sum::<f32>() / len;
    let var = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / len;
    let inv_std = 1.0 / (var + epsilon).sqrt();
    row.mapv_inplace(|x| (x - mean) * inv_std);
}

fn normalize_block(mut block: ArrayViewMut2<'_, f32>, epsilon: f32, lanes: usize) {
    for mut row in block.axis_iter_mut(Axis(0)) {
        normalize_row(&mut row, epsilon, lanes);
    }
}

pub fn layer_norm_inplace(mut data: ArrayViewMut2<'_, f32>, epsilon: f32) -> Result<()> {
    ensure!(epsilon > 0.0, "epsilon must be positive, got {epsilon}");
    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| normalize_row(&mut row, epsilon, 1));
    Ok(())
}

/// Row-blocked layer norm; blocks of `tile_m` rows run in parallel when the
/// schedule asks for it and row sums use `vector_width` partial accumulators.
pub fn scheduled_layer_norm(
    input: ArrayView2<'_, f32>,
    epsilon: f32,
    schedule: &Schedule,
) -> Result<Array2<f32>> {
    ensure!(epsilon > 0.0, "epsilon must be positive, got {epsilon}");
    let mut output = input.to_owned();
    if output.is_empty() {
        return Ok(output);
    }
    let rows = schedule.tile_m.clamp(1, output.nrows());
    let lanes = schedule
        .vector_width
        .clamp(1, tunebridge_ir::MAX_VECTOR_WIDTH);

    if schedule.parallel {
        output
            .axis_chunks_iter_mut(Axis(0), rows)
            .into_par_iter()
            .for_each(|block| normalize_block(block, epsilon, lanes));
    } else {
        output
            .axis_chunks_iter_mut(Axis(0), rows)
            .for_each(|block| normalize_block(block, epsilon, lanes));
    }
    Ok(output)
}
