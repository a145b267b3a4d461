//! Attention mechanism kernels.

use crate::utils::softmax_inplace;
use anyhow::{ensure, Result};
use ndarray::{s, Array2, ArrayView2, ArrayViewMut2, Axis};
use rayon::prelude::*;
use tunebridge_ir::Schedule;

fn check_shapes(
    query: &ArrayView2<'_, f32>,
    key: &ArrayView2<'_, f32>,
    value: &ArrayView2<'_, f32>,
    mask: Option<&ArrayView2<'_, f32>>,
) -> Result<()> {
    ensure!(
        query.ncols() == key.ncols(),
        "query dim {} must match key dim {}",
        query.ncols(),
        key.ncols()
    );
    ensure!(
        key.nrows() == value.nrows(),
        "key rows {} differ from value rows {}",
        key.nrows(),
        value.nrows()
    );
    if let Some(mask) = mask {
        ensure!(
            mask.dim() == (query.nrows(), key.nrows()),
            "mask shape {:?} incompatible with attention scores {:?}",
            mask.dim(),
            (query.nrows(), key.nrows())
        );
    }
    Ok(())
}

pub fn scaled_dot_product_attention(
    query: ArrayView2<'_, f32>,
    key: ArrayView2<'_, f32>,
    value: ArrayView2<'_, f32>,
    mask: Option<ArrayView2<'_, f32>>,
    scale: f32,
) -> Result<Array2<f32>> {
    check_shapes(&query, &key, &value, mask.as_ref())?;
    let mut scores = query.dot(&key.t());
    scores *= scale;
    if let Some(mask) = mask {
        scores += &mask;
    }
    softmax_inplace(scores.view_mut(), true);
    Ok(scores.dot(&value))
}

struct AttentionBlock<'a> {
    query: ArrayView2<'a, f32>,
    key_t: ArrayView2<'a, f32>,
    value: ArrayView2<'a, f32>,
    mask: Option<ArrayView2<'a, f32>>,
    scale: f32,
}

impl AttentionBlock<'_> {
    fn run(&self, start: usize, mut out: ArrayViewMut2<'_, f32>) {
        let end = start + out.nrows();
        let mut scores = self.query.slice(s![start..end, ..]).dot(&self.key_t);
        scores *= self.scale;
        if let Some(mask) = &self.mask {
            scores += &mask.slice(s![start..end, ..]);
        }
        softmax_inplace(scores.view_mut(), false);
        out.assign(&scores.dot(&self.value));
    }
}

/// Attention computed over blocks of `tile_m` query rows.
pub fn scheduled_attention<'a>(
    query: ArrayView2<'a, f32>,
    key: ArrayView2<'a, f32>,
    value: ArrayView2<'a, f32>,
    mask: Option<ArrayView2<'a, f32>>,
    scale: f32,
    schedule: &Schedule,
) -> Result<Array2<f32>> {
    check_shapes(&query, &key, &value, mask.as_ref())?;
    let mut output = Array2::<f32>::zeros((query.nrows(), value.ncols()));
    if output.is_empty() {
        return Ok(output);
    }
    let rows = schedule.tile_m.clamp(1, query.nrows());

    let block = AttentionBlock {
        query,
        key_t: key.reversed_axes(),
        value,
        mask,
        scale,
    };
    if schedule.parallel {
        output
            .axis_chunks_iter_mut(Axis(0), rows)
            .into_par_iter()
            .enumerate()
            .for_each(|(index, out)| block.run(index * rows, out));
    } else {
        output
            .axis_chunks_iter_mut(Axis(0), rows)
            .enumerate()
            .for_each(|(index, out)| block.run(index * rows, out));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{deterministic_tensor, max_abs_diff};

    #[test]
    fn blocked_attention_matches_reference() {
        let query = deterministic_tensor(9, 4);
        let key = deterministic_tensor(6, 4);
        let value = deterministic_tensor(6, 5);
        let mask = Array2::from_shape_fn((9, 6), |(i, j)| if j > i { -1.0e4 } else { 0.0 });
        let reference = scaled_dot_product_attention(
            query.view(),
            key.view(),
            value.view(),
            Some(mask.view()),
            0.5,
        )
        .expect("reference");

        for (tile_m, parallel) in [(1, false), (4, true), (9, false)] {
            let schedule = Schedule {
                tile_m,
                parallel,
                ..Schedule::default()
            };
            let out = scheduled_attention(
                query.view(),
                key.view(),
                value.view(),
                Some(mask.view()),
                0.5,
                &schedule,
            )
            .expect("scheduled");
            assert!(max_abs_diff(&out.view(), &reference.view()) < 1e-4);
        }
    }

    #[test]
    fn sliced_views_without_mask() {
        let query = deterministic_tensor(5, 3);
        let keys = deterministic_tensor(8, 3);
        let value = deterministic_tensor(4, 2);
        let key = keys.slice(s![..4, ..]);
        let reference =
            scaled_dot_product_attention(query.view(), key, value.view(), None, 1.0).expect("reference");
        let schedule = Schedule {
            tile_m: 2,
            parallel: true,
            ..Schedule::default()
        };
        let out = scheduled_attention(query.view(), key, value.view(), None, 1.0, &schedule)
            .expect("scheduled");
        assert!(max_abs_diff(&out.view(), &reference.view()) < 1e-4);
    }

    #[test]
    fn mismatched_key_dim_errors() {
        let query = deterministic_tensor(2, 4);
        let key = deterministic_tensor(3, 5);
        let value = deterministic_tensor(3, 2);
        assert!(
            scaled_dot_product_attention(query.view(), key.view(), value.view(), None, 1.0)
                .is_err()
        );
    }
}
