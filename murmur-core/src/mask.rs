//! Additive attention masks.
//!
//! Disallowed positions hold exactly `f32::NEG_INFINITY`, never a large
//! finite sentinel, so softmax assigns them exactly zero probability. The
//! value survives conversion to f16 at the accelerator boundary.

use ndarray::{Array2, ArrayViewMut2};

use crate::error::{DecodeError, Result};

/// Causal prefill mask over a padded `(p, p)` window.
///
/// Entry `(row, col)` is `0` when `col <= row` and `col < n_tokens`, else `-inf`.
pub fn fill_prefill_mask(mut dst: ArrayViewMut2<'_, f32>, n_tokens: usize) -> Result<()> {
    let (rows, cols) = dst.dim();
    if rows != cols || n_tokens == 0 || n_tokens > rows {
        return Err(DecodeError::InvalidState(format!(
            "prefill mask ({rows}, {cols}) cannot hold {n_tokens} tokens"
        )));
    }
    for ((row, col), v) in dst.indexed_iter_mut() {
        *v = if col <= row && col < n_tokens { 0.0 } else { f32::NEG_INFINITY };
    }
    Ok(())
}

pub fn prefill_mask(window: usize, n_tokens: usize) -> Result<Array2<f32>> {
    let mut mask = Array2::zeros((window, window));
    fill_prefill_mask(mask.view_mut(), n_tokens)?;
    Ok(mask)
}

/// Step mask of shape `(1, ctx + 1)`.
///
/// Columns `[0, offset)` are filled cache positions (`0`), `[offset, ctx)` are
/// not yet written (`-inf`), and the last column is the new token itself (`0`).
pub fn fill_step_mask(mut dst: ArrayViewMut2<'_, f32>, text_offset: usize) -> Result<()> {
    let (rows, cols) = dst.dim();
    let ctx = cols.saturating_sub(1);
    if rows != 1 || cols == 0 || text_offset >= ctx {
        return Err(DecodeError::InvalidState(format!(
            "step mask ({rows}, {cols}) cannot hold offset {text_offset}"
        )));
    }
    for (col, v) in dst.iter_mut().enumerate() {
        *v = if col < text_offset || col == ctx { 0.0 } else { f32::NEG_INFINITY };
    }
    Ok(())
}

pub fn step_mask(ctx: usize, text_offset: usize) -> Result<Array2<f32>> {
    let mut mask = Array2::zeros((1, ctx + 1));
    fill_step_mask(mask.view_mut(), text_offset)?;
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    const NEG: f32 = f32::NEG_INFINITY;

    #[test]
    fn step_mask_at_offset_five() {
        let mask = step_mask(8, 5).expect("mask");
        let expected = [0.0, 0.0, 0.0, 0.0, 0.0, NEG, NEG, NEG, 0.0];
        assert_eq!(mask.shape(), &[1, 9]);
        assert_eq!(mask.as_slice().expect("contiguous"), &expected);
    }

    #[test]
    fn prefill_mask_is_causal_and_hides_padding() {
        let mask = prefill_mask(4, 3).expect("mask");
        let expected = [
            [0.0, NEG, NEG, NEG],
            [0.0, 0.0, NEG, NEG],
            [0.0, 0.0, 0.0, NEG],
            [0.0, 0.0, 0.0, NEG],
        ];
        for (r, row) in expected.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                assert_eq!(mask[[r, c]], v, "entry ({r}, {c})");
            }
        }
    }

    #[test]
    fn negative_infinity_survives_half_precision() {
        let mask = step_mask(8, 1).expect("mask");
        let halved: Vec<f16> = mask.iter().map(|&v| f16::from_f32(v)).collect();
        assert_eq!(halved[1], f16::NEG_INFINITY);
        assert_eq!(halved[0], f16::ZERO);
    }

    #[test]
    fn offset_at_context_limit_is_rejected() {
        assert!(step_mask(8, 8).is_err());
        assert!(prefill_mask(4, 0).is_err());
        assert!(prefill_mask(4, 5).is_err());
    }
}
