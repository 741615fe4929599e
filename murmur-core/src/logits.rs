//! Vocabulary projection in equal chunks.
//!
//! Projecting a prefill hidden state against the whole token-embedding
//! matrix at once needs a `(tokens, n_vocab)` temporary per beam. Splitting
//! the vocabulary into `chunks` equal slices bounds the peak working set to
//! one slice while producing the same result.

use ndarray::{s, Array3, ArrayView2, ArrayView3, Axis};

use crate::error::{DecodeError, Result};

/// Fail unless `chunks` splits `vocab` into equal non-empty slices.
pub fn check_chunking(vocab: usize, chunks: usize) -> Result<()> {
    if chunks == 0 || vocab == 0 || vocab % chunks != 0 {
        return Err(DecodeError::VocabularyChunking { vocab, chunks });
    }
    Ok(())
}

/// `hidden (beam, n, n_state)` × `weight (n_vocab, n_state)`ᵀ → `(beam, n, n_vocab)`.
pub fn project_chunked(
    hidden: ArrayView3<'_, f32>,
    weight: ArrayView2<'_, f32>,
    chunks: usize,
) -> Result<Array3<f32>> {
    let (beams, n, n_state) = hidden.dim();
    let (vocab, w_state) = weight.dim();
    if w_state != n_state {
        return Err(DecodeError::shape("token_embedding", &[vocab, n_state], &[vocab, w_state]));
    }
    check_chunking(vocab, chunks)?;
    let width = vocab / chunks;

    let mut logits = Array3::<f32>::zeros((beams, n, vocab));
    for (b, h) in hidden.axis_iter(Axis(0)).enumerate() {
        for chunk in 0..chunks {
            let range = chunk * width..(chunk + 1) * width;
            let slice = weight.slice(s![range.clone(), ..]);
            let part = h.dot(&slice.t());
            logits.slice_mut(s![b, .., range]).assign(&part);
        }
    }
    Ok(logits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Array3};

    fn fixtures() -> (Array3<f32>, Array2<f32>) {
        let hidden = Array3::from_shape_fn((2, 3, 8), |(b, i, c)| ((b * 7 + i * 3 + c) % 11) as f32 * 0.1 - 0.4);
        let weight = Array2::from_shape_fn((20, 8), |(v, c)| ((v * 5 + c * 3) % 13) as f32 * 0.05 - 0.3);
        (hidden, weight)
    }

    #[test]
    fn chunked_matches_single_projection() {
        let (hidden, weight) = fixtures();
        let reference = project_chunked(hidden.view(), weight.view(), 1).expect("unchunked");
        for b in 0..2 {
            let direct = hidden.index_axis(Axis(0), b).dot(&weight.t());
            for (got, want) in reference.index_axis(Axis(0), b).iter().zip(direct.iter()) {
                assert_abs_diff_eq!(*got, *want, epsilon = 1e-6);
            }
        }
        let chunked = project_chunked(hidden.view(), weight.view(), 5).expect("five chunks");
        assert_eq!(chunked.shape(), reference.shape());
        for (got, want) in chunked.iter().zip(reference.iter()) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-5);
        }
    }

    #[test]
    fn indivisible_chunk_count_is_rejected() {
        let (hidden, weight) = fixtures();
        match project_chunked(hidden.view(), weight.view(), 3) {
            Err(DecodeError::VocabularyChunking { vocab, chunks }) => {
                assert_eq!((vocab, chunks), (20, 3));
            }
            other => panic!("expected VocabularyChunking, got {other:?}"),
        }
        assert!(check_chunking(51_865, 5).is_ok());
        assert!(check_chunking(51_865, 0).is_err());
    }

    #[test]
    fn hidden_width_must_match_embedding() {
        let (hidden, _) = fixtures();
        let weight = Array2::<f32>::zeros((20, 7));
        assert!(matches!(
            project_chunked(hidden.view(), weight.view(), 5),
            Err(DecodeError::ShapeMismatch { .. })
        ));
    }
}
