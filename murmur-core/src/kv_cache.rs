//! Self-attention and cross-attention key/value caches.
//!
//! Both are laid out `(2·n_layer, beam, position, n_state)` with keys at even
//! indices of the first axis and values at odd.

use std::sync::Arc;

use ndarray::{s, Array3, Array4, ArrayView4, Axis};

use crate::error::{DecodeError, Result};

/// Text self-attention cache, owned by the orchestrator between calls.
///
/// Storage is allocated once at full context length. Positions at or past the
/// current text offset hold zeros or stale data and are masked out by the
/// step mask, so they are never read before being written.
#[derive(Debug, Clone)]
pub struct MaskedKvCache {
    data: Array4<f32>,
    /// Preallocated `(beam, ctx, n_state)` staging area for rearrangement.
    scratch: Array3<f32>,
}

impl MaskedKvCache {
    pub fn new(n_kv: usize, beams: usize, ctx: usize, n_state: usize) -> Self {
        Self {
            data: Array4::zeros((n_kv, beams, ctx, n_state)),
            scratch: Array3::zeros((beams, ctx, n_state)),
        }
    }

    /// Zero every position. Called when a new utterance starts.
    pub fn reset(&mut self) {
        self.data.fill(0.0);
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn shape(&self) -> [usize; 4] {
        let (a, b, c, d) = self.data.dim();
        [a, b, c, d]
    }

    pub fn beam_count(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn ctx(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    /// Write the first `n` positions of `beam` from a prefill output
    /// `(n_kv, 1, n, n_state)`.
    pub fn write_prefill(&mut self, beam: usize, rows: ArrayView4<'_, f32>) -> Result<()> {
        let [n_kv, beams, ctx, n_state] = self.shape();
        let n = rows.len_of(Axis(2));
        if beam >= beams {
            return Err(DecodeError::InvalidState(format!(
                "beam {beam} outside cache of {beams} beams"
            )));
        }
        if n > ctx {
            return Err(DecodeError::ContextExhausted { offset: n, limit: ctx });
        }
        if rows.shape() != [n_kv, 1, n, n_state] {
            return Err(DecodeError::shape("masked_kv_prefill", &[n_kv, 1, n, n_state], rows.shape()));
        }
        self.data
            .slice_mut(s![.., beam, ..n, ..])
            .assign(&rows.index_axis(Axis(1), 0));
        Ok(())
    }

    /// Append the position at `offset` for every beam from a step output
    /// `(n_kv, beam, 1, n_state)`.
    pub fn append(&mut self, offset: usize, rows: ArrayView4<'_, f32>) -> Result<()> {
        let [n_kv, beams, ctx, n_state] = self.shape();
        if offset >= ctx {
            return Err(DecodeError::ContextExhausted { offset, limit: ctx });
        }
        if rows.shape() != [n_kv, beams, 1, n_state] {
            return Err(DecodeError::shape("masked_kv_step", &[n_kv, beams, 1, n_state], rows.shape()));
        }
        self.data
            .slice_mut(s![.., .., offset, ..])
            .assign(&rows.index_axis(Axis(2), 0));
        Ok(())
    }

    /// Replace the whole cache with caller-supplied state.
    pub fn load_from(&mut self, src: ArrayView4<'_, f32>) -> Result<()> {
        if src.shape() != self.data.shape() {
            return Err(DecodeError::shape("masked_kv_caches", self.data.shape(), src.shape()));
        }
        self.data.assign(&src);
        Ok(())
    }

    /// Reorder beams in place: afterwards beam `i` holds what beam
    /// `indices[i]` held before, for positions `< text_offset` of every layer
    /// and both keys and values. Later positions are left untouched.
    pub fn rearrange(&mut self, indices: &[usize], text_offset: usize) -> Result<()> {
        let beams = self.beam_count();
        let ctx = self.ctx();
        validate_indices(indices, beams)?;
        if text_offset > ctx {
            return Err(DecodeError::InvalidRearrange(format!(
                "text offset {text_offset} beyond context {ctx}"
            )));
        }
        if text_offset == 0 || is_identity(indices) {
            return Ok(());
        }

        let Self { data, scratch } = self;
        let mut staged = scratch.slice_mut(s![.., ..text_offset, ..]);
        for mut layer in data.axis_iter_mut(Axis(0)) {
            staged.assign(&layer.slice(s![.., ..text_offset, ..]));
            for (dst, &src) in indices.iter().enumerate() {
                layer
                    .slice_mut(s![dst, ..text_offset, ..])
                    .assign(&staged.slice(s![src, .., ..]));
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_indices(indices: &[usize], beams: usize) -> Result<()> {
    if indices.len() != beams {
        return Err(DecodeError::InvalidRearrange(format!(
            "{} indices for {beams} beams",
            indices.len()
        )));
    }
    if let Some(&bad) = indices.iter().find(|&&i| i >= beams) {
        return Err(DecodeError::InvalidRearrange(format!(
            "source beam {bad} outside [0, {beams})"
        )));
    }
    Ok(())
}

pub(crate) fn is_identity(indices: &[usize]) -> bool {
    indices.iter().enumerate().all(|(i, &src)| i == src)
}

/// Cross-attention keys/values for one utterance.
///
/// Immutable once computed; clones share the same storage, so every beam and
/// both decoders read one copy.
#[derive(Debug, Clone)]
pub struct CrossKvCache {
    utterance: u64,
    data: Arc<Array4<f32>>,
}

impl CrossKvCache {
    pub fn new(utterance: u64, data: Array4<f32>) -> Self {
        Self {
            utterance,
            data: Arc::new(data),
        }
    }

    pub fn utterance(&self) -> u64 {
        self.utterance
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn shares_storage(&self, other: &CrossKvCache) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every entry encodes (kv, beam, position) so moves are traceable.
    fn filled(beams: usize) -> MaskedKvCache {
        let mut cache = MaskedKvCache::new(4, beams, 5, 2);
        let src = Array4::from_shape_fn((4, beams, 5, 2), |(kv, b, p, c)| {
            (kv * 1000 + b * 100 + p * 10 + c) as f32
        });
        cache.load_from(src.view()).expect("load");
        cache
    }

    #[test]
    fn rearrange_moves_occupied_rows_only() {
        let mut cache = filled(3);
        let before = cache.view().to_owned();
        let indices = [2, 0, 1];
        cache.rearrange(&indices, 2).expect("rearrange");
        let after = cache.view();
        for kv in 0..4 {
            for (dst, &src) in indices.iter().enumerate() {
                for p in 0..5 {
                    for c in 0..2 {
                        let expected = if p < 2 {
                            before[[kv, src, p, c]]
                        } else {
                            before[[kv, dst, p, c]]
                        };
                        assert_eq!(after[[kv, dst, p, c]], expected, "kv {kv} beam {dst} pos {p}");
                    }
                }
            }
        }
    }

    #[test]
    fn identity_rearrange_is_byte_identical() {
        let mut cache = filled(3);
        let before = cache.view().to_owned();
        let ptr = cache.view().as_ptr();
        cache.rearrange(&[0, 1, 2], 4).expect("identity");
        assert_eq!(cache.view(), before.view());
        assert_eq!(cache.view().as_ptr(), ptr);
    }

    #[test]
    fn duplicate_sources_are_allowed() {
        let mut cache = filled(3);
        let before = cache.view().to_owned();
        cache.rearrange(&[1, 1, 0], 3).expect("rearrange");
        assert_eq!(cache.view()[[0, 0, 2, 1]], before[[0, 1, 2, 1]]);
        assert_eq!(cache.view()[[3, 2, 0, 0]], before[[3, 0, 0, 0]]);
    }

    #[test]
    fn bad_indices_are_rejected() {
        let mut cache = filled(3);
        assert!(matches!(
            cache.rearrange(&[0, 1], 1),
            Err(DecodeError::InvalidRearrange(_))
        ));
        assert!(matches!(
            cache.rearrange(&[0, 1, 3], 1),
            Err(DecodeError::InvalidRearrange(_))
        ));
        assert!(matches!(
            cache.rearrange(&[0, 1, 2], 6),
            Err(DecodeError::InvalidRearrange(_))
        ));
    }

    #[test]
    fn append_past_context_fails() {
        let mut cache = MaskedKvCache::new(2, 1, 3, 2);
        let row = Array4::<f32>::ones((2, 1, 1, 2));
        cache.append(2, row.view()).expect("last slot");
        assert!(matches!(
            cache.append(3, row.view()),
            Err(DecodeError::ContextExhausted { offset: 3, limit: 3 })
        ));
    }

    #[test]
    fn prefill_rows_land_in_their_beam() {
        let mut cache = MaskedKvCache::new(2, 2, 4, 2);
        let rows = Array4::<f32>::from_elem((2, 1, 3, 2), 7.0);
        cache.write_prefill(1, rows.view()).expect("write");
        let view = cache.view();
        assert_eq!(view[[1, 1, 2, 1]], 7.0);
        assert_eq!(view[[1, 1, 3, 1]], 0.0);
        assert_eq!(view[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn cross_kv_clones_share_storage() {
        let a = CrossKvCache::new(1, Array4::zeros((2, 1, 3, 2)));
        let b = a.clone();
        assert!(a.shares_storage(&b));
        assert_eq!(b.utterance(), 1);
    }
}
