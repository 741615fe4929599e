//! Token embedding collaborator.
//!
//! The accelerator decoders take already-embedded inputs. Token ids come from
//! the tokenizer and beam search outside this crate; turning them into
//! `token + positional` embeddings, and exposing the token matrix for the
//! vocabulary projection, is the job of a [`TokenEmbedder`].

use ndarray::{s, Array2, Array3, ArrayView2};

use crate::config::ModelDims;
use crate::error::{DecodeError, Result};

pub trait TokenEmbedder: Send {
    /// Embed `tokens (beam, n)` starting at text position `offset`.
    ///
    /// Returns `(beam, n, n_state)`.
    fn embed(&self, tokens: ArrayView2<'_, u32>, offset: usize) -> Result<Array3<f32>>;

    /// `(n_vocab, n_state)` matrix the hidden state is projected against.
    fn token_matrix(&self) -> ArrayView2<'_, f32>;
}

/// Dense token and positional embedding tables.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    token: Array2<f32>,
    positional: Array2<f32>,
}

impl EmbeddingTable {
    pub fn new(token: Array2<f32>, positional: Array2<f32>) -> Result<Self> {
        if token.ncols() != positional.ncols() {
            return Err(DecodeError::shape(
                "positional_embedding",
                &[positional.nrows(), token.ncols()],
                positional.shape(),
            ));
        }
        if token.nrows() == 0 || positional.nrows() == 0 {
            return Err(DecodeError::Config("embedding tables must not be empty".into()));
        }
        Ok(Self { token, positional })
    }

    /// Deterministic tables sized from `dims`, for tests and benchmarks.
    pub fn synthetic(dims: &ModelDims) -> Self {
        let scale = 1.0 / (dims.n_state as f32).sqrt();
        let token = Array2::from_shape_fn((dims.n_vocab, dims.n_state), |(v, c)| {
            (((v * 13 + c * 7) % 29) as f32 / 29.0 - 0.5) * scale
        });
        let positional = Array2::from_shape_fn((dims.n_text_ctx, dims.n_state), |(p, c)| {
            let angle = p as f32 / 10_000f32.powf(2.0 * (c / 2) as f32 / dims.n_state as f32);
            if c % 2 == 0 {
                angle.sin()
            } else {
                angle.cos()
            }
        });
        Self { token, positional }
    }

    pub fn n_vocab(&self) -> usize {
        self.token.nrows()
    }

    pub fn n_ctx(&self) -> usize {
        self.positional.nrows()
    }
}

impl TokenEmbedder for EmbeddingTable {
    fn embed(&self, tokens: ArrayView2<'_, u32>, offset: usize) -> Result<Array3<f32>> {
        let (beams, n) = tokens.dim();
        let limit = self.n_ctx();
        if offset + n > limit {
            return Err(DecodeError::ContextExhausted {
                offset: offset + n,
                limit,
            });
        }
        let vocab = self.n_vocab();
        let mut out = Array3::<f32>::zeros((beams, n, self.token.ncols()));
        for ((b, i), &token) in tokens.indexed_iter() {
            if token as usize >= vocab {
                return Err(DecodeError::InvalidToken { token, vocab });
            }
            let mut row = out.slice_mut(s![b, i, ..]);
            row.assign(&self.token.row(token as usize));
            row += &self.positional.row(offset + i);
        }
        Ok(out)
    }

    fn token_matrix(&self) -> ArrayView2<'_, f32> {
        self.token.view()
    }
}
