use std::path::PathBuf;

use thiserror::Error;

use crate::accelerator::ModelKind;

/// All errors produced by murmur-core.
///
/// Every variant aborts the decode step that raised it. Nothing at this layer
/// is retried; retries belong to the beam-search or transcription caller.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to load {kind} model from {path}: {reason}")]
    ModelLoad {
        kind: ModelKind,
        path: PathBuf,
        reason: String,
    },

    #[error("{kind} model used while not loaded")]
    ModelNotLoaded { kind: ModelKind },

    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("vocabulary size {vocab} cannot be split into {chunks} equal chunks")]
    VocabularyChunking { vocab: usize, chunks: usize },

    #[error("invalid decode state: {0}")]
    InvalidState(String),

    #[error("cross-kv binding violated: expected is_new_cross_kv={expected}, got {actual}")]
    CrossKvBinding { expected: bool, actual: bool },

    #[error("text context exhausted: offset {offset} reached limit {limit}")]
    ContextExhausted { offset: usize, limit: usize },

    #[error("token id {token} outside vocabulary of {vocab}")]
    InvalidToken { token: u32, vocab: usize },

    #[error("invalid beam rearrangement: {0}")]
    InvalidRearrange(String),

    #[error("tensor layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),

    #[error("accelerator error: {0}")]
    Accelerator(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DecodeError {
    pub(crate) fn shape(name: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        DecodeError::ShapeMismatch {
            name: name.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;
