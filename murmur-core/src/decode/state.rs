use serde::Serialize;

use crate::error::{DecodeError, Result};
use crate::kv_cache::{is_identity, validate_indices};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DecodePhase {
    /// First call of an utterance: the whole prompt through the bulk decoder.
    Prefill,
    /// One token per call through the step decoder.
    Step,
}

/// Where a decode call sits in the utterance, passed explicitly by the caller.
///
/// Every successful call returns the state the next call must use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeState {
    pub phase: DecodePhase,
    pub text_offset: usize,
    pub beam_count: usize,
    /// Bind the shared cross-KV on the decoder this call runs on.
    pub is_new_cross_kv: bool,
}

impl DecodeState {
    pub fn prefill(beam_count: usize) -> Self {
        Self {
            phase: DecodePhase::Prefill,
            text_offset: 0,
            beam_count,
            is_new_cross_kv: true,
        }
    }

    pub fn step(text_offset: usize, beam_count: usize, is_new_cross_kv: bool) -> Self {
        Self {
            phase: DecodePhase::Step,
            text_offset,
            beam_count,
            is_new_cross_kv,
        }
    }

    /// Offset 0 is prefill, anything else is a step.
    pub fn from_offset(text_offset: usize, beam_count: usize, is_new_cross_kv: bool) -> Self {
        if text_offset == 0 {
            Self {
                is_new_cross_kv,
                ..Self::prefill(beam_count)
            }
        } else {
            Self::step(text_offset, beam_count, is_new_cross_kv)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.beam_count == 0 {
            return Err(DecodeError::InvalidState("beam_count must be non-zero".into()));
        }
        match (self.phase, self.text_offset) {
            (DecodePhase::Prefill, 0) => Ok(()),
            (DecodePhase::Prefill, offset) => Err(DecodeError::InvalidState(format!(
                "prefill requires text_offset 0, got {offset}"
            ))),
            (DecodePhase::Step, 0) => Err(DecodeError::InvalidState(
                "step requires a non-zero text_offset".into(),
            )),
            (DecodePhase::Step, _) => Ok(()),
        }
    }

    /// State for the call after this step.
    pub(crate) fn advanced(&self) -> Self {
        Self::step(self.text_offset + 1, self.beam_count, false)
    }
}

/// Beam reordering requested by beam search between steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeamRearrangeRequest {
    /// `indices[i]` is the beam whose cache row becomes row `i`.
    pub indices: Vec<usize>,
    pub text_offset: usize,
}

impl BeamRearrangeRequest {
    pub fn new(indices: Vec<usize>, text_offset: usize) -> Self {
        Self { indices, text_offset }
    }

    pub fn identity(beam_count: usize, text_offset: usize) -> Self {
        Self {
            indices: (0..beam_count).collect(),
            text_offset,
        }
    }

    pub fn is_identity(&self) -> bool {
        is_identity(&self.indices)
    }

    pub fn validate(&self, beam_count: usize) -> Result<()> {
        validate_indices(&self.indices, beam_count)
    }
}
