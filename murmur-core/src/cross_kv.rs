//! Cross-attention key/value precompute.
//!
//! Runs the cross-KV model once per utterance and hands out a shared,
//! read-only [`CrossKvCache`]. Beams and decoder calls never trigger a
//! recompute; they clone the cache handle.

use ndarray::{ArrayView3, Ix4};
use tracing::debug;

use crate::accelerator::contract::names;
use crate::accelerator::{AcceleratorModel, CallControl};
use crate::error::Result;
use crate::instrumentation::Instrumentation;
use crate::kv_cache::CrossKvCache;

#[derive(Debug)]
pub struct CrossKvStage {
    model: AcceleratorModel,
    next_utterance: u64,
}

impl CrossKvStage {
    pub fn new(model: AcceleratorModel) -> Self {
        Self {
            model,
            next_utterance: 0,
        }
    }

    /// Derive cross K/V from encoded audio `(1, n_audio_ctx, n_state)` and
    /// start a new utterance with it.
    pub fn compute(&mut self, audio: ArrayView3<'_, f32>, instr: &mut Instrumentation) -> Result<CrossKvCache> {
        self.model.write_input(names::XA, &audio.into_dyn())?;
        self.model.predict(&[], CallControl::default(), instr)?;
        let data = self
            .model
            .output(names::CROSS_KV)?
            .into_dimensionality::<Ix4>()?
            .to_owned();

        self.next_utterance += 1;
        let cache = CrossKvCache::new(self.next_utterance, data);
        debug!(utterance = cache.utterance(), shape = ?cache.shape(), "cross-kv computed");
        Ok(cache)
    }

    pub fn model(&self) -> &AcceleratorModel {
        &self.model
    }

    pub fn close(&mut self) {
        self.model.close();
    }
}
