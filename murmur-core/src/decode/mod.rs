//! Decode orchestrator.
//!
//! Owns the four accelerator models, the masked self-attention cache, and the
//! per-utterance cross-KV binding state. One call to [`DecodeOrchestrator::decode`]
//! is one decode step:
//!
//! ```text
//! PREFILL (offset 0)      one bulk-decoder call per beam, beam 0 binds cross-KV
//!        │                 cache rows [0, n) written, logits for all n tokens
//!        ▼
//! STEP (offset n)         one step-decoder call for the whole beam batch
//!        │                 cache row n appended, logits for the new token
//!        ▼
//! STEP (offset n+1) ...
//! ```
//!
//! Beam search may call [`DecodeOrchestrator::rearrange`] between steps.

mod prefill;
mod state;
mod step;

pub use state::{BeamRearrangeRequest, DecodePhase, DecodeState};

use step::CallerCaches;

use std::sync::Arc;
use std::time::Instant;

use ndarray::{Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Ix3};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::accelerator::contract::names;
use crate::accelerator::{Accelerator, AcceleratorModel, CallControl, ModelKind};
use crate::config::{DecoderConfig, ModelDims};
use crate::cross_kv::CrossKvStage;
use crate::embedding::TokenEmbedder;
use crate::error::{DecodeError, Result};
use crate::instrumentation::Instrumentation;
use crate::kv_cache::{CrossKvCache, MaskedKvCache};

/// Result of one decode step.
#[derive(Debug, Clone)]
pub struct DecodeOutput {
    /// `(beam, n, n_vocab)`: all prompt positions after prefill, `n = 1` after a step.
    pub logits: Array3<f32>,
    /// `(beam, n_alignment_head, n, n_audio_ctx)`, prefill only.
    pub cross_attention_weights: Option<Array4<f32>>,
    /// State the next `decode` call must use.
    pub next_state: DecodeState,
}

/// Everything [`DecodeOrchestrator::predict`] hands back.
#[derive(Debug)]
pub struct Prediction<'a> {
    pub logits: Array3<f32>,
    pub cross_attention_weights: Option<Array4<f32>>,
    /// The masked cache after this call. Borrowed from the orchestrator.
    pub masked_kv: ArrayView4<'a, f32>,
    /// Set when this call derived a new cross-KV cache from audio.
    pub cross_kv: Option<CrossKvCache>,
    pub next_state: DecodeState,
}

#[derive(Debug)]
struct Utterance {
    cross_kv: CrossKvCache,
    /// Next position to be written. 0 until a prefill completes.
    text_offset: usize,
    /// Masked cache has been written since the utterance began.
    touched: bool,
    bulk_bound: bool,
    step_bound: bool,
}

impl Utterance {
    fn fresh(cross_kv: CrossKvCache) -> Self {
        Self {
            cross_kv,
            text_offset: 0,
            touched: false,
            bulk_bound: false,
            step_bound: false,
        }
    }
}

pub struct DecodeOrchestrator {
    dims: ModelDims,
    encoder: AcceleratorModel,
    cross_kv: CrossKvStage,
    bulk: AcceleratorModel,
    step: AcceleratorModel,
    embedding: Box<dyn TokenEmbedder>,
    cache: MaskedKvCache,
    utterance: Option<Utterance>,
    instrumentation: Instrumentation,
}

impl DecodeOrchestrator {
    /// Load all four models and allocate every buffer up front.
    ///
    /// # Errors
    /// Configuration errors, `ModelLoad` for the first model that fails, or
    /// `ShapeMismatch` if `embedding` disagrees with `config.dims`.
    pub fn open(config: &DecoderConfig, accel: &dyn Accelerator, embedding: Box<dyn TokenEmbedder>) -> Result<Self> {
        config.validate()?;
        let dims = config.dims.clone();
        let matrix = embedding.token_matrix();
        if matrix.dim() != (dims.n_vocab, dims.n_state) {
            return Err(DecodeError::shape(
                "token_embedding",
                &[dims.n_vocab, dims.n_state],
                matrix.shape(),
            ));
        }

        let started = Instant::now();
        let mut instrumentation = Instrumentation::new();
        let mut open = |kind| {
            AcceleratorModel::open(
                accel,
                kind,
                &config.model_dir,
                &dims,
                config.input_precision,
                &mut instrumentation,
            )
        };
        let encoder = open(ModelKind::Encoder)?;
        let cross_kv = CrossKvStage::new(open(ModelKind::CrossKv)?);
        let bulk = open(ModelKind::BulkDecoder)?;
        let step = open(ModelKind::StepDecoder)?;
        let cache = MaskedKvCache::new(dims.n_kv(), dims.beam_size, dims.n_text_ctx, dims.n_state);

        info!("=== Decode Orchestrator Ready ===");
        info!("  backend      : {}", accel.name());
        info!("  model dir    : {}", config.model_dir.display());
        info!(
            "  dims         : n_state={} n_layer={} n_head={} n_vocab={} beams={}",
            dims.n_state, dims.n_layer, dims.n_head, dims.n_vocab, dims.beam_size
        );
        info!(
            "  contexts     : audio={} text={} prefill={}",
            dims.n_audio_ctx, dims.n_text_ctx, dims.max_prefill_ctx
        );
        info!("  precision    : {:?} in / F32 out", config.input_precision);
        info!(
            "  masked cache : {:.1} MB",
            (cache.view().len() * std::mem::size_of::<f32>()) as f64 / 1_048_576.0
        );
        info!("  opened in    : {:.1} ms", started.elapsed().as_secs_f64() * 1_000.0);

        Ok(Self {
            dims,
            encoder,
            cross_kv,
            bulk,
            step,
            embedding,
            cache,
            utterance: None,
            instrumentation,
        })
    }

    /// Run the encoder on a mel spectrogram `(1, n_mels, 2·n_audio_ctx)`.
    ///
    /// The returned view points into the encoder's output buffer and is
    /// overwritten by the next `encode`.
    pub fn encode(&mut self, mel: ArrayView3<'_, f32>) -> Result<ArrayView3<'_, f32>> {
        self.encoder.write_input(names::MEL, &mel.into_dyn())?;
        self.encoder
            .predict(&[], CallControl::default(), &mut self.instrumentation)?;
        Ok(self
            .encoder
            .output(names::ENCODER_OUTPUT)?
            .into_dimensionality::<Ix3>()?)
    }

    /// Start a new utterance from encoded audio `(1, n_audio_ctx, n_state)`.
    ///
    /// Cross K/V is derived here and nowhere else. The masked cache is cleared
    /// and both decoders must rebind cross-KV on their first call.
    pub fn begin_utterance(&mut self, audio: ArrayView3<'_, f32>) -> Result<CrossKvCache> {
        let cross_kv = self.cross_kv.compute(audio, &mut self.instrumentation)?;
        self.begin_utterance_with(cross_kv.clone())?;
        Ok(cross_kv)
    }

    /// Start a new utterance with a cross-KV cache computed earlier.
    pub fn begin_utterance_with(&mut self, cross_kv: CrossKvCache) -> Result<()> {
        let expected = [self.dims.n_kv(), 1, self.dims.n_audio_ctx, self.dims.n_state];
        if cross_kv.shape() != expected {
            return Err(DecodeError::shape(names::CROSS_KV, &expected, cross_kv.shape()));
        }
        self.cache.reset();
        debug!(utterance = cross_kv.utterance(), "utterance started");
        self.utterance = Some(Utterance::fresh(cross_kv));
        Ok(())
    }

    /// Run one decode step for `tokens (beam, n)`.
    ///
    /// `n` is the prompt length for prefill and must be 1 for a step.
    pub fn decode(&mut self, tokens: ArrayView2<'_, u32>, state: &DecodeState) -> Result<DecodeOutput> {
        self.check_call(tokens, state)?;
        match state.phase {
            DecodePhase::Prefill => self.run_prefill(tokens, state),
            DecodePhase::Step => self.run_step(tokens, state, None),
        }
    }

    fn check_call(&self, tokens: ArrayView2<'_, u32>, state: &DecodeState) -> Result<()> {
        state.validate()?;
        if state.beam_count != self.dims.beam_size {
            return Err(DecodeError::InvalidState(format!(
                "beam_count {} does not match the compiled beam size {}",
                state.beam_count, self.dims.beam_size
            )));
        }
        if tokens.nrows() != state.beam_count {
            return Err(DecodeError::shape(
                "tokens",
                &[state.beam_count, tokens.ncols()],
                tokens.shape(),
            ));
        }
        Ok(())
    }

    /// Single-call entry point for callers that keep decode state themselves.
    ///
    /// At `text_offset == 0` the call starts an utterance and prefills it:
    /// - `cross_kv` given: decode against that cache.
    /// - `audio_encoding` given: derive cross-KV from it and return the new
    ///   cache in [`Prediction::cross_kv`].
    /// - neither: restart the current utterance.
    ///
    /// `masked_kv` is ignored at offset 0. For a step, `masked_kv` replaces
    /// the orchestrator's cache, and a `cross_kv` that is not the current
    /// cache moves the orchestrator to that utterance. Both take effect only
    /// if the step succeeds. `audio_encoding` on a step is rejected.
    pub fn predict(
        &mut self,
        tokens: ArrayView2<'_, u32>,
        audio_encoding: Option<ArrayView3<'_, f32>>,
        text_offset: usize,
        is_new_cross_kv: bool,
        masked_kv: Option<ArrayView4<'_, f32>>,
        cross_kv: Option<&CrossKvCache>,
    ) -> Result<Prediction<'_>> {
        let state = DecodeState::from_offset(text_offset, self.dims.beam_size, is_new_cross_kv);
        self.check_call(tokens, &state)?;

        if text_offset == 0 {
            // Every prefill through here runs on a freshly started utterance.
            self.check_prompt_len(tokens.ncols())?;
            if !is_new_cross_kv {
                return Err(DecodeError::CrossKvBinding {
                    expected: true,
                    actual: false,
                });
            }
            let derived = match (cross_kv, audio_encoding) {
                (Some(given), _) => {
                    self.begin_utterance_with(given.clone())?;
                    None
                }
                (None, Some(audio)) => Some(self.begin_utterance(audio)?),
                (None, None) => {
                    let current = self.active()?.cross_kv.clone();
                    self.begin_utterance_with(current)?;
                    None
                }
            };
            let output = self.run_prefill(tokens, &state)?;
            return Ok(self.prediction(output, derived));
        }

        if audio_encoding.is_some() {
            return Err(DecodeError::InvalidState(format!(
                "audio_encoding is only accepted at text_offset 0, got {text_offset}"
            )));
        }
        let switch_to = cross_kv
            .filter(|given| self.cross_kv().map_or(true, |current| !current.shares_storage(given)))
            .cloned();
        if let Some(given) = &switch_to {
            let expected = [self.dims.n_kv(), 1, self.dims.n_audio_ctx, self.dims.n_state];
            if given.shape() != expected {
                return Err(DecodeError::shape(names::CROSS_KV, &expected, given.shape()));
            }
        }
        let caller = match (masked_kv, switch_to) {
            (Some(masked_kv), switch_to) => Some(CallerCaches { masked_kv, switch_to }),
            (None, Some(_)) => {
                return Err(DecodeError::InvalidState(
                    "a step on another utterance's cross-KV needs that utterance's masked cache".into(),
                ));
            }
            (None, None) => None,
        };
        let output = self.run_step(tokens, &state, caller)?;
        Ok(self.prediction(output, None))
    }

    fn prediction(&self, output: DecodeOutput, cross_kv: Option<CrossKvCache>) -> Prediction<'_> {
        Prediction {
            logits: output.logits,
            cross_attention_weights: output.cross_attention_weights,
            masked_kv: self.cache.view(),
            cross_kv,
            next_state: output.next_state,
        }
    }

    /// Reorder cached beams in place before the next step.
    pub fn rearrange(&mut self, request: &BeamRearrangeRequest) -> Result<()> {
        let written = self.active()?.text_offset;
        request.validate(self.dims.beam_size)?;
        if request.text_offset > written {
            return Err(DecodeError::InvalidRearrange(format!(
                "text offset {} beyond the {written} positions written",
                request.text_offset
            )));
        }
        if request.is_identity() {
            return Ok(());
        }
        let started = Instant::now();
        self.cache.rearrange(&request.indices, request.text_offset)?;
        self.instrumentation.record_rearrange(started.elapsed());
        debug!(indices = ?request.indices, text_offset = request.text_offset, "beams rearranged");
        Ok(())
    }

    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    pub fn masked_kv(&self) -> ArrayView4<'_, f32> {
        self.cache.view()
    }

    pub fn cross_kv(&self) -> Option<&CrossKvCache> {
        self.utterance.as_ref().map(|u| &u.cross_kv)
    }

    /// Next text position to be written, if an utterance is active.
    pub fn text_offset(&self) -> Option<usize> {
        self.utterance.as_ref().map(|u| u.text_offset)
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    pub fn take_instrumentation(&mut self) -> Instrumentation {
        self.instrumentation.take()
    }

    pub fn model(&self, kind: ModelKind) -> &AcceleratorModel {
        match kind {
            ModelKind::Encoder => &self.encoder,
            ModelKind::CrossKv => self.cross_kv.model(),
            ModelKind::BulkDecoder => &self.bulk,
            ModelKind::StepDecoder => &self.step,
        }
    }

    /// Close every model. Later calls fail with `ModelNotLoaded`.
    pub fn close(&mut self) {
        self.utterance = None;
        self.encoder.close();
        self.cross_kv.close();
        self.bulk.close();
        self.step.close();
        debug!("orchestrator closed");
    }

    fn active(&self) -> Result<&Utterance> {
        self.utterance
            .as_ref()
            .ok_or_else(|| DecodeError::InvalidState("no active utterance".into()))
    }

    fn active_mut(&mut self) -> Result<&mut Utterance> {
        self.utterance
            .as_mut()
            .ok_or_else(|| DecodeError::InvalidState("no active utterance".into()))
    }
}

impl std::fmt::Debug for DecodeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeOrchestrator")
            .field("dims", &self.dims)
            .field("utterance", &self.utterance)
            .finish_non_exhaustive()
    }
}

/// Thread-safe reference-counted handle to a [`DecodeOrchestrator`].
///
/// Access stays serialized: every call takes the lock for its whole duration.
#[derive(Clone)]
pub struct OrchestratorHandle(pub Arc<Mutex<DecodeOrchestrator>>);

impl OrchestratorHandle {
    pub fn new(orchestrator: DecodeOrchestrator) -> Self {
        Self(Arc::new(Mutex::new(orchestrator)))
    }

    pub fn lock(&self) -> MutexGuard<'_, DecodeOrchestrator> {
        self.0.lock()
    }
}

impl std::fmt::Debug for OrchestratorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorHandle").finish_non_exhaustive()
    }
}
