//! STEP: one new token for every beam in a single step-decoder call.

use ndarray::{ArrayView2, ArrayView4, Ix2, Ix3, Ix4};
use tracing::trace;

use super::{DecodeOrchestrator, DecodeOutput, DecodeState, Utterance};
use crate::accelerator::contract::names;
use crate::accelerator::CallControl;
use crate::error::{DecodeError, Result};
use crate::kv_cache::CrossKvCache;
use crate::mask::fill_step_mask;

/// Caller-owned decode state for one step.
///
/// Nothing here touches the orchestrator until the native call has
/// succeeded; a rejected or failed step leaves cache and utterance as they
/// were.
pub(super) struct CallerCaches<'a> {
    pub masked_kv: ArrayView4<'a, f32>,
    /// Set when the step belongs to a different utterance than the current one.
    pub switch_to: Option<CrossKvCache>,
}

impl DecodeOrchestrator {
    pub(super) fn run_step(
        &mut self,
        tokens: ArrayView2<'_, u32>,
        state: &DecodeState,
        caller: Option<CallerCaches<'_>>,
    ) -> Result<DecodeOutput> {
        let (beams, n) = tokens.dim();
        if n != 1 {
            return Err(DecodeError::shape("tokens", &[beams, 1], &[beams, n]));
        }
        let offset = state.text_offset;
        let limit = self.dims.n_text_ctx;
        if offset >= limit {
            return Err(DecodeError::ContextExhausted { offset, limit });
        }

        // Cross-KV, binding flag and next position this step must agree with.
        let (cross_kv, step_bound, next) = match (&caller, self.utterance.as_ref()) {
            (Some(CallerCaches { switch_to: Some(given), .. }), _) => (given.clone(), false, offset),
            (Some(_), Some(u)) => (u.cross_kv.clone(), u.step_bound, offset),
            (None, Some(u)) => (u.cross_kv.clone(), u.step_bound, u.text_offset),
            (_, None) => {
                return Err(DecodeError::InvalidState("step without an active utterance".into()));
            }
        };
        if next == 0 {
            return Err(DecodeError::InvalidState("step before prefill".into()));
        }
        if offset != next {
            return Err(DecodeError::InvalidState(format!(
                "step at text_offset {offset}, but the next position is {next}"
            )));
        }
        if state.is_new_cross_kv == step_bound {
            return Err(DecodeError::CrossKvBinding {
                expected: !step_bound,
                actual: state.is_new_cross_kv,
            });
        }

        let embedded = self.embedding.embed(tokens, offset)?;
        self.step.write_input(names::X, &embedded.view().into_dyn())?;
        fill_step_mask(
            self.step
                .input_mut(names::QK_MASK)?
                .view_mut()
                .into_dimensionality::<Ix2>()?,
            offset,
        )?;

        let masked = caller
            .as_ref()
            .map_or_else(|| self.cache.view(), |c| c.masked_kv.view());
        let control = CallControl {
            text_offset: offset,
            is_new_cross_kv: state.is_new_cross_kv,
        };
        self.step.predict(
            &[
                (names::MASKED_KV, masked.into_dyn()),
                (names::CROSS_KV, cross_kv.view().into_dyn()),
            ],
            control,
            &mut self.instrumentation,
        )?;

        let logits = self
            .step
            .output(names::OUT_LOGITS)?
            .into_dimensionality::<Ix3>()?
            .to_owned();
        let new_rows = self
            .step
            .output(names::OUT_NEW_MASKED_KV)?
            .into_dimensionality::<Ix4>()?;

        if let Some(caller) = caller {
            self.cache.load_from(caller.masked_kv)?;
            if let Some(cross_kv) = caller.switch_to {
                self.utterance = Some(Utterance::fresh(cross_kv));
            }
        }
        self.cache.append(offset, new_rows)?;

        let utterance = self.active_mut()?;
        utterance.touched = true;
        utterance.step_bound = true;
        utterance.text_offset = offset + 1;
        trace!(text_offset = offset, beams, "step complete");

        Ok(DecodeOutput {
            logits,
            cross_attention_weights: None,
            next_state: state.advanced(),
        })
    }
}
