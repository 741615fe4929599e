//! PREFILL: the whole prompt through the bulk decoder.
//!
//! The bulk decoder is compiled for a single beam, so the beam batch is
//! split into one call per beam. Beam 0 runs first and is the only call that
//! binds cross-KV; later beams reuse that binding. Outputs are gathered back
//! along the beam axis in beam order.

use ndarray::{s, Array3, Array4, ArrayView2, Axis, Ix2, Ix3, Ix4};
use tracing::debug;

use super::{DecodeOrchestrator, DecodeOutput, DecodeState};
use crate::accelerator::contract::names;
use crate::accelerator::CallControl;
use crate::error::{DecodeError, Result};
use crate::logits::project_chunked;
use crate::mask::fill_prefill_mask;

impl DecodeOrchestrator {
    pub(super) fn check_prompt_len(&self, n: usize) -> Result<()> {
        let window = self.dims.max_prefill_ctx;
        if n == 0 || n > window {
            return Err(DecodeError::InvalidState(format!(
                "prefill takes 1..={window} tokens, got {n}"
            )));
        }
        Ok(())
    }

    pub(super) fn run_prefill(&mut self, tokens: ArrayView2<'_, u32>, state: &DecodeState) -> Result<DecodeOutput> {
        let (beams, n) = tokens.dim();
        self.check_prompt_len(n)?;

        let utterance = self
            .utterance
            .as_mut()
            .ok_or_else(|| DecodeError::InvalidState("prefill without an active utterance".into()))?;
        if utterance.touched {
            // Back at offset 0 on a used cache: nothing from the previous
            // pass may be visible, and both decoders rebind cross-KV.
            self.cache.reset();
            utterance.text_offset = 0;
            utterance.bulk_bound = false;
            utterance.step_bound = false;
            debug!(utterance = utterance.cross_kv.utterance(), "prefill re-entered; cache reset");
        }
        if state.is_new_cross_kv == utterance.bulk_bound {
            return Err(DecodeError::CrossKvBinding {
                expected: !utterance.bulk_bound,
                actual: state.is_new_cross_kv,
            });
        }

        let embedded = self.embedding.embed(tokens, 0)?;
        let cross_kv = utterance.cross_kv.clone();
        utterance.touched = true;

        fill_prefill_mask(
            self.bulk
                .input_mut(names::QK_MASK)?
                .view_mut()
                .into_dimensionality::<Ix2>()?,
            n,
        )?;

        let n_state = self.dims.n_state;
        let n_heads = self.dims.n_alignment_head;
        let mut hidden = Array3::<f32>::zeros((beams, n, n_state));
        let mut weights = (n_heads > 0).then(|| Array4::<f32>::zeros((beams, n_heads, n, self.dims.n_audio_ctx)));

        for beam in 0..beams {
            {
                let mut x = self
                    .bulk
                    .input_mut(names::X)?
                    .view_mut()
                    .into_dimensionality::<Ix3>()?;
                x.fill(0.0);
                x.slice_mut(s![0, ..n, ..])
                    .assign(&embedded.index_axis(Axis(0), beam));
            }

            let control = CallControl {
                text_offset: 0,
                is_new_cross_kv: beam == 0,
            };
            self.bulk.predict(
                &[(names::CROSS_KV, cross_kv.view().into_dyn())],
                control,
                &mut self.instrumentation,
            )?;

            let out_x = self.bulk.output(names::OUT_X)?.into_dimensionality::<Ix3>()?;
            hidden
                .index_axis_mut(Axis(0), beam)
                .assign(&out_x.slice(s![0, ..n, ..]));

            if let Some(weights) = weights.as_mut() {
                let w = self
                    .bulk
                    .output(names::OUT_CROSS_HEAD_WEIGHTS)?
                    .into_dimensionality::<Ix3>()?;
                weights
                    .index_axis_mut(Axis(0), beam)
                    .assign(&w.slice(s![.., ..n, ..]));
            }

            let kv = self
                .bulk
                .output(names::OUT_NEW_MASKED_KV)?
                .into_dimensionality::<Ix4>()?;
            self.cache.write_prefill(beam, kv.slice(s![.., .., ..n, ..]))?;
        }

        let logits = project_chunked(hidden.view(), self.embedding.token_matrix(), self.dims.logits_chunks)?;

        let utterance = self.active_mut()?;
        utterance.bulk_bound = true;
        utterance.text_offset = n;
        let next_state = DecodeState::step(n, beams, !utterance.step_bound);
        debug!(tokens = n, beams, "prefill complete");

        Ok(DecodeOutput {
            logits,
            cross_attention_weights: weights,
            next_state,
        })
    }
}
