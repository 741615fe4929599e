//! Declared tensor shapes for each model kind.
//!
//! | Kind          | Inputs                                              | Outputs |
//! |---------------|-----------------------------------------------------|---------|
//! | Encoder       | `mel [1, n_mels, 2·n_audio]`                        | `encoder_output [1, n_audio, n_state]` |
//! | CrossKv       | `xa [1, n_audio, n_state]`                          | `cross_kv_caches [2·n_layer, 1, n_audio, n_state]` |
//! | BulkDecoder   | `x [1, P, n_state]`, `qk_mask [P, P]`, `cross_kv_caches`* | `out_x [1, P, n_state]`, `out_cross_head_weights [n_align, P, n_audio]`, `out_new_masked_kv_caches [2·n_layer, 1, P, n_state]` |
//! | StepDecoder   | `x [B, 1, n_state]`, `qk_mask [1, C+1]`, `masked_kv_caches [2·n_layer, B, C, n_state]`*, `cross_kv_caches`* | `out_logits [B, 1, n_vocab]`, `out_new_masked_kv_caches [2·n_layer, B, 1, n_state]` |
//!
//! `P` = `max_prefill_ctx`, `B` = `beam_size`, `C` = `n_text_ctx`.
//! Inputs marked * live in caller-owned storage and are passed per call.
//! KV tensors put keys at even indices of the first axis and values at odd.

use crate::accelerator::ModelKind;
use crate::buffer::{BufferRole, ElementType};
use crate::config::ModelDims;
use crate::error::{DecodeError, Result};

pub mod names {
    pub const MEL: &str = "mel";
    pub const ENCODER_OUTPUT: &str = "encoder_output";
    pub const XA: &str = "xa";
    pub const CROSS_KV: &str = "cross_kv_caches";
    pub const X: &str = "x";
    pub const QK_MASK: &str = "qk_mask";
    pub const MASKED_KV: &str = "masked_kv_caches";
    pub const OUT_X: &str = "out_x";
    pub const OUT_CROSS_HEAD_WEIGHTS: &str = "out_cross_head_weights";
    pub const OUT_NEW_MASKED_KV: &str = "out_new_masked_kv_caches";
    pub const OUT_LOGITS: &str = "out_logits";
    /// Optional scalar inputs a graph may declare.
    pub const TEXT_OFFSET: &str = "text_offset";
    pub const IS_NEW_CROSS_KV: &str = "is_new_cross_kv";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputBinding {
    /// Staged in the model's own arena buffer.
    Arena,
    /// Passed per call from storage the orchestrator owns (KV caches).
    Caller,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: &'static str,
    pub shape: Vec<usize>,
    pub dtype: ElementType,
    pub role: BufferRole,
    pub binding: InputBinding,
}

impl TensorSpec {
    fn input(name: &'static str, shape: Vec<usize>, dtype: ElementType, binding: InputBinding) -> Self {
        Self {
            name,
            shape,
            dtype,
            role: BufferRole::Input,
            binding,
        }
    }

    fn output(name: &'static str, shape: Vec<usize>) -> Self {
        Self {
            name,
            shape,
            dtype: ElementType::F32,
            role: BufferRole::Output,
            binding: InputBinding::Arena,
        }
    }
}

/// Every tensor one model kind reads or writes, with fixed shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeContract {
    kind: ModelKind,
    tensors: Vec<TensorSpec>,
}

impl ShapeContract {
    pub fn for_kind(kind: ModelKind, dims: &ModelDims, input_precision: ElementType) -> Self {
        use names::*;
        use InputBinding::{Arena, Caller};

        let n_state = dims.n_state;
        let n_audio = dims.n_audio_ctx;
        let n_kv = dims.n_kv();
        let p = dims.max_prefill_ctx;
        let b = dims.beam_size;
        let c = dims.n_text_ctx;
        let dt = input_precision;
        let cross_kv = || TensorSpec::input(CROSS_KV, vec![n_kv, 1, n_audio, n_state], dt, Caller);

        let tensors = match kind {
            ModelKind::Encoder => vec![
                TensorSpec::input(MEL, vec![1, dims.n_mels, dims.n_mel_frames()], dt, Arena),
                TensorSpec::output(ENCODER_OUTPUT, vec![1, n_audio, n_state]),
            ],
            ModelKind::CrossKv => vec![
                TensorSpec::input(XA, vec![1, n_audio, n_state], dt, Arena),
                TensorSpec::output(CROSS_KV, vec![n_kv, 1, n_audio, n_state]),
            ],
            ModelKind::BulkDecoder => {
                let mut tensors = vec![
                    TensorSpec::input(X, vec![1, p, n_state], dt, Arena),
                    TensorSpec::input(QK_MASK, vec![p, p], dt, Arena),
                    cross_kv(),
                    TensorSpec::output(OUT_X, vec![1, p, n_state]),
                ];
                if dims.n_alignment_head > 0 {
                    tensors.push(TensorSpec::output(
                        OUT_CROSS_HEAD_WEIGHTS,
                        vec![dims.n_alignment_head, p, n_audio],
                    ));
                }
                tensors.push(TensorSpec::output(OUT_NEW_MASKED_KV, vec![n_kv, 1, p, n_state]));
                tensors
            }
            ModelKind::StepDecoder => vec![
                TensorSpec::input(X, vec![b, 1, n_state], dt, Arena),
                TensorSpec::input(QK_MASK, vec![1, c + 1], dt, Arena),
                TensorSpec::input(MASKED_KV, vec![n_kv, b, c, n_state], dt, Caller),
                cross_kv(),
                TensorSpec::output(OUT_LOGITS, vec![b, 1, dims.n_vocab]),
                TensorSpec::output(OUT_NEW_MASKED_KV, vec![n_kv, b, 1, n_state]),
            ],
        };

        Self { kind, tensors }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn tensors(&self) -> &[TensorSpec] {
        &self.tensors
    }

    pub fn inputs(&self) -> impl Iterator<Item = &TensorSpec> {
        self.tensors.iter().filter(|t| t.role == BufferRole::Input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &TensorSpec> {
        self.tensors.iter().filter(|t| t.role == BufferRole::Output)
    }

    pub fn spec(&self, name: &str) -> Option<&TensorSpec> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs().any(|t| t.name == name)
    }

    /// Fail with `ShapeMismatch` unless `shape` is exactly the declared one.
    pub fn check(&self, name: &str, shape: &[usize]) -> Result<()> {
        let spec = self.spec(name).ok_or_else(|| {
            DecodeError::InvalidState(format!("{} has no tensor named `{name}`", self.kind))
        })?;
        if spec.shape != shape {
            return Err(DecodeError::shape(name, &spec.shape, shape));
        }
        Ok(())
    }
}
