//! Accelerator abstraction.
//!
//! The heavy tensor math runs inside pre-compiled native models. Code in this
//! crate never looks inside them: it hands over fixed-shape buffers, waits for
//! the call to return, and reads the filled outputs.
//!
//! - [`Accelerator`] loads a native model for a [`ModelKind`] (the seam where
//!   backends plug in: [`StubAccelerator`], `OnnxAccelerator`).
//! - [`NativeModel`] is one loaded model: `predict` + `close`.
//! - [`AcceleratorModel`] wraps a native model with its shape contract,
//!   buffer arena, and timing.

pub mod contract;
pub mod handle;
pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::OnnxAccelerator;

pub use contract::{InputBinding, ShapeContract, TensorSpec};
pub use handle::AcceleratorModel;
pub use stub::{StubAccelerator, StubCall, StubLog};

use std::fmt;
use std::path::Path;

use ndarray::ArrayViewD;
use serde::Serialize;

use crate::buffer::{BufferDescriptor, ElementType};
use crate::error::{DecodeError, Result};

/// The four native models the decode pipeline drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelKind {
    /// Mel spectrogram → encoded audio.
    Encoder,
    /// Encoded audio → cross-attention keys/values.
    CrossKv,
    /// Up to `max_prefill_ctx` tokens, one beam per call.
    BulkDecoder,
    /// Exactly one token, all beams batched.
    StepDecoder,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Encoder,
        ModelKind::CrossKv,
        ModelKind::BulkDecoder,
        ModelKind::StepDecoder,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            ModelKind::Encoder => "encoder.onnx",
            ModelKind::CrossKv => "cross_kv.onnx",
            ModelKind::BulkDecoder => "decoder_prefill.onnx",
            ModelKind::StepDecoder => "decoder_step.onnx",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            ModelKind::Encoder => 0,
            ModelKind::CrossKv => 1,
            ModelKind::BulkDecoder => 2,
            ModelKind::StepDecoder => 3,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelKind::Encoder => "encoder",
            ModelKind::CrossKv => "cross-kv",
            ModelKind::BulkDecoder => "prefill decoder",
            ModelKind::StepDecoder => "step decoder",
        })
    }
}

/// Scalar arguments passed alongside the tensors of one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallControl {
    pub text_offset: usize,
    /// Bind the cross-KV tensors passed with this call instead of reusing the
    /// ones bound by an earlier call on the same native model.
    pub is_new_cross_kv: bool,
}

/// A contiguous input tensor handed to a native model.
#[derive(Debug)]
pub struct NamedTensor<'a> {
    pub name: &'a str,
    pub dtype: ElementType,
    pub view: ArrayViewD<'a, f32>,
}

/// One loaded native model.
///
/// `predict` receives contiguous inputs whose shapes already match the
/// contract and must fill every output buffer in place.
pub trait NativeModel: Send {
    fn predict(
        &mut self,
        inputs: &[NamedTensor<'_>],
        outputs: &mut [BufferDescriptor],
        control: CallControl,
    ) -> Result<()>;

    /// Release native resources. Further `predict` calls must fail.
    fn close(&mut self);
}

/// Backend capable of loading native models.
pub trait Accelerator {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Load the model for `kind` from `path`.
    ///
    /// # Errors
    /// `DecodeError::ModelLoad` if the file is missing, corrupt, or its
    /// declared tensors disagree with `contract`.
    fn load(&self, kind: ModelKind, path: &Path, contract: &ShapeContract)
        -> Result<Box<dyn NativeModel>>;
}

/// Look up an input by name.
pub fn named_input<'b, 'a>(inputs: &'b [NamedTensor<'a>], name: &str) -> Result<&'b ArrayViewD<'a, f32>> {
    inputs
        .iter()
        .find(|t| t.name == name)
        .map(|t| &t.view)
        .ok_or_else(|| DecodeError::Accelerator(format!("missing input `{name}`")))
}

/// Look up an output buffer by name.
pub fn output_buffer<'b>(outputs: &'b mut [BufferDescriptor], name: &str) -> Result<&'b mut BufferDescriptor> {
    outputs
        .iter_mut()
        .find(|b| b.name() == name)
        .ok_or_else(|| DecodeError::Accelerator(format!("missing output `{name}`")))
}
