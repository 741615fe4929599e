//! Deterministic in-process accelerator.
//!
//! Used by tests and the benchmark so the orchestrator can be driven
//! end-to-end without model files. The arithmetic is not a transformer, but
//! it honours the parts of the contract the orchestrator depends on:
//!
//! - every output buffer is fully overwritten on each call
//! - decoders only see masked-in positions (`-inf` columns are skipped)
//! - cross-KV must be bound (`is_new_cross_kv = true`) on a model before a
//!   call may rely on it, and the binding is per native model
//! - new self-attention KV rows are never zero, so tests can tell written
//!   cache positions from untouched ones
//! - calls after `close` fail

use std::path::Path;
use std::sync::Arc;

use ndarray::{ArrayViewD, Axis, Ix2, Ix3, Ix4};
use parking_lot::Mutex;
use tracing::debug;

use crate::accelerator::contract::{names, ShapeContract};
use crate::accelerator::{
    named_input, output_buffer, Accelerator, CallControl, ModelKind, NamedTensor, NativeModel,
};
use crate::buffer::BufferDescriptor;
use crate::error::{DecodeError, Result};

/// One recorded `predict` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubCall {
    pub kind: ModelKind,
    pub text_offset: usize,
    pub is_new_cross_kv: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StubLog {
    pub loads: Vec<ModelKind>,
    pub closes: Vec<ModelKind>,
    pub calls: Vec<StubCall>,
}

#[derive(Debug, Clone, Default)]
pub struct StubAccelerator {
    log: Arc<Mutex<StubLog>>,
    fail_load: Option<ModelKind>,
}

impl StubAccelerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stub that refuses to load `kind`, as if its model file were corrupt.
    pub fn failing_load(kind: ModelKind) -> Self {
        Self {
            log: Arc::default(),
            fail_load: Some(kind),
        }
    }

    /// Snapshot of everything recorded so far.
    pub fn log(&self) -> StubLog {
        self.log.lock().clone()
    }

    pub fn calls(&self, kind: ModelKind) -> Vec<StubCall> {
        self.log
            .lock()
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .copied()
            .collect()
    }
}

impl Accelerator for StubAccelerator {
    fn name(&self) -> &str {
        "stub"
    }

    fn load(&self, kind: ModelKind, path: &Path, contract: &ShapeContract) -> Result<Box<dyn NativeModel>> {
        if self.fail_load == Some(kind) {
            return Err(DecodeError::ModelLoad {
                kind,
                path: path.to_path_buf(),
                reason: "stub configured to fail".into(),
            });
        }
        debug!(model = %kind, tensors = contract.tensors().len(), "stub load");
        self.log.lock().loads.push(kind);
        Ok(Box::new(StubModel {
            kind,
            log: Arc::clone(&self.log),
            bound: None,
            open: true,
        }))
    }
}

struct StubModel {
    kind: ModelKind,
    log: Arc<Mutex<StubLog>>,
    /// Per-channel mean of the bound cross-KV keys of layer 0.
    bound: Option<Vec<f32>>,
    open: bool,
}

impl NativeModel for StubModel {
    fn predict(
        &mut self,
        inputs: &[NamedTensor<'_>],
        outputs: &mut [BufferDescriptor],
        control: CallControl,
    ) -> Result<()> {
        if !self.open {
            return Err(DecodeError::ModelNotLoaded { kind: self.kind });
        }
        self.log.lock().calls.push(StubCall {
            kind: self.kind,
            text_offset: control.text_offset,
            is_new_cross_kv: control.is_new_cross_kv,
        });
        match self.kind {
            ModelKind::Encoder => encode(inputs, outputs),
            ModelKind::CrossKv => cross_kv(inputs, outputs),
            ModelKind::BulkDecoder => {
                self.bind(inputs, control)?;
                let bound = self.bound.as_deref().unwrap_or_default();
                decode_bulk(inputs, outputs, bound)
            }
            ModelKind::StepDecoder => {
                self.bind(inputs, control)?;
                let bound = self.bound.as_deref().unwrap_or_default();
                decode_step(inputs, outputs, bound, control.text_offset)
            }
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.bound = None;
            self.log.lock().closes.push(self.kind);
        }
    }
}

impl StubModel {
    fn bind(&mut self, inputs: &[NamedTensor<'_>], control: CallControl) -> Result<()> {
        if control.is_new_cross_kv {
            let cross = as4(named_input(inputs, names::CROSS_KV)?)?;
            let keys = cross.index_axis(Axis(0), 0);
            let keys = keys.index_axis(Axis(0), 0);
            let summary = keys
                .mean_axis(Axis(0))
                .ok_or_else(|| DecodeError::Accelerator("empty cross-kv".into()))?;
            self.bound = Some(summary.to_vec());
        } else if self.bound.is_none() {
            return Err(DecodeError::Accelerator(format!(
                "{} called without a bound cross-kv",
                self.kind
            )));
        }
        Ok(())
    }
}

fn as2<'a>(v: &ArrayViewD<'a, f32>) -> Result<ndarray::ArrayView2<'a, f32>> {
    v.clone()
        .into_dimensionality::<Ix2>()
        .map_err(|e| DecodeError::Accelerator(e.to_string()))
}

fn as3<'a>(v: &ArrayViewD<'a, f32>) -> Result<ndarray::ArrayView3<'a, f32>> {
    v.clone()
        .into_dimensionality::<Ix3>()
        .map_err(|e| DecodeError::Accelerator(e.to_string()))
}

fn as4<'a>(v: &ArrayViewD<'a, f32>) -> Result<ndarray::ArrayView4<'a, f32>> {
    v.clone()
        .into_dimensionality::<Ix4>()
        .map_err(|e| DecodeError::Accelerator(e.to_string()))
}

fn new_kv_value(kv: usize, x: f32) -> f32 {
    1.0 + (kv / 2 + 1) as f32 * x.abs() + (kv % 2) as f32 * 0.5
}

/// Stand-in for the output projection baked into the step decoder.
fn projection(v: usize, c: usize) -> f32 {
    ((v * 31 + c * 17) % 23) as f32 / 23.0 - 0.5
}

fn encode(inputs: &[NamedTensor<'_>], outputs: &mut [BufferDescriptor]) -> Result<()> {
    let mel = as3(named_input(inputs, names::MEL)?)?;
    let (n_mels, frames) = (mel.shape()[1], mel.shape()[2]);
    let out = output_buffer(outputs, names::ENCODER_OUTPUT)?;
    for (ix, v) in out.view_mut().indexed_iter_mut() {
        let (t, c) = (ix[1], ix[2]);
        let frame = (2 * t).min(frames.saturating_sub(1));
        *v = 0.5 * mel[[0, c % n_mels, frame]] + 0.01 * (c % 7) as f32;
    }
    Ok(())
}

fn cross_kv(inputs: &[NamedTensor<'_>], outputs: &mut [BufferDescriptor]) -> Result<()> {
    let xa = as3(named_input(inputs, names::XA)?)?;
    let out = output_buffer(outputs, names::CROSS_KV)?;
    for (ix, v) in out.view_mut().indexed_iter_mut() {
        let (kv, t, c) = (ix[0], ix[2], ix[3]);
        *v = xa[[0, t, c]] * (1 + kv / 2) as f32 + (kv % 2) as f32 * 0.25;
    }
    Ok(())
}

fn decode_bulk(inputs: &[NamedTensor<'_>], outputs: &mut [BufferDescriptor], bound: &[f32]) -> Result<()> {
    let x = as3(named_input(inputs, names::X)?)?;
    let mask = as2(named_input(inputs, names::QK_MASK)?)?;
    let (p, n_state) = (x.shape()[1], x.shape()[2]);

    {
        let out_x = output_buffer(outputs, names::OUT_X)?;
        let mut out_x = out_x.view_mut();
        for row in 0..p {
            let allowed: Vec<usize> = (0..p).filter(|&col| mask[[row, col]].is_finite()).collect();
            for c in 0..n_state {
                let sum: f32 = allowed.iter().map(|&j| x[[0, j, c]]).sum();
                let mean = if allowed.is_empty() { 0.0 } else { sum / allowed.len() as f32 };
                out_x[[0, row, c]] = mean + bound.get(c).copied().unwrap_or(0.0);
            }
        }
    }

    if let Ok(weights) = output_buffer(outputs, names::OUT_CROSS_HEAD_WEIGHTS) {
        let n_audio = weights.shape()[2];
        weights.fill(1.0 / n_audio as f32);
    }

    let kv = output_buffer(outputs, names::OUT_NEW_MASKED_KV)?;
    for (ix, v) in kv.view_mut().indexed_iter_mut() {
        *v = new_kv_value(ix[0], x[[0, ix[2], ix[3]]]);
    }
    Ok(())
}

fn decode_step(
    inputs: &[NamedTensor<'_>],
    outputs: &mut [BufferDescriptor],
    bound: &[f32],
    text_offset: usize,
) -> Result<()> {
    let x = as3(named_input(inputs, names::X)?)?;
    let mask = as2(named_input(inputs, names::QK_MASK)?)?;
    let cache = as4(named_input(inputs, names::MASKED_KV)?)?;
    let (n_kv, beams, ctx, n_state) = {
        let s = cache.shape();
        (s[0], s[1], s[2], s[3])
    };
    if text_offset >= ctx {
        return Err(DecodeError::Accelerator(format!(
            "text offset {text_offset} outside context {ctx}"
        )));
    }
    let allowed: Vec<usize> = (0..ctx).filter(|&j| mask[[0, j]].is_finite()).collect();

    let mut hidden = vec![0.0f32; beams * n_state];
    for b in 0..beams {
        for c in 0..n_state {
            let past: f32 = allowed.iter().map(|&j| cache[[n_kv - 1, b, j, c]]).sum();
            hidden[b * n_state + c] =
                (past + x[[b, 0, c]]) / (allowed.len() + 1) as f32 + bound.get(c).copied().unwrap_or(0.0);
        }
    }

    {
        let logits = output_buffer(outputs, names::OUT_LOGITS)?;
        for (ix, v) in logits.view_mut().indexed_iter_mut() {
            let (b, vocab) = (ix[0], ix[2]);
            let h = &hidden[b * n_state..(b + 1) * n_state];
            *v = h.iter().enumerate().map(|(c, &h)| h * projection(vocab, c)).sum();
        }
    }

    let kv = output_buffer(outputs, names::OUT_NEW_MASKED_KV)?;
    for (ix, v) in kv.view_mut().indexed_iter_mut() {
        *v = new_kv_value(ix[0], x[[ix[1], 0, ix[3]]]);
    }
    Ok(())
}
