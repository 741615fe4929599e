//! One loaded accelerator model with its shape contract and buffer arena.

use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::ArrayViewD;
use tracing::{debug, info};

use crate::accelerator::contract::{InputBinding, ShapeContract};
use crate::accelerator::{Accelerator, CallControl, ModelKind, NamedTensor, NativeModel};
use crate::buffer::{ensure_contiguous, BufferArena, BufferDescriptor, ElementType};
use crate::config::ModelDims;
use crate::error::{DecodeError, Result};
use crate::instrumentation::Instrumentation;

/// Exclusive owner of one native model.
///
/// Opening allocates the arena and loads the model eagerly, so a missing or
/// corrupt file fails before any decode step starts. The handle is not
/// `Clone`: there is exactly one live handle per model kind in an
/// orchestrator.
pub struct AcceleratorModel {
    kind: ModelKind,
    path: PathBuf,
    contract: ShapeContract,
    arena: BufferArena,
    native: Option<Box<dyn NativeModel>>,
}

impl AcceleratorModel {
    pub fn open(
        accel: &dyn Accelerator,
        kind: ModelKind,
        model_dir: &Path,
        dims: &ModelDims,
        input_precision: ElementType,
        instr: &mut Instrumentation,
    ) -> Result<Self> {
        let contract = ShapeContract::for_kind(kind, dims, input_precision);
        let arena = BufferArena::for_contract(&contract);
        let mut model = Self {
            kind,
            path: model_dir.join(kind.file_name()),
            contract,
            arena,
            native: None,
        };
        model.load(accel, instr)?;
        Ok(model)
    }

    /// Load the native model if it is not loaded yet. A second call is a no-op.
    pub fn load(&mut self, accel: &dyn Accelerator, instr: &mut Instrumentation) -> Result<()> {
        if self.native.is_some() {
            return Ok(());
        }
        let started = Instant::now();
        let native = accel.load(self.kind, &self.path, &self.contract)?;
        let elapsed = started.elapsed();
        instr.record_load(self.kind, elapsed);
        self.native = Some(native);

        let arena_mb = self.arena.allocated_bytes() as f64 / 1_048_576.0;
        let boundary_mb = self.arena.boundary_bytes() as f64 / 1_048_576.0;
        let load_ms = elapsed.as_secs_f64() * 1_000.0;
        info!(
            model = %self.kind,
            backend = accel.name(),
            path = %self.path.display(),
            arena_mb,
            boundary_mb,
            load_ms,
            "model loaded"
        );
        for buf in self.arena.buffers() {
            debug!(model = %self.kind, tensor = buf.name(), shape = ?buf.shape(), dtype = ?buf.dtype(), role = ?buf.role(), "arena buffer");
        }
        for spec in self
            .contract
            .inputs()
            .filter(|s| s.binding == InputBinding::Caller)
        {
            debug!(model = %self.kind, tensor = spec.name, shape = ?spec.shape, dtype = ?spec.dtype, "caller-bound input");
        }
        Ok(())
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contract(&self) -> &ShapeContract {
        &self.contract
    }

    pub fn arena(&self) -> &BufferArena {
        &self.arena
    }

    pub fn is_loaded(&self) -> bool {
        self.native.is_some()
    }

    /// Arena input buffer, for staging data in place before `predict`.
    pub fn input_mut(&mut self, name: &str) -> Result<&mut BufferDescriptor> {
        self.arena.input_mut(name)
    }

    /// Copy `src` into the arena input `name`. Shapes must match exactly.
    pub fn write_input(&mut self, name: &str, src: &ArrayViewD<'_, f32>) -> Result<()> {
        self.arena.input_mut(name)?.write(src)
    }

    /// View of an output buffer. Valid until the next `predict`.
    pub fn output(&self, name: &str) -> Result<ArrayViewD<'_, f32>> {
        Ok(self.arena.output(name)?.view())
    }

    pub fn output_buffer(&self, name: &str) -> Result<&BufferDescriptor> {
        self.arena.output(name)
    }

    /// Run the native model on the staged arena inputs plus the caller-bound
    /// inputs in `external`.
    ///
    /// Caller-bound tensors are shape-checked against the contract and forced
    /// into standard layout before the call. On success every output buffer
    /// has been overwritten in place.
    pub fn predict(
        &mut self,
        external: &[(&str, ArrayViewD<'_, f32>)],
        control: CallControl,
        instr: &mut Instrumentation,
    ) -> Result<()> {
        let kind = self.kind;
        let native = self
            .native
            .as_mut()
            .ok_or(DecodeError::ModelNotLoaded { kind })?;

        for (name, view) in external {
            match self.contract.spec(name) {
                Some(spec) if spec.binding == InputBinding::Caller => {
                    self.contract.check(name, view.shape())?;
                }
                _ => {
                    return Err(DecodeError::InvalidState(format!(
                        "`{name}` is not a caller-bound input of the {kind} model"
                    )))
                }
            }
        }
        for spec in self
            .contract
            .inputs()
            .filter(|s| s.binding == InputBinding::Caller)
        {
            if !external.iter().any(|(name, _)| *name == spec.name) {
                return Err(DecodeError::InvalidState(format!(
                    "{kind} model requires caller input `{}`",
                    spec.name
                )));
            }
        }

        let contiguous: Vec<_> = external
            .iter()
            .map(|(name, view)| (*name, ensure_contiguous(view.view())))
            .collect();

        let (arena_inputs, outputs) = self.arena.split_io();
        let mut inputs: Vec<NamedTensor<'_>> = arena_inputs
            .iter()
            .map(|buf| NamedTensor {
                name: buf.name(),
                dtype: buf.dtype(),
                view: buf.view(),
            })
            .collect();
        for (name, data) in &contiguous {
            let dtype = self
                .contract
                .spec(name)
                .map(|s| s.dtype)
                .unwrap_or(ElementType::F32);
            inputs.push(NamedTensor {
                name: *name,
                dtype,
                view: data.view(),
            });
        }

        let started = Instant::now();
        native.predict(&inputs, outputs, control)?;
        instr.record_predict(kind, started.elapsed());
        Ok(())
    }

    /// Release the native model. Idempotent; the arena stays allocated.
    pub fn close(&mut self) {
        if let Some(mut native) = self.native.take() {
            native.close();
            debug!(model = %self.kind, "model closed");
        }
    }
}

impl Drop for AcceleratorModel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for AcceleratorModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceleratorModel")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("loaded", &self.native.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::contract::names;
    use crate::accelerator::StubAccelerator;
    use ndarray::{Array3, Array4, Axis};

    fn dims() -> ModelDims {
        ModelDims {
            n_mels: 4,
            n_audio_ctx: 6,
            n_state: 8,
            n_head: 2,
            n_layer: 2,
            n_vocab: 20,
            n_text_ctx: 8,
            max_prefill_ctx: 4,
            beam_size: 3,
            n_alignment_head: 2,
            logits_chunks: 5,
        }
    }

    fn open(accel: &StubAccelerator, kind: ModelKind, instr: &mut Instrumentation) -> AcceleratorModel {
        AcceleratorModel::open(accel, kind, Path::new("/models"), &dims(), ElementType::F16, instr)
            .expect("open")
    }

    #[test]
    fn open_loads_once_and_records_time() {
        let accel = StubAccelerator::new();
        let mut instr = Instrumentation::new();
        let mut model = open(&accel, ModelKind::Encoder, &mut instr);
        model.load(&accel, &mut instr).expect("second load");
        assert_eq!(accel.log().loads, vec![ModelKind::Encoder]);
        assert_eq!(instr.stage(ModelKind::Encoder).loads, 1);
        assert_eq!(model.path(), Path::new("/models/encoder.onnx"));
    }

    #[test]
    fn output_buffers_keep_identity_across_calls() {
        let accel = StubAccelerator::new();
        let mut instr = Instrumentation::new();
        let mut model = open(&accel, ModelKind::Encoder, &mut instr);
        let before = model.output_buffer(names::ENCODER_OUTPUT).expect("out").as_ptr();
        for _ in 0..3 {
            model.input_mut(names::MEL).expect("mel").fill(1.0);
            model
                .predict(&[], CallControl::default(), &mut instr)
                .expect("predict");
        }
        let after = model.output_buffer(names::ENCODER_OUTPUT).expect("out").as_ptr();
        assert_eq!(before, after);
        assert_eq!(instr.stage(ModelKind::Encoder).predicts, 3);
    }

    #[test]
    fn caller_input_shape_checked_before_native_call() {
        let accel = StubAccelerator::new();
        let mut instr = Instrumentation::new();
        let mut model = open(&accel, ModelKind::BulkDecoder, &mut instr);
        let bad = Array4::<f32>::zeros((4, 1, 5, 8)).into_dyn();
        let control = CallControl {
            text_offset: 0,
            is_new_cross_kv: true,
        };
        match model.predict(&[(names::CROSS_KV, bad.view())], control, &mut instr) {
            Err(DecodeError::ShapeMismatch { name, .. }) => assert_eq!(name, names::CROSS_KV),
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
        assert!(accel.calls(ModelKind::BulkDecoder).is_empty());
    }

    #[test]
    fn missing_caller_input_is_rejected() {
        let accel = StubAccelerator::new();
        let mut instr = Instrumentation::new();
        let mut model = open(&accel, ModelKind::BulkDecoder, &mut instr);
        assert!(matches!(
            model.predict(&[], CallControl::default(), &mut instr),
            Err(DecodeError::InvalidState(_))
        ));
    }

    #[test]
    fn strided_caller_input_is_made_contiguous() {
        let accel = StubAccelerator::new();
        let mut instr = Instrumentation::new();
        let mut model = open(&accel, ModelKind::BulkDecoder, &mut instr);
        // (n_kv, 1, n_audio, n_state) taken as every other frame of a longer tensor.
        let wide = Array4::<f32>::ones((4, 1, 12, 8));
        let strided = wide.slice_axis(Axis(2), ndarray::Slice::new(0, None, 2)).into_dyn();
        assert!(!strided.is_standard_layout());
        model
            .predict(
                &[(names::CROSS_KV, strided)],
                CallControl {
                    text_offset: 0,
                    is_new_cross_kv: true,
                },
                &mut instr,
            )
            .expect("predict with strided input");
    }

    #[test]
    fn predict_after_close_fails_fast() {
        let accel = StubAccelerator::new();
        let mut instr = Instrumentation::new();
        let mut model = open(&accel, ModelKind::CrossKv, &mut instr);
        model.close();
        model.close();
        assert!(!model.is_loaded());
        match model.predict(&[], CallControl::default(), &mut instr) {
            Err(DecodeError::ModelNotLoaded { kind }) => assert_eq!(kind, ModelKind::CrossKv),
            other => panic!("expected ModelNotLoaded, got {other:?}"),
        }
        assert_eq!(accel.log().closes, vec![ModelKind::CrossKv]);
    }

    #[test]
    fn arena_input_shape_is_fixed() {
        let accel = StubAccelerator::new();
        let mut instr = Instrumentation::new();
        let mut model = open(&accel, ModelKind::CrossKv, &mut instr);
        let wrong = Array3::<f32>::zeros((1, 5, 8)).into_dyn();
        assert!(matches!(
            model.write_input(names::XA, &wrong.view()),
            Err(DecodeError::ShapeMismatch { .. })
        ));
    }
}
