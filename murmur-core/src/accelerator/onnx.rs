//! ONNX Runtime backend via the `ort` crate.
//!
//! Each model kind is one graph under the model directory:
//!
//! | Kind        | File                   |
//! |-------------|------------------------|
//! | Encoder     | `encoder.onnx`         |
//! | CrossKv     | `cross_kv.onnx`        |
//! | BulkDecoder | `decoder_prefill.onnx` |
//! | StepDecoder | `decoder_step.onnx`    |
//!
//! Graph input and output names must match the shape contract. Graphs may
//! additionally declare `text_offset` (`int32 [1]`) and `is_new_cross_kv`
//! (`bool [1]`); those are fed from the call's control scalars when present.
//!
//! ## Environment
//!
//! - `MURMUR_ORT_EP`: `auto` (default), `cpu`, `directml`
//! - `MURMUR_ORT_INTRA_THREADS`, `MURMUR_ORT_INTER_THREADS`

use std::path::Path;

use half::f16;
use ndarray::Array1;
use ort::session::{Session, SessionInputValue};
use ort::value::{TensorRef, Value};
use ort::{
    ep,
    session::builder::{GraphOptimizationLevel, SessionBuilder},
};
use tracing::{info, warn};

use crate::accelerator::contract::{names, ShapeContract};
use crate::accelerator::{Accelerator, CallControl, ModelKind, NamedTensor, NativeModel};
use crate::buffer::{BufferDescriptor, ElementType};
use crate::error::{DecodeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrtExecutionPreference {
    Auto,
    Cpu,
    DirectML,
}

fn ort_execution_preference() -> OrtExecutionPreference {
    match std::env::var("MURMUR_ORT_EP")
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "cpu" => OrtExecutionPreference::Cpu,
        "dml" | "directml" => OrtExecutionPreference::DirectML,
        _ => OrtExecutionPreference::Auto,
    }
}

fn ort_err(e: impl std::fmt::Display) -> DecodeError {
    DecodeError::Accelerator(e.to_string())
}

fn load_failure(kind: ModelKind, path: &Path, reason: impl std::fmt::Display) -> DecodeError {
    DecodeError::ModelLoad {
        kind,
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn create_session(kind: ModelKind, model_path: &Path) -> Result<Session> {
    let pref = ort_execution_preference();
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let intra_threads = std::env::var("MURMUR_ORT_INTRA_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or_else(|| logical_cores.clamp(2, 12))
        .clamp(1, 32);
    let inter_threads = std::env::var("MURMUR_ORT_INTER_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, 8);

    let mut builder = SessionBuilder::new()
        .map_err(|e| load_failure(kind, model_path, e))?
        .with_intra_threads(intra_threads)
        .map_err(|e| load_failure(kind, model_path, e))?
        .with_inter_threads(inter_threads)
        .map_err(|e| load_failure(kind, model_path, e))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| load_failure(kind, model_path, e))?;
    info!(intra_threads, inter_threads, logical_cores, "ONNX session threading configured");

    #[cfg(target_os = "windows")]
    {
        builder = match pref {
            OrtExecutionPreference::Cpu => {
                info!("ONNX EP preference=cpu");
                builder
                    .with_execution_providers([ep::CPU::default().build()])
                    .map_err(|e| load_failure(kind, model_path, e))?
            }
            OrtExecutionPreference::DirectML => {
                info!("ONNX EP preference=directml (strict)");
                builder.with_execution_providers([
                    ep::DirectML::default()
                        .with_device_id(0)
                        .build()
                        .error_on_failure(),
                    ep::CPU::default().build(),
                ])
                .map_err(|e| load_failure(kind, model_path, e))?
            }
            OrtExecutionPreference::Auto => {
                info!("ONNX EP preference=auto (directml -> cpu)");
                builder.with_execution_providers([
                    ep::DirectML::default()
                        .with_device_id(0)
                        .build()
                        .fail_silently(),
                    ep::CPU::default().build(),
                ])
                .map_err(|e| load_failure(kind, model_path, e))?
            }
        };
    }

    #[cfg(not(target_os = "windows"))]
    {
        if pref == OrtExecutionPreference::DirectML {
            warn!("MURMUR_ORT_EP=directml requested on non-Windows host; using CPU EP");
        }
        builder = builder
            .with_execution_providers([ep::CPU::default().build()])
            .map_err(|e| load_failure(kind, model_path, e))?;
    }

    builder
        .commit_from_file(model_path)
        .map_err(|e| load_failure(kind, model_path, e))
}

/// Loads accelerator models as ONNX Runtime sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxAccelerator;

impl OnnxAccelerator {
    pub fn new() -> Self {
        Self
    }
}

impl Accelerator for OnnxAccelerator {
    fn name(&self) -> &str {
        "onnxruntime"
    }

    fn load(&self, kind: ModelKind, path: &Path, contract: &ShapeContract) -> Result<Box<dyn NativeModel>> {
        let meta = std::fs::metadata(path).map_err(|e| load_failure(kind, path, e))?;
        info!(
            "loading {kind} from {:?} ({:.2} MB)",
            path,
            meta.len() as f64 / 1_048_576.0
        );
        let session = create_session(kind, path)?;

        let graph_inputs: Vec<String> = session.inputs().iter().map(|o| o.name().to_string()).collect();
        let graph_outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        info!("  {kind} inputs:  {}", graph_inputs.join(", "));
        info!("  {kind} outputs: {}", graph_outputs.join(", "));

        for spec in contract.inputs() {
            if !graph_inputs.iter().any(|n| n == spec.name) {
                return Err(load_failure(kind, path, format!("graph has no input `{}`", spec.name)));
            }
        }
        for spec in contract.outputs() {
            if !graph_outputs.iter().any(|n| n == spec.name) {
                return Err(load_failure(kind, path, format!("graph has no output `{}`", spec.name)));
            }
        }
        for name in &graph_inputs {
            let known = contract.spec(name).is_some()
                || name == names::TEXT_OFFSET
                || name == names::IS_NEW_CROSS_KV;
            if !known {
                warn!(model = %kind, input = %name, "graph declares an input the contract does not know");
            }
        }

        let takes_offset = graph_inputs.iter().any(|n| n == names::TEXT_OFFSET);
        let takes_binding = graph_inputs.iter().any(|n| n == names::IS_NEW_CROSS_KV);
        Ok(Box::new(OnnxModel {
            kind,
            session: Some(session),
            takes_offset,
            takes_binding,
        }))
    }
}

struct OnnxModel {
    kind: ModelKind,
    session: Option<Session>,
    takes_offset: bool,
    takes_binding: bool,
}

impl NativeModel for OnnxModel {
    fn predict(
        &mut self,
        inputs: &[NamedTensor<'_>],
        outputs: &mut [BufferDescriptor],
        control: CallControl,
    ) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or(DecodeError::ModelNotLoaded { kind: self.kind })?;

        let mut feed: Vec<(String, SessionInputValue<'_>)> = Vec::with_capacity(inputs.len() + 2);
        for tensor in inputs {
            let shape: Vec<i64> = tensor.view.shape().iter().map(|&d| d as i64).collect();
            let value: SessionInputValue<'_> = match tensor.dtype {
                ElementType::F32 => {
                    let data = tensor.view.as_slice().ok_or_else(|| {
                        DecodeError::Accelerator(format!("input `{}` is not contiguous", tensor.name))
                    })?;
                    TensorRef::from_array_view((shape, data)).map_err(ort_err)?.into()
                }
                ElementType::F16 => Value::from_array(tensor.view.mapv(f16::from_f32))
                    .map_err(ort_err)?
                    .into(),
            };
            feed.push((tensor.name.to_string(), value));
        }
        if self.takes_offset {
            let offset = Value::from_array(Array1::from_elem(1, control.text_offset as i32)).map_err(ort_err)?;
            feed.push((names::TEXT_OFFSET.to_string(), offset.into()));
        }
        if self.takes_binding {
            let flag = Value::from_array(Array1::from_elem(1, control.is_new_cross_kv)).map_err(ort_err)?;
            feed.push((names::IS_NEW_CROSS_KV.to_string(), flag.into()));
        }

        let results = session.run(feed).map_err(ort_err)?;
        for buf in outputs.iter_mut() {
            let name = buf.name().to_string();
            let value = results
                .get(name.as_str())
                .ok_or_else(|| DecodeError::Accelerator(format!("{} produced no `{name}`", self.kind)))?;
            match value.try_extract_tensor::<f32>() {
                Ok((_, data)) => buf.write_flat(data)?,
                Err(_) => {
                    let (_, data) = value.try_extract_tensor::<f16>().map_err(ort_err)?;
                    let widened: Vec<f32> = data.iter().map(|v| v.to_f32()).collect();
                    buf.write_flat(&widened)?;
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.session.take().is_some() {
            info!(model = %self.kind, "ONNX session released");
        }
    }
}
