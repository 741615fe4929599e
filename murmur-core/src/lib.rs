//! # murmur-core
//!
//! Decode orchestration for a Whisper-style speech-to-text transformer whose
//! tensor math runs in pre-compiled accelerator models.
//!
//! ## Architecture
//!
//! ```text
//! mel ─▶ Encoder ─▶ encoded audio ─▶ CrossKv ─▶ CrossKvCache (shared, read-only)
//!                                                     │
//!                    tokens ─▶ TokenEmbedder          │
//!                                  │                  ▼
//!                                  └──▶ DecodeOrchestrator
//!                                         ├─ PREFILL: BulkDecoder, one call per beam
//!                                         └─ STEP:    StepDecoder, all beams batched
//!                                                     │
//!                               logits ◀──────────────┤
//!                                                     ▼
//!                         MaskedKvCache ◀── BeamRearrangeRequest (beam search)
//! ```
//!
//! Every native call goes through an [`AcceleratorModel`], which owns a
//! [`BufferArena`] sized from the model's [`ShapeContract`]. Nothing is
//! allocated per call on the accelerator side of the boundary.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod accelerator;
pub mod buffer;
pub mod config;
pub mod cross_kv;
pub mod decode;
pub mod embedding;
pub mod error;
pub mod instrumentation;
pub mod kv_cache;
pub mod logits;
pub mod mask;

// Convenience re-exports for downstream crates
pub use accelerator::{
    Accelerator, AcceleratorModel, CallControl, ModelKind, NativeModel, ShapeContract,
    StubAccelerator,
};
pub use buffer::{BufferArena, BufferDescriptor, BufferRole, ElementType};
pub use config::{DecoderConfig, ModelDims, ModelSize};
pub use decode::{
    BeamRearrangeRequest, DecodeOrchestrator, DecodeOutput, DecodePhase, DecodeState,
    OrchestratorHandle, Prediction,
};
pub use embedding::{EmbeddingTable, TokenEmbedder};
pub use error::{DecodeError, Result};
pub use instrumentation::{Instrumentation, TimingReport};
pub use kv_cache::{CrossKvCache, MaskedKvCache};

#[cfg(feature = "onnx")]
pub use accelerator::OnnxAccelerator;
