//! Model dimensions and decoder configuration.
//!
//! Every fixed tensor shape the accelerator models were compiled with is
//! derived from [`ModelDims`]. Configuration is resolved in this order:
//!
//! 1. An explicit JSON file (`DecoderConfig::from_file`)
//! 2. Environment (`MURMUR_MODEL_DIR`, `MURMUR_MODEL_SIZE`, `MURMUR_BEAM_SIZE`)
//! 3. Built-in presets for the five Whisper sizes

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::buffer::ElementType;
use crate::error::{DecodeError, Result};

/// Audio context length produced by the encoder (30 s of audio).
pub const N_AUDIO_CTX: usize = 1_500;
/// Maximum text context of the step decoder.
pub const N_TEXT_CTX: usize = 448;
/// Fixed prefill length: longest prompt (224) + SOT sequence (3), rounded up.
pub const MAX_PREFILL_CTX: usize = 256;
/// Multilingual Whisper vocabulary.
pub const N_VOCAB: usize = 51_865;
const DEFAULT_BEAM_SIZE: usize = 5;
const DEFAULT_LOGITS_CHUNKS: usize = 5;

/// Whisper checkpoint sizes with known dimension tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    pub fn name(self) -> &'static str {
        match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tiny" | "tiny.en" => Some(ModelSize::Tiny),
            "base" | "base.en" => Some(ModelSize::Base),
            "small" | "small.en" => Some(ModelSize::Small),
            "medium" | "medium.en" => Some(ModelSize::Medium),
            "large" | "large-v1" | "large-v2" => Some(ModelSize::Large),
            _ => None,
        }
    }

    /// (n_state, n_layer, n_head, n_alignment_head)
    fn table(self) -> (usize, usize, usize, usize) {
        match self {
            ModelSize::Tiny => (384, 4, 6, 6),
            ModelSize::Base => (512, 6, 8, 8),
            ModelSize::Small => (768, 12, 12, 10),
            ModelSize::Medium => (1024, 24, 16, 6),
            ModelSize::Large => (1280, 32, 20, 23),
        }
    }
}

/// Shape contract shared by all four accelerator models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDims {
    pub n_mels: usize,
    pub n_audio_ctx: usize,
    pub n_state: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub n_vocab: usize,
    pub n_text_ctx: usize,
    pub max_prefill_ctx: usize,
    pub beam_size: usize,
    /// Heads whose cross-attention weights the prefill decoder exports for
    /// word-level alignment. `0` disables that output.
    pub n_alignment_head: usize,
    /// Number of equal vocabulary slices used for the logits projection.
    pub logits_chunks: usize,
}

impl Default for ModelDims {
    fn default() -> Self {
        Self::for_size(ModelSize::Small)
    }
}

impl ModelDims {
    pub fn for_size(size: ModelSize) -> Self {
        let (n_state, n_layer, n_head, n_alignment_head) = size.table();
        Self {
            n_mels: 80,
            n_audio_ctx: N_AUDIO_CTX,
            n_state,
            n_head,
            n_layer,
            n_vocab: N_VOCAB,
            n_text_ctx: N_TEXT_CTX,
            max_prefill_ctx: MAX_PREFILL_CTX,
            beam_size: DEFAULT_BEAM_SIZE,
            n_alignment_head,
            logits_chunks: DEFAULT_LOGITS_CHUNKS,
        }
    }

    /// Mel frames consumed by the encoder (two per encoded audio position).
    pub fn n_mel_frames(&self) -> usize {
        self.n_audio_ctx * 2
    }

    /// Self-attention cache rows: one key and one value tensor per layer.
    pub fn n_kv(&self) -> usize {
        self.n_layer * 2
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("n_mels", self.n_mels),
            ("n_audio_ctx", self.n_audio_ctx),
            ("n_state", self.n_state),
            ("n_head", self.n_head),
            ("n_layer", self.n_layer),
            ("n_vocab", self.n_vocab),
            ("n_text_ctx", self.n_text_ctx),
            ("max_prefill_ctx", self.max_prefill_ctx),
            ("beam_size", self.beam_size),
            ("logits_chunks", self.logits_chunks),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(DecodeError::Config(format!("{name} must be non-zero")));
        }
        if self.n_state % self.n_head != 0 {
            return Err(DecodeError::Config(format!(
                "n_state {} is not divisible by n_head {}",
                self.n_state, self.n_head
            )));
        }
        if self.max_prefill_ctx > self.n_text_ctx {
            return Err(DecodeError::Config(format!(
                "max_prefill_ctx {} exceeds n_text_ctx {}",
                self.max_prefill_ctx, self.n_text_ctx
            )));
        }
        crate::logits::check_chunking(self.n_vocab, self.logits_chunks)
    }
}

/// Everything needed to open the four accelerator models.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub model_dir: PathBuf,
    pub dims: ModelDims,
    /// Element type of accelerator inputs. Outputs are always read as f32.
    pub input_precision: ElementType,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            model_dir: default_models_dir().join(ModelSize::Small.name()),
            dims: ModelDims::default(),
            input_precision: ElementType::F16,
        }
    }
}

impl DecoderConfig {
    pub fn for_size(size: ModelSize) -> Self {
        Self {
            model_dir: default_models_dir().join(size.name()),
            dims: ModelDims::for_size(size),
            input_precision: ElementType::F16,
        }
    }

    /// Read a JSON config. Missing fields fall back to the `small` preset.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|e| DecodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve from `MURMUR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let size = match std::env::var("MURMUR_MODEL_SIZE") {
            Ok(raw) if !raw.trim().is_empty() => ModelSize::parse(&raw).ok_or_else(|| {
                DecodeError::Config(format!("unknown MURMUR_MODEL_SIZE `{}`", raw.trim()))
            })?,
            _ => ModelSize::Small,
        };
        let mut config = Self::for_size(size);

        if let Ok(explicit) = std::env::var("MURMUR_MODEL_DIR") {
            if !explicit.trim().is_empty() {
                config.model_dir = PathBuf::from(explicit.trim());
            }
        }
        if let Ok(raw) = std::env::var("MURMUR_BEAM_SIZE") {
            match raw.trim().parse::<usize>() {
                Ok(beam) if beam > 0 => config.dims.beam_size = beam,
                _ => warn!(value = %raw, "ignoring invalid MURMUR_BEAM_SIZE"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.dims.validate()
    }
}

pub fn default_models_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(|p| PathBuf::from(p).join("Murmur").join("models"))
            .unwrap_or_else(|| PathBuf::from("models"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("murmur")
            .join("models")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_validate() {
        for size in [
            ModelSize::Tiny,
            ModelSize::Base,
            ModelSize::Small,
            ModelSize::Medium,
            ModelSize::Large,
        ] {
            ModelDims::for_size(size)
                .validate()
                .unwrap_or_else(|e| panic!("{} preset invalid: {e}", size.name()));
        }
    }

    #[test]
    fn small_preset_matches_known_dimensions() {
        let dims = ModelDims::for_size(ModelSize::Small);
        assert_eq!(dims.n_state, 768);
        assert_eq!(dims.n_layer, 12);
        assert_eq!(dims.n_head, 12);
        assert_eq!(dims.n_alignment_head, 10);
        assert_eq!(dims.n_kv(), 24);
        assert_eq!(dims.n_mel_frames(), 3_000);
    }

    #[test]
    fn indivisible_vocabulary_is_rejected_at_config_time() {
        let mut dims = ModelDims::for_size(ModelSize::Tiny);
        dims.logits_chunks = 7;
        match dims.validate() {
            Err(DecodeError::VocabularyChunking { vocab, chunks }) => {
                assert_eq!(vocab, N_VOCAB);
                assert_eq!(chunks, 7);
            }
            other => panic!("expected VocabularyChunking, got {other:?}"),
        }
    }

    #[test]
    fn prefill_longer_than_context_is_rejected() {
        let mut dims = ModelDims::for_size(ModelSize::Tiny);
        dims.max_prefill_ctx = dims.n_text_ctx + 1;
        assert!(matches!(dims.validate(), Err(DecodeError::Config(_))));
    }

    #[test]
    fn config_json_fills_missing_fields_from_defaults() {
        let json = r#"{ "model_dir": "/models/tiny", "dims": { "n_state": 384, "n_head": 6, "n_layer": 4 } }"#;
        let config: DecoderConfig = serde_json::from_str(json).expect("parse config");
        assert_eq!(config.model_dir, PathBuf::from("/models/tiny"));
        assert_eq!(config.dims.n_state, 384);
        assert_eq!(config.dims.n_vocab, N_VOCAB);
        assert_eq!(config.input_precision, ElementType::F16);
        config.validate().expect("valid config");
    }

    #[test]
    fn size_names_parse_back() {
        assert_eq!(ModelSize::parse(" Small "), Some(ModelSize::Small));
        assert_eq!(ModelSize::parse("large-v2"), Some(ModelSize::Large));
        assert_eq!(ModelSize::parse("huge"), None);
    }
}
