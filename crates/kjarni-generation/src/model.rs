//! The model-side contracts consumed by the decoding engine.
//!
//! A model is anything that can describe itself ([`ModelMetadata`]) and run
//! forward steps on named tensors ([`GenerationBackend`]). Kernels, weights
//! and device placement all live behind this trait.

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::config::GenerationParams;
use crate::tensor::NamedTensors;

/// The structural family of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelArchitecture {
    /// A single autoregressive stack with a self-attention cache (GPT-2, Llama).
    DecoderOnly,
    /// An encoder run once plus a decoder with self- and cross-attention (BART, T5, Whisper).
    EncoderDecoder,
}

impl ModelArchitecture {
    pub fn is_encoder_decoder(&self) -> bool {
        matches!(self, ModelArchitecture::EncoderDecoder)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ModelArchitecture::DecoderOnly => "decoder-only",
            ModelArchitecture::EncoderDecoder => "encoder-decoder",
        }
    }
}

/// What the engine needs to know about a model to drive generation.
#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub architecture: ModelArchitecture,
    /// Decoder layers; one cache entry per layer and head group.
    pub num_layers: usize,
    /// Key/value heads per layer (after any grouped-query sharing).
    pub num_heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
    /// Defaults hard-wired for the model family.
    pub builtin_defaults: GenerationParams,
    /// The model's stored `generation_config.json`, if it shipped one.
    pub stored_config: Option<GenerationParams>,
}

impl ModelMetadata {
    pub fn new(
        architecture: ModelArchitecture,
        num_layers: usize,
        num_heads: usize,
        head_dim: usize,
        vocab_size: usize,
    ) -> Self {
        Self {
            architecture,
            num_layers,
            num_heads,
            head_dim,
            vocab_size,
            builtin_defaults: GenerationParams::default(),
            stored_config: None,
        }
    }

    pub fn with_builtin_defaults(mut self, defaults: GenerationParams) -> Self {
        self.builtin_defaults = defaults;
        self
    }

    pub fn with_stored_config(mut self, stored: GenerationParams) -> Self {
        self.stored_config = Some(stored);
        self
    }
}

/// The forward-step contract of the external execution engine.
///
/// Implementations may be local, remote, batched or accelerated; the decoding
/// loop only awaits them. Errors are propagated to the caller unchanged and
/// never retried.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn metadata(&self) -> &ModelMetadata;

    /// Runs the encoder once over `input_ids` / `attention_mask` and returns
    /// `last_hidden_state`. Only called for encoder-decoder models.
    async fn encode(&self, _inputs: NamedTensors) -> Result<NamedTensors> {
        Err(anyhow!(
            "{} model has no encoder",
            self.metadata().architecture.display_name()
        ))
    }

    /// Runs one decoder step. Returns `logits` plus the new cache fragments.
    async fn decode_step(&self, inputs: NamedTensors) -> Result<NamedTensors>;
}
