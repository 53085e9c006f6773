//! Partial generation parameters.
//!
//! The same type is used for all three resolution layers: the model's
//! built-in defaults, its stored `generation_config.json`, and per-call
//! overrides. `None` means "not set at this layer".

use serde::{Deserialize, Deserializer, Serialize};

use crate::common::StepCallbackRef;
use crate::error::{GenerationError, Result};

/// Generation parameters where every field is optional.
///
/// Only set values the caller explicitly wants; everything else falls
/// through to the next layer during resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Absolute maximum length (prompt included).
    pub max_length: Option<usize>,
    /// Maximum number of generated tokens. Wins over `max_length`.
    pub max_new_tokens: Option<usize>,
    /// Absolute minimum length (prompt included).
    pub min_length: Option<usize>,
    /// Minimum number of generated tokens. Wins over `min_length`.
    pub min_new_tokens: Option<usize>,

    /// Number of beams. `1` = greedy decoding.
    pub num_beams: Option<usize>,
    pub num_return_sequences: Option<usize>,
    pub do_sample: Option<bool>,

    pub temperature: Option<f32>,
    /// `0` disables top-k filtering.
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,

    /// Penalty for repeating tokens (1.0 = no penalty).
    pub repetition_penalty: Option<f32>,
    /// Prevent repeating n-grams of this size.
    pub no_repeat_ngram_size: Option<usize>,
    pub bad_words_ids: Option<Vec<Vec<u32>>>,
    /// `[position, token]` pairs.
    pub forced_decoder_ids: Option<Vec<(usize, u32)>>,
    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<u32>,

    #[serde(deserialize_with = "deserialize_token_ids")]
    pub eos_token_id: Option<Vec<u32>>,
    pub bos_token_id: Option<u32>,
    pub pad_token_id: Option<u32>,
    pub decoder_start_token_id: Option<u32>,

    /// Stop when `num_beams` complete sequences are found.
    #[serde(deserialize_with = "deserialize_early_stopping")]
    pub early_stopping: Option<bool>,
    pub length_penalty: Option<f32>,

    /// RNG seed for reproducible sampling.
    pub seed: Option<u64>,

    #[serde(skip)]
    pub callback: Option<StepCallbackRef>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(u32),
    Many(Vec<u32>),
}

/// `eos_token_id` is an integer in most configs and a list in some.
fn deserialize_token_ids<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<u32>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<OneOrMany>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        OneOrMany::One(id) => vec![id],
        OneOrMany::Many(ids) => ids,
    }))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EarlyStopping {
    Flag(bool),
    Named(String),
}

/// Accepts `true`, `false`, or `"never"` (treated as `false`).
fn deserialize_early_stopping<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<EarlyStopping>::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(EarlyStopping::Flag(flag)) => Ok(Some(flag)),
        Some(EarlyStopping::Named(name)) if name == "never" => Ok(Some(false)),
        Some(EarlyStopping::Named(name)) => Err(serde::de::Error::custom(format!(
            "invalid early_stopping value '{}'",
            name
        ))),
    }
}

impl GenerationParams {
    /// Greedy decoding (single beam, no sampling).
    pub fn greedy() -> Self {
        Self {
            num_beams: Some(1),
            do_sample: Some(false),
            ..Default::default()
        }
    }

    /// Beam search with `num_beams` beams.
    pub fn beam_search(num_beams: usize) -> Self {
        Self {
            num_beams: Some(num_beams),
            do_sample: Some(false),
            ..Default::default()
        }
    }

    /// Ancestral sampling at the given temperature.
    pub fn sampling(temperature: f32) -> Self {
        Self {
            num_beams: Some(1),
            do_sample: Some(true),
            temperature: Some(temperature),
            ..Default::default()
        }
    }

    /// Parses a stored `generation_config.json` document. Unknown keys are ignored.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| GenerationError::config(format!("unparseable generation config: {}", e)))
    }

    /// Check if any field is set.
    pub fn is_empty(&self) -> bool {
        self.max_length.is_none()
            && self.max_new_tokens.is_none()
            && self.min_length.is_none()
            && self.min_new_tokens.is_none()
            && self.num_beams.is_none()
            && self.num_return_sequences.is_none()
            && self.do_sample.is_none()
            && self.temperature.is_none()
            && self.top_k.is_none()
            && self.top_p.is_none()
            && self.repetition_penalty.is_none()
            && self.no_repeat_ngram_size.is_none()
            && self.bad_words_ids.is_none()
            && self.forced_decoder_ids.is_none()
            && self.forced_bos_token_id.is_none()
            && self.forced_eos_token_id.is_none()
            && self.eos_token_id.is_none()
            && self.bos_token_id.is_none()
            && self.pad_token_id.is_none()
            && self.decoder_start_token_id.is_none()
            && self.early_stopping.is_none()
            && self.length_penalty.is_none()
            && self.seed.is_none()
            && self.callback.is_none()
    }

    /// Merge with another layer. Values from `other` take precedence.
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            max_length: other.max_length.or(self.max_length),
            max_new_tokens: other.max_new_tokens.or(self.max_new_tokens),
            min_length: other.min_length.or(self.min_length),
            min_new_tokens: other.min_new_tokens.or(self.min_new_tokens),
            num_beams: other.num_beams.or(self.num_beams),
            num_return_sequences: other.num_return_sequences.or(self.num_return_sequences),
            do_sample: other.do_sample.or(self.do_sample),
            temperature: other.temperature.or(self.temperature),
            top_k: other.top_k.or(self.top_k),
            top_p: other.top_p.or(self.top_p),
            repetition_penalty: other.repetition_penalty.or(self.repetition_penalty),
            no_repeat_ngram_size: other.no_repeat_ngram_size.or(self.no_repeat_ngram_size),
            bad_words_ids: other.bad_words_ids.clone().or_else(|| self.bad_words_ids.clone()),
            forced_decoder_ids: other
                .forced_decoder_ids
                .clone()
                .or_else(|| self.forced_decoder_ids.clone()),
            forced_bos_token_id: other.forced_bos_token_id.or(self.forced_bos_token_id),
            forced_eos_token_id: other.forced_eos_token_id.or(self.forced_eos_token_id),
            eos_token_id: other.eos_token_id.clone().or_else(|| self.eos_token_id.clone()),
            bos_token_id: other.bos_token_id.or(self.bos_token_id),
            pad_token_id: other.pad_token_id.or(self.pad_token_id),
            decoder_start_token_id: other.decoder_start_token_id.or(self.decoder_start_token_id),
            early_stopping: other.early_stopping.or(self.early_stopping),
            length_penalty: other.length_penalty.or(self.length_penalty),
            seed: other.seed.or(self.seed),
            callback: other.callback.clone().or_else(|| self.callback.clone()),
        }
    }
}
