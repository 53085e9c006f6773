//! Generation configuration: partial layers, resolution and length bounds.

mod params;
mod resolve;

use std::collections::BTreeMap;

use crate::common::StepCallbackRef;
use crate::error::{GenerationError, Result};

pub use params::GenerationParams;
pub use resolve::{resolve_generation_config, DEFAULT_MAX_LENGTH};

/// Token selection strategy, derived from the resolved config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodingStrategy {
    Greedy,
    Sample,
    BeamSearch { num_beams: usize },
}

/// A fully resolved, immutable generation configuration.
///
/// Every field has a value; construct with [`resolve_generation_config`].
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_length: usize,
    pub max_new_tokens: Option<usize>,
    pub min_length: usize,
    pub min_new_tokens: Option<usize>,

    pub num_beams: usize,
    pub num_return_sequences: usize,
    pub do_sample: bool,
    pub temperature: f32,
    /// `0` = disabled.
    pub top_k: usize,
    pub top_p: f32,

    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: usize,
    pub bad_words_ids: Vec<Vec<u32>>,
    /// Absolute position -> token.
    pub forced_decoder_ids: BTreeMap<usize, u32>,
    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<u32>,

    pub eos_token_id: Vec<u32>,
    pub bos_token_id: Option<u32>,
    pub pad_token_id: u32,
    pub decoder_start_token_id: u32,

    pub early_stopping: bool,
    pub length_penalty: f32,
    pub seed: Option<u64>,
    pub callback: Option<StepCallbackRef>,
}

impl GenerationConfig {
    pub fn strategy(&self) -> DecodingStrategy {
        if self.do_sample {
            DecodingStrategy::Sample
        } else if self.num_beams > 1 {
            DecodingStrategy::BeamSearch {
                num_beams: self.num_beams,
            }
        } else {
            DecodingStrategy::Greedy
        }
    }

    /// Sequences tracked per input: beams for beam search, samples for
    /// sampling, one for greedy.
    pub fn group_size(&self) -> usize {
        match self.strategy() {
            DecodingStrategy::Greedy => 1,
            DecodingStrategy::Sample => self.num_return_sequences,
            DecodingStrategy::BeamSearch { num_beams } => num_beams,
        }
    }

    #[inline]
    pub fn is_eos(&self, token_id: u32) -> bool {
        self.eos_token_id.contains(&token_id)
    }

    /// Absolute length bounds for a decoder input of `prompt_len` tokens.
    ///
    /// `max_new_tokens` / `min_new_tokens` take precedence over the absolute
    /// values when set.
    pub fn length_bounds(&self, prompt_len: usize) -> Result<LengthBounds> {
        let max_length = self
            .max_new_tokens
            .map_or(self.max_length, |n| prompt_len.saturating_add(n));
        let min_length = self
            .min_new_tokens
            .map_or(self.min_length, |n| prompt_len.saturating_add(n));

        if min_length > max_length {
            return Err(GenerationError::config(format!(
                "min length {} exceeds max length {}",
                min_length, max_length
            )));
        }
        Ok(LengthBounds {
            prompt_len,
            min_length,
            max_length,
        })
    }

    /// Bounds of one left-padded row, measured on the row without its padding.
    ///
    /// A relative minimum follows the row's own prompt and an absolute one
    /// applies as is. The maximum shrinks by `pad_len`, since every row of
    /// the batch stops at the same padded length.
    pub fn row_bounds(&self, bounds: &LengthBounds, pad_len: usize) -> LengthBounds {
        let prompt_len = bounds.prompt_len.saturating_sub(pad_len);
        LengthBounds {
            prompt_len,
            min_length: self
                .min_new_tokens
                .map_or(self.min_length, |n| prompt_len.saturating_add(n)),
            max_length: bounds.max_length.saturating_sub(pad_len),
        }
    }
}

/// Absolute length limits for one generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthBounds {
    /// Decoder input length (padded prompt, or the decoder start token).
    pub prompt_len: usize,
    pub min_length: usize,
    pub max_length: usize,
}

impl LengthBounds {
    /// Upper bound on the number of decode steps.
    pub fn max_new_tokens(&self) -> usize {
        self.max_length.saturating_sub(self.prompt_len)
    }
}
