//! Generation config resolution.
//!
//! Start with the model's built-in defaults, layer the stored config on top,
//! then apply only what the caller explicitly set.

use super::{GenerationConfig, GenerationParams};
use crate::error::{GenerationError, Result};

/// Used when neither `max_length` nor `max_new_tokens` is set anywhere.
pub const DEFAULT_MAX_LENGTH: usize = 20;

/// Merge the three parameter layers (override > stored > built-in) and
/// validate the result.
pub fn resolve_generation_config(
    builtin: &GenerationParams,
    stored: Option<&GenerationParams>,
    overrides: Option<&GenerationParams>,
) -> Result<GenerationConfig> {
    let mut merged = builtin.clone();
    if let Some(stored) = stored {
        merged = merged.merge(stored);
    }
    if let Some(overrides) = overrides {
        merged = merged.merge(overrides);
    }

    let config = finalize(merged);
    validate(&config)?;

    log::debug!(
        "Resolved generation config: strategy={:?}, max_length={}, max_new_tokens={:?}, min_length={}",
        config.strategy(),
        config.max_length,
        config.max_new_tokens,
        config.min_length
    );
    Ok(config)
}

fn finalize(p: GenerationParams) -> GenerationConfig {
    let max_length = match (p.max_length, p.max_new_tokens) {
        (Some(max_length), _) => max_length,
        (None, Some(_)) => usize::MAX,
        (None, None) => {
            log::warn!(
                "Neither max_length nor max_new_tokens is set; defaulting to max_length={}",
                DEFAULT_MAX_LENGTH
            );
            DEFAULT_MAX_LENGTH
        }
    };

    let eos_token_id = p.eos_token_id.unwrap_or_default();
    let pad_token_id = p
        .pad_token_id
        .or_else(|| eos_token_id.first().copied())
        .unwrap_or(0);
    let decoder_start_token_id = p
        .decoder_start_token_id
        .or(p.bos_token_id)
        .unwrap_or(pad_token_id);

    GenerationConfig {
        max_length,
        max_new_tokens: p.max_new_tokens,
        min_length: p.min_length.unwrap_or(0),
        min_new_tokens: p.min_new_tokens,
        num_beams: p.num_beams.unwrap_or(1),
        num_return_sequences: p.num_return_sequences.unwrap_or(1),
        do_sample: p.do_sample.unwrap_or(false),
        temperature: p.temperature.unwrap_or(1.0),
        top_k: p.top_k.unwrap_or(0),
        top_p: p.top_p.unwrap_or(1.0),
        repetition_penalty: p.repetition_penalty.unwrap_or(1.0),
        no_repeat_ngram_size: p.no_repeat_ngram_size.unwrap_or(0),
        bad_words_ids: p.bad_words_ids.unwrap_or_default(),
        forced_decoder_ids: p.forced_decoder_ids.unwrap_or_default().into_iter().collect(),
        forced_bos_token_id: p.forced_bos_token_id,
        forced_eos_token_id: p.forced_eos_token_id,
        eos_token_id,
        bos_token_id: p.bos_token_id,
        pad_token_id,
        decoder_start_token_id,
        early_stopping: p.early_stopping.unwrap_or(false),
        length_penalty: p.length_penalty.unwrap_or(1.0),
        seed: p.seed,
        callback: p.callback,
    }
}

fn validate(c: &GenerationConfig) -> Result<()> {
    if c.num_beams == 0 {
        return Err(GenerationError::config("num_beams must be at least 1"));
    }
    if c.num_return_sequences == 0 {
        return Err(GenerationError::config("num_return_sequences must be at least 1"));
    }
    if c.do_sample && c.num_beams > 1 {
        return Err(GenerationError::config(format!(
            "beam sampling is not supported (do_sample=true with num_beams={})",
            c.num_beams
        )));
    }
    if !c.do_sample && c.num_return_sequences > c.num_beams {
        return Err(GenerationError::config(format!(
            "num_return_sequences ({}) must not exceed num_beams ({}) without sampling",
            c.num_return_sequences, c.num_beams
        )));
    }
    if c.do_sample && !(c.temperature.is_finite() && c.temperature > 0.0) {
        return Err(GenerationError::config(format!(
            "temperature must be a positive number when sampling, got {}",
            c.temperature
        )));
    }
    if !(c.top_p > 0.0 && c.top_p <= 1.0) {
        return Err(GenerationError::config(format!(
            "top_p must be in (0, 1], got {}",
            c.top_p
        )));
    }
    if !(c.repetition_penalty.is_finite() && c.repetition_penalty > 0.0) {
        return Err(GenerationError::config(format!(
            "repetition_penalty must be positive, got {}",
            c.repetition_penalty
        )));
    }
    if !c.length_penalty.is_finite() {
        return Err(GenerationError::config("length_penalty must be finite"));
    }
    if c.bad_words_ids.iter().any(Vec::is_empty) {
        return Err(GenerationError::config("bad_words_ids contains an empty sequence"));
    }
    if c.max_new_tokens.is_none() && c.min_new_tokens.is_none() && c.min_length > c.max_length {
        return Err(GenerationError::config(format!(
            "min_length ({}) exceeds max_length ({})",
            c.min_length, c.max_length
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bart_defaults() -> GenerationParams {
        GenerationParams {
            max_length: Some(142),
            min_length: Some(56),
            num_beams: Some(4),
            no_repeat_ngram_size: Some(3),
            length_penalty: Some(2.0),
            early_stopping: Some(true),
            eos_token_id: Some(vec![2]),
            bos_token_id: Some(0),
            pad_token_id: Some(1),
            decoder_start_token_id: Some(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_overrides_preserves_defaults() {
        let config = resolve_generation_config(&bart_defaults(), None, None).unwrap();

        assert_eq!(config.max_length, 142);
        assert_eq!(config.min_length, 56);
        assert_eq!(config.no_repeat_ngram_size, 3);
        assert_eq!(config.num_beams, 4);
        assert!(config.early_stopping);
        assert_eq!(config.decoder_start_token_id, 2);
    }

    #[test]
    fn test_precedence_override_stored_builtin() {
        let stored = GenerationParams {
            max_length: Some(200),
            num_beams: Some(6),
            ..Default::default()
        };
        let overrides = GenerationParams {
            max_length: Some(256),
            ..Default::default()
        };

        let config =
            resolve_generation_config(&bart_defaults(), Some(&stored), Some(&overrides)).unwrap();
        assert_eq!(config.max_length, 256); // override
        assert_eq!(config.num_beams, 6); // stored
        assert_eq!(config.min_length, 56); // built-in
    }

    #[test]
    fn test_greedy_override() {
        let config =
            resolve_generation_config(&bart_defaults(), None, Some(&GenerationParams::greedy()))
                .unwrap();
        assert_eq!(config.strategy(), super::super::DecodingStrategy::Greedy);
        // Other values preserved
        assert_eq!(config.no_repeat_ngram_size, 3);
    }

    #[test]
    fn test_library_fallbacks() {
        let config = resolve_generation_config(&GenerationParams::default(), None, None).unwrap();

        assert_eq!(config.max_length, DEFAULT_MAX_LENGTH);
        assert_eq!(config.num_beams, 1);
        assert_eq!(config.num_return_sequences, 1);
        assert!(!config.do_sample);
        assert_eq!(config.top_k, 0);
        assert_eq!(config.top_p, 1.0);
        assert_eq!(config.length_penalty, 1.0);
        assert!(config.eos_token_id.is_empty());
        assert_eq!(config.pad_token_id, 0);
        assert_eq!(config.decoder_start_token_id, 0);
    }

    #[test]
    fn test_max_new_tokens_alone_leaves_absolute_unbounded() {
        let overrides = GenerationParams {
            max_new_tokens: Some(3),
            ..Default::default()
        };
        let config =
            resolve_generation_config(&GenerationParams::default(), None, Some(&overrides)).unwrap();
        assert_eq!(config.length_bounds(5).unwrap().max_length, 8);
    }

    #[test]
    fn test_token_fallbacks() {
        let params = GenerationParams {
            eos_token_id: Some(vec![50256, 50257]),
            bos_token_id: Some(7),
            ..Default::default()
        };
        let config = resolve_generation_config(&params, None, None).unwrap();
        assert_eq!(config.pad_token_id, 50256);
        assert_eq!(config.decoder_start_token_id, 7);
        assert!(config.is_eos(50257));
        assert!(!config.is_eos(7));
    }

    #[test]
    fn test_forced_ids_become_table() {
        let params = GenerationParams {
            forced_decoder_ids: Some(vec![(1, 50259), (2, 50359)]),
            ..Default::default()
        };
        let config = resolve_generation_config(&params, None, None).unwrap();
        assert_eq!(config.forced_decoder_ids.get(&1), Some(&50259));
        assert_eq!(config.forced_decoder_ids.get(&2), Some(&50359));
        assert_eq!(config.forced_decoder_ids.len(), 2);
    }

    fn rejects(overrides: GenerationParams) -> bool {
        resolve_generation_config(&GenerationParams::default(), None, Some(&overrides))
            .map_err(|e| e.is_config())
            .err()
            .unwrap_or(false)
    }

    #[test]
    fn test_validation_errors() {
        assert!(rejects(GenerationParams { num_beams: Some(0), ..Default::default() }));
        assert!(rejects(GenerationParams {
            num_return_sequences: Some(0),
            ..Default::default()
        }));
        assert!(rejects(GenerationParams {
            num_beams: Some(2),
            num_return_sequences: Some(3),
            ..Default::default()
        }));
        assert!(rejects(GenerationParams {
            do_sample: Some(true),
            num_beams: Some(4),
            ..Default::default()
        }));
        assert!(rejects(GenerationParams {
            do_sample: Some(true),
            temperature: Some(0.0),
            ..Default::default()
        }));
        assert!(rejects(GenerationParams { top_p: Some(1.5), ..Default::default() }));
        assert!(rejects(GenerationParams { top_p: Some(0.0), ..Default::default() }));
        assert!(rejects(GenerationParams {
            repetition_penalty: Some(-1.0),
            ..Default::default()
        }));
        assert!(rejects(GenerationParams {
            length_penalty: Some(f32::NAN),
            ..Default::default()
        }));
        assert!(rejects(GenerationParams {
            bad_words_ids: Some(vec![vec![7], vec![]]),
            ..Default::default()
        }));
        assert!(rejects(GenerationParams {
            max_length: Some(10),
            min_length: Some(11),
            ..Default::default()
        }));
    }

    #[test]
    fn test_sampling_many_returns_is_valid() {
        let overrides = GenerationParams {
            do_sample: Some(true),
            num_return_sequences: Some(3),
            ..Default::default()
        };
        let config =
            resolve_generation_config(&GenerationParams::default(), None, Some(&overrides)).unwrap();
        assert_eq!(config.group_size(), 3);
    }

    #[test]
    fn test_temperature_ignored_without_sampling() {
        let overrides = GenerationParams {
            temperature: Some(0.0),
            ..Default::default()
        };
        assert!(resolve_generation_config(&GenerationParams::default(), None, Some(&overrides)).is_ok());
    }
}
