//! The logits processor pipeline.
//!
//! Stages run in a fixed order, each only when its parameter is active:
//!
//! 1. forced tokens
//! 2. minimum length
//! 3. no-repeat n-gram
//! 4. bad words
//! 5. repetition penalty
//! 6. temperature (sampling only)
//! 7. top-k (sampling only)
//! 8. top-p (sampling only)

mod processors;
mod warpers;

#[cfg(test)]
mod tests;

use std::fmt;

use ndarray::{Array2, ArrayViewMut1};
use rayon::prelude::*;

use crate::config::{GenerationConfig, LengthBounds};
use crate::error::{GenerationError, Result};

pub use processors::{
    BadWordsProcessor, ForcedTokensProcessor, MinLengthProcessor, NoRepeatNGramProcessor,
    RepetitionPenaltyProcessor,
};
pub use warpers::{TemperatureWarper, TopKWarper, TopPWarper};

/// A pure transformation of one sequence's next-token scores.
///
/// `tokens` is the history of the sequence (prompt included, left padding
/// excluded); its length is the position of the token being chosen.
pub trait LogitsProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, tokens: &[u32], scores: &mut ArrayViewMut1<'_, f32>);
}

/// An ordered chain of [`LogitsProcessor`]s, built once per call.
#[derive(Default)]
pub struct LogitsPipeline {
    processors: Vec<Box<dyn LogitsProcessor>>,
}

impl LogitsPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    pub fn push(&mut self, processor: impl LogitsProcessor + 'static) {
        self.processors.push(Box::new(processor));
    }

    pub fn from_config(config: &GenerationConfig, bounds: &LengthBounds) -> Self {
        let mut pipeline = Self::new();

        let mut forced = ForcedTokensProcessor::new(config.forced_decoder_ids.clone());
        if let Some(bos) = config.forced_bos_token_id {
            forced.force_if_vacant(bounds.prompt_len, bos);
        }
        if let (Some(eos), Some(last)) = (config.forced_eos_token_id, bounds.max_length.checked_sub(1)) {
            forced.force_if_vacant(last, eos);
        }
        if !forced.is_empty() {
            pipeline.push(forced);
        }

        if bounds.min_length > bounds.prompt_len && !config.eos_token_id.is_empty() {
            pipeline.push(MinLengthProcessor::new(
                bounds.min_length,
                config.eos_token_id.clone(),
            ));
        }
        if config.no_repeat_ngram_size > 0 {
            pipeline.push(NoRepeatNGramProcessor::new(config.no_repeat_ngram_size));
        }
        if !config.bad_words_ids.is_empty() {
            pipeline.push(BadWordsProcessor::new(config.bad_words_ids.clone()));
        }
        if config.repetition_penalty != 1.0 {
            pipeline.push(RepetitionPenaltyProcessor::new(config.repetition_penalty));
        }

        if config.do_sample {
            if config.temperature != 1.0 {
                pipeline.push(TemperatureWarper::new(config.temperature));
            }
            if config.top_k > 0 {
                pipeline.push(TopKWarper::new(config.top_k));
            }
            if config.top_p < 1.0 {
                pipeline.push(TopPWarper::new(config.top_p));
            }
        }

        log::debug!("Logits pipeline: {:?}", pipeline.names());
        pipeline
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Runs every stage, left to right, on one score vector.
    pub fn apply(&self, tokens: &[u32], scores: &mut ArrayViewMut1<'_, f32>) {
        for processor in &self.processors {
            processor.process(tokens, scores);
        }
    }

    /// Runs the pipeline on each row of a `[sequences, vocab]` matrix in parallel.
    pub fn apply_batch(&self, histories: &[&[u32]], scores: &mut Array2<f32>) -> Result<()> {
        check_rows(histories.len(), scores)?;
        if self.processors.is_empty() {
            return Ok(());
        }
        scores
            .outer_iter_mut()
            .into_par_iter()
            .zip(histories.par_iter())
            .for_each(|(mut row, tokens)| self.apply(tokens, &mut row));
        Ok(())
    }
}

/// Runs row `i` of a `[sequences, vocab]` matrix through
/// `pipelines[owners[i]]`, in parallel.
///
/// Used when rows of one batch need different position-dependent stages,
/// e.g. left-padded prompts of different lengths.
pub fn apply_rows(
    pipelines: &[LogitsPipeline],
    owners: &[usize],
    histories: &[&[u32]],
    scores: &mut Array2<f32>,
) -> Result<()> {
    check_rows(histories.len(), scores)?;
    if owners.len() != histories.len() || owners.iter().any(|&o| o >= pipelines.len()) {
        return Err(GenerationError::invalid_input(format!(
            "{} row owners for {} rows and {} pipelines",
            owners.len(),
            histories.len(),
            pipelines.len()
        )));
    }
    if pipelines.iter().all(LogitsPipeline::is_empty) {
        return Ok(());
    }
    scores
        .outer_iter_mut()
        .into_par_iter()
        .zip(histories.par_iter().zip(owners.par_iter()))
        .for_each(|(mut row, (tokens, &owner))| pipelines[owner].apply(tokens, &mut row));
    Ok(())
}

fn check_rows(sequences: usize, scores: &Array2<f32>) -> Result<()> {
    if sequences != scores.nrows() {
        return Err(GenerationError::malformed(format!(
            "logits have {} rows but {} sequences are live",
            scores.nrows(),
            sequences
        )));
    }
    Ok(())
}

impl fmt::Debug for LogitsPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
