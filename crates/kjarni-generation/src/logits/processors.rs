//! Constraint processors: they ban or force tokens but never rescale.

use std::collections::{BTreeMap, HashSet};

use ndarray::ArrayViewMut1;

use super::LogitsProcessor;

/// Collapses the distribution onto a fixed token at given absolute positions.
///
/// The position of the next token is the length of the history.
#[derive(Debug, Clone, Default)]
pub struct ForcedTokensProcessor {
    table: BTreeMap<usize, u32>,
}

impl ForcedTokensProcessor {
    pub fn new(table: BTreeMap<usize, u32>) -> Self {
        Self { table }
    }

    /// Adds an entry unless the position is already forced.
    pub fn force_if_vacant(&mut self, position: usize, token_id: u32) {
        self.table.entry(position).or_insert(token_id);
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn forced_at(&self, position: usize) -> Option<u32> {
        self.table.get(&position).copied()
    }
}

impl LogitsProcessor for ForcedTokensProcessor {
    fn name(&self) -> &'static str {
        "forced_tokens"
    }

    fn process(&self, tokens: &[u32], scores: &mut ArrayViewMut1<'_, f32>) {
        let Some(forced) = self.forced_at(tokens.len()) else {
            return;
        };
        let idx = forced as usize;
        if idx < scores.len() {
            scores.fill(f32::NEG_INFINITY);
            scores[idx] = 0.0;
        }
    }
}

/// Bans every eos id while the sequence is shorter than `min_length`.
#[derive(Debug, Clone)]
pub struct MinLengthProcessor {
    min_length: usize,
    eos_token_ids: Vec<u32>,
}

impl MinLengthProcessor {
    pub fn new(min_length: usize, eos_token_ids: Vec<u32>) -> Self {
        Self {
            min_length,
            eos_token_ids,
        }
    }
}

impl LogitsProcessor for MinLengthProcessor {
    fn name(&self) -> &'static str {
        "min_length"
    }

    fn process(&self, tokens: &[u32], scores: &mut ArrayViewMut1<'_, f32>) {
        if tokens.len() >= self.min_length {
            return;
        }
        for &eos in &self.eos_token_ids {
            if let Some(score) = scores.get_mut(eos as usize) {
                *score = f32::NEG_INFINITY;
            }
        }
    }
}

/// Bans any token that would repeat an n-gram already present in the history.
#[derive(Debug, Clone, Copy)]
pub struct NoRepeatNGramProcessor {
    ngram_size: usize,
}

impl NoRepeatNGramProcessor {
    pub fn new(ngram_size: usize) -> Self {
        Self { ngram_size }
    }
}

impl LogitsProcessor for NoRepeatNGramProcessor {
    fn name(&self) -> &'static str {
        "no_repeat_ngram"
    }

    fn process(&self, tokens: &[u32], scores: &mut ArrayViewMut1<'_, f32>) {
        let n = self.ngram_size;
        // Need at least n-1 tokens to form a prefix
        if n == 0 || tokens.len() + 1 < n {
            return;
        }

        // The last n-1 tokens form the current prefix
        let current_prefix = &tokens[tokens.len() - (n - 1)..];

        // Look for any historical n-gram that starts with this prefix
        for window in tokens.windows(n) {
            if &window[..n - 1] == current_prefix {
                if let Some(score) = scores.get_mut(window[n - 1] as usize) {
                    *score = f32::NEG_INFINITY;
                }
            }
        }
    }
}

/// Bans the last token of any forbidden sequence whose prefix ends the history.
#[derive(Debug, Clone)]
pub struct BadWordsProcessor {
    bad_words_ids: Vec<Vec<u32>>,
}

impl BadWordsProcessor {
    pub fn new(bad_words_ids: Vec<Vec<u32>>) -> Self {
        Self { bad_words_ids }
    }
}

impl LogitsProcessor for BadWordsProcessor {
    fn name(&self) -> &'static str {
        "bad_words"
    }

    fn process(&self, tokens: &[u32], scores: &mut ArrayViewMut1<'_, f32>) {
        for sequence in &self.bad_words_ids {
            let Some((&last, prefix)) = sequence.split_last() else {
                continue;
            };
            if tokens.ends_with(prefix) {
                if let Some(score) = scores.get_mut(last as usize) {
                    *score = f32::NEG_INFINITY;
                }
            }
        }
    }
}

/// Penalises every distinct token already in the history, once.
#[derive(Debug, Clone, Copy)]
pub struct RepetitionPenaltyProcessor {
    penalty: f32,
}

impl RepetitionPenaltyProcessor {
    pub fn new(penalty: f32) -> Self {
        Self { penalty }
    }
}

impl LogitsProcessor for RepetitionPenaltyProcessor {
    fn name(&self) -> &'static str {
        "repetition_penalty"
    }

    fn process(&self, tokens: &[u32], scores: &mut ArrayViewMut1<'_, f32>) {
        if self.penalty == 1.0 {
            return;
        }
        let seen: HashSet<u32> = tokens.iter().copied().collect();
        for token in seen {
            if let Some(score) = scores.get_mut(token as usize) {
                if *score < 0.0 {
                    *score *= self.penalty;
                } else {
                    *score /= self.penalty;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    fn run(processor: &dyn LogitsProcessor, tokens: &[u32], scores: Array1<f32>) -> Array1<f32> {
        let mut scores = scores;
        processor.process(tokens, &mut scores.view_mut());
        scores
    }

    // ============== forced tokens ==============

    #[test]
    fn test_forced_token_collapses_distribution() {
        let processor = ForcedTokensProcessor::new(BTreeMap::from([(2, 3)]));
        let scores = run(&processor, &[5, 6], array![1.0, 2.0, 3.0, -1.0]);
        assert_eq!(scores, array![f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY, 0.0]);
    }

    #[test]
    fn test_forced_token_other_positions_untouched() {
        let processor = ForcedTokensProcessor::new(BTreeMap::from([(2, 3)]));
        let scores = run(&processor, &[5], array![1.0, 2.0, 3.0, -1.0]);
        assert_eq!(scores, array![1.0, 2.0, 3.0, -1.0]);
    }

    #[test]
    fn test_force_if_vacant_keeps_existing() {
        let mut processor = ForcedTokensProcessor::new(BTreeMap::from([(1, 9)]));
        processor.force_if_vacant(1, 4);
        processor.force_if_vacant(5, 2);
        assert_eq!(processor.forced_at(1), Some(9));
        assert_eq!(processor.forced_at(5), Some(2));
    }

    // ============== min length ==============

    #[test]
    fn test_min_length_bans_all_eos() {
        let processor = MinLengthProcessor::new(4, vec![0, 2]);
        let scores = run(&processor, &[1, 1, 1], array![5.0, 1.0, 5.0]);
        assert_eq!(scores, array![f32::NEG_INFINITY, 1.0, f32::NEG_INFINITY]);

        let scores = run(&processor, &[1, 1, 1, 1], array![5.0, 1.0, 5.0]);
        assert_eq!(scores, array![5.0, 1.0, 5.0]);
    }

    // ============== no repeat ngram ==============

    #[test]
    fn test_no_repeat_bigram() {
        // history contains (3, 4); current prefix is 3 -> ban 4
        let processor = NoRepeatNGramProcessor::new(2);
        let scores = run(&processor, &[3, 4, 1, 3], Array1::zeros(6));
        assert_eq!(scores[4], f32::NEG_INFINITY);
        assert_eq!(scores.iter().filter(|s| s.is_infinite()).count(), 1);
    }

    #[test]
    fn test_no_repeat_trigram_needs_prefix() {
        let processor = NoRepeatNGramProcessor::new(3);
        let scores = run(&processor, &[1], Array1::zeros(4));
        assert!(scores.iter().all(|s| s.is_finite()));

        let scores = run(&processor, &[1, 2, 3, 1, 2], Array1::zeros(4));
        assert_eq!(scores[3], f32::NEG_INFINITY);
    }

    #[test]
    fn test_no_repeat_unigram_bans_history() {
        let processor = NoRepeatNGramProcessor::new(1);
        let scores = run(&processor, &[0, 2], Array1::zeros(4));
        assert_eq!(scores, array![f32::NEG_INFINITY, 0.0, f32::NEG_INFINITY, 0.0]);
    }

    // ============== bad words ==============

    #[test]
    fn test_bad_words_multi_token() {
        let processor = BadWordsProcessor::new(vec![vec![7, 9]]);

        let scores = run(&processor, &[1, 7], Array1::zeros(10));
        assert_eq!(scores[9], f32::NEG_INFINITY);

        let scores = run(&processor, &[7, 1], Array1::zeros(10));
        assert!(scores.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_bad_words_single_token_always_banned() {
        let processor = BadWordsProcessor::new(vec![vec![3]]);
        let scores = run(&processor, &[], Array1::zeros(5));
        assert_eq!(scores[3], f32::NEG_INFINITY);
    }

    #[test]
    fn test_bad_words_out_of_vocab_ignored() {
        let processor = BadWordsProcessor::new(vec![vec![99]]);
        let scores = run(&processor, &[1], Array1::zeros(5));
        assert!(scores.iter().all(|s| s.is_finite()));
    }

    // ============== repetition penalty ==============

    #[test]
    fn test_repetition_penalty_once_per_token() {
        let processor = RepetitionPenaltyProcessor::new(2.0);
        let scores = run(&processor, &[0, 0, 0, 1], array![4.0, -1.0, 3.0]);
        assert_eq!(scores, array![2.0, -2.0, 3.0]);
    }

    #[test]
    fn test_repetition_penalty_identity() {
        let processor = RepetitionPenaltyProcessor::new(1.0);
        let scores = run(&processor, &[0, 1], array![4.0, -1.0]);
        assert_eq!(scores, array![4.0, -1.0]);
    }
}
