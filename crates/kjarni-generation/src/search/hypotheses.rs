//! Finished beam hypotheses and the early-stopping rule.

use std::cmp::Ordering;

#[derive(Clone, Debug, PartialEq)]
pub struct BeamHypothesis {
    /// Full padded history, prompt included.
    pub tokens: Vec<u32>,
    /// Sum of token log-probabilities.
    pub score: f32,
}

impl BeamHypothesis {
    /// `score / generated_len ^ length_penalty`
    pub fn normalized_score(&self, length_penalty: f32, prompt_len: usize) -> f32 {
        length_normalize(self.score, self.tokens.len().saturating_sub(prompt_len), length_penalty)
    }
}

pub(crate) fn length_normalize(score: f32, generated_len: usize, length_penalty: f32) -> f32 {
    let lp = if generated_len > 0 {
        (generated_len as f32).powf(length_penalty)
    } else {
        1.0
    };
    score / lp
}

/// The best `num_beams` finished hypotheses of one input, best first.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    hypotheses: Vec<(f32, BeamHypothesis)>,
    num_beams: usize,
    length_penalty: f32,
    prompt_len: usize,
    max_length: usize,
    early_stopping: bool,
}

impl BeamHypotheses {
    pub fn new(
        num_beams: usize,
        length_penalty: f32,
        prompt_len: usize,
        max_length: usize,
        early_stopping: bool,
    ) -> Self {
        Self {
            hypotheses: Vec::with_capacity(num_beams + 1),
            num_beams,
            length_penalty,
            prompt_len,
            max_length,
            early_stopping,
        }
    }

    pub fn len(&self) -> usize {
        self.hypotheses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hypotheses.is_empty()
    }

    /// Lowest normalized score kept, or `-inf` while not full.
    pub fn worst_score(&self) -> f32 {
        if self.hypotheses.len() < self.num_beams {
            f32::NEG_INFINITY
        } else {
            self.hypotheses.last().map_or(f32::NEG_INFINITY, |(s, _)| *s)
        }
    }

    pub fn add(&mut self, hypothesis: BeamHypothesis) {
        if hypothesis.score == f32::NEG_INFINITY {
            return;
        }
        let score = hypothesis.normalized_score(self.length_penalty, self.prompt_len);
        if self.hypotheses.len() >= self.num_beams && score <= self.worst_score() {
            return;
        }

        // insert after equal scores so earlier hypotheses win ties
        let at = self
            .hypotheses
            .partition_point(|(s, _)| s.total_cmp(&score) != Ordering::Less);
        self.hypotheses.insert(at, (score, hypothesis));
        self.hypotheses.truncate(self.num_beams);
    }

    /// Whether no unfinished beam can beat the worst kept hypothesis.
    ///
    /// `best_running_score` is the raw score of the best live beam and
    /// `cur_len` the padded sequence length after this step.
    pub fn is_done(&self, best_running_score: f32, cur_len: usize) -> bool {
        if self.hypotheses.len() < self.num_beams {
            return false;
        }
        if best_running_score == f32::NEG_INFINITY {
            return true;
        }

        let attainable_len = if !self.early_stopping && self.length_penalty > 0.0 {
            self.max_length
        } else {
            cur_len
        };
        let highest_attainable = length_normalize(
            best_running_score,
            attainable_len.saturating_sub(self.prompt_len),
            self.length_penalty,
        );
        self.worst_score() >= highest_attainable
    }

    pub fn best(&self) -> Option<&BeamHypothesis> {
        self.hypotheses.first().map(|(_, h)| h)
    }

    /// `(hypothesis, normalized score)` pairs, best first.
    pub fn into_sorted(self) -> Vec<(BeamHypothesis, f32)> {
        self.hypotheses.into_iter().map(|(s, h)| (h, s)).collect()
    }
}
