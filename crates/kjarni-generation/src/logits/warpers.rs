//! Sampling warpers: reshape the distribution before a draw.

use ndarray::ArrayViewMut1;

use super::LogitsProcessor;
use crate::common::math::{desc_then_index, softmax, top_k_indices};

#[derive(Debug, Clone, Copy)]
pub struct TemperatureWarper {
    temperature: f32,
}

impl TemperatureWarper {
    pub fn new(temperature: f32) -> Self {
        Self { temperature }
    }
}

impl LogitsProcessor for TemperatureWarper {
    fn name(&self) -> &'static str {
        "temperature"
    }

    fn process(&self, _tokens: &[u32], scores: &mut ArrayViewMut1<'_, f32>) {
        let t = self.temperature;
        scores.mapv_inplace(|x| x / t);
    }
}

/// Keeps the `k` highest scores; ties go to the lower token id.
#[derive(Debug, Clone, Copy)]
pub struct TopKWarper {
    top_k: usize,
}

impl TopKWarper {
    pub fn new(top_k: usize) -> Self {
        Self { top_k }
    }
}

impl LogitsProcessor for TopKWarper {
    fn name(&self) -> &'static str {
        "top_k"
    }

    fn process(&self, _tokens: &[u32], scores: &mut ArrayViewMut1<'_, f32>) {
        if self.top_k == 0 || self.top_k >= scores.len() {
            return;
        }
        let mut keep = vec![false; scores.len()];
        for (idx, _) in top_k_indices(&*scores, self.top_k) {
            keep[idx] = true;
        }
        for (score, keep) in scores.iter_mut().zip(keep) {
            if !keep {
                *score = f32::NEG_INFINITY;
            }
        }
    }
}

/// Nucleus filtering: keeps the smallest high-probability prefix whose mass
/// reaches `top_p`. At least one token always survives.
#[derive(Debug, Clone, Copy)]
pub struct TopPWarper {
    top_p: f32,
}

impl TopPWarper {
    pub fn new(top_p: f32) -> Self {
        Self { top_p }
    }
}

impl LogitsProcessor for TopPWarper {
    fn name(&self) -> &'static str {
        "top_p"
    }

    fn process(&self, _tokens: &[u32], scores: &mut ArrayViewMut1<'_, f32>) {
        if self.top_p >= 1.0 {
            return;
        }
        let probs = softmax(&*scores);
        let mut order: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        order.sort_unstable_by(|a, b| desc_then_index(*a, *b));

        let mut cumulative = 0.0f32;
        let mut cutoff = order.len();
        for (rank, &(_, prob)) in order.iter().enumerate() {
            cumulative += prob;
            if cumulative >= self.top_p {
                cutoff = rank + 1;
                break;
            }
        }
        for &(idx, _) in &order[cutoff.max(1)..] {
            scores[idx] = f32::NEG_INFINITY;
        }
    }
}
