//! Token choice for greedy decoding and sampling.

use ndarray::{ArrayBase, Data, Ix1};
use rand::Rng;

use crate::common::math::{argmax, softmax};

/// A chosen token and its log-probability under the processed scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Choice {
    pub token: u32,
    pub log_prob: f32,
}

fn log_prob_of<S>(scores: &ArrayBase<S, Ix1>, idx: usize) -> f32
where
    S: Data<Elem = f32>,
{
    let max = scores.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    let log_sum = scores.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
    scores[idx] - log_sum
}

/// Argmax; `None` when every token is banned.
pub(crate) fn greedy<S>(scores: &ArrayBase<S, Ix1>) -> Option<Choice>
where
    S: Data<Elem = f32>,
{
    let idx = argmax(scores)?;
    Some(Choice {
        token: idx as u32,
        log_prob: log_prob_of(scores, idx),
    })
}

/// Draws from `softmax(scores)`; `None` when every token is banned.
pub(crate) fn sample<S, R>(scores: &ArrayBase<S, Ix1>, rng: &mut R) -> Option<Choice>
where
    S: Data<Elem = f32>,
    R: Rng,
{
    let probs = softmax(scores);
    let idx = sample_from_probs(probs.view(), rng)?;
    Some(Choice {
        token: idx as u32,
        log_prob: log_prob_of(scores, idx),
    })
}

/// Inverse-CDF draw. Zero-probability entries are never returned.
pub(crate) fn sample_from_probs<S, R>(probs: ArrayBase<S, Ix1>, rng: &mut R) -> Option<usize>
where
    S: Data<Elem = f32>,
    R: Rng,
{
    let total: f32 = probs.sum();
    if !(total > 0.0) {
        return None;
    }
    let target = rng.r#gen::<f32>() * total;
    let mut cumulative = 0.0;
    let mut last = None;
    for (idx, &prob) in probs.iter().enumerate() {
        if prob <= 0.0 {
            continue;
        }
        cumulative += prob;
        last = Some(idx);
        if cumulative > target {
            return Some(idx);
        }
    }
    last
}
