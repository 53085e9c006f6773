//! Numeric helpers over 1-D score vectors.

use std::cmp::Ordering;

use ndarray::{Array1, ArrayBase, Data, DataMut, Ix1};

/// Orders scores descending, then indices ascending. NaN sorts last.
#[inline]
pub(crate) fn desc_then_index(a: (usize, f32), b: (usize, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
}

/// In-place softmax. A row of all `-inf` becomes all zeros.
pub fn softmax_inplace<S>(scores: &mut ArrayBase<S, Ix1>)
where
    S: DataMut<Elem = f32>,
{
    let max = scores.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    if max == f32::NEG_INFINITY {
        scores.fill(0.0);
        return;
    }
    scores.mapv_inplace(|x| (x - max).exp());
    let sum = scores.sum();
    if sum > 0.0 {
        scores.mapv_inplace(|x| x / sum);
    }
}

pub fn softmax<S>(scores: &ArrayBase<S, Ix1>) -> Array1<f32>
where
    S: Data<Elem = f32>,
{
    let mut probs = scores.to_owned();
    softmax_inplace(&mut probs);
    probs
}

/// Numerically stable log-softmax.
pub fn log_softmax<S>(scores: &ArrayBase<S, Ix1>) -> Array1<f32>
where
    S: Data<Elem = f32>,
{
    let max = scores.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    if max == f32::NEG_INFINITY {
        return Array1::from_elem(scores.len(), f32::NEG_INFINITY);
    }
    let shifted = scores.mapv(|x| x - max);
    let log_sum = shifted.mapv(f32::exp).sum().ln();
    shifted - log_sum
}

/// Index of the highest finite-or-not score; ties go to the lowest index.
/// Returns `None` when every score is `-inf` (or NaN) or the vector is empty.
pub fn argmax<S>(scores: &ArrayBase<S, Ix1>) -> Option<usize>
where
    S: Data<Elem = f32>,
{
    let mut best: Option<(usize, f32)> = None;
    for (idx, &score) in scores.iter().enumerate() {
        if score.is_nan() || score == f32::NEG_INFINITY {
            continue;
        }
        match best {
            Some((_, b)) if score <= b => {}
            _ => best = Some((idx, score)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// The `k` best `(index, score)` pairs, descending, ties by lower index.
/// `-inf` entries are skipped.
pub fn top_k_indices<S>(scores: &ArrayBase<S, Ix1>, k: usize) -> Vec<(usize, f32)>
where
    S: Data<Elem = f32>,
{
    let mut indexed: Vec<(usize, f32)> = scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, s)| *s != f32::NEG_INFINITY && !s.is_nan())
        .collect();
    indexed.sort_unstable_by(|a, b| desc_then_index(*a, *b));
    indexed.truncate(k);
    indexed
}
