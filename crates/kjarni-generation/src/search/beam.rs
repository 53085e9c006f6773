//! One beam-search step for one input group.

use std::cmp::Ordering;

use ndarray::ArrayView2;

use super::hypotheses::{BeamHypotheses, BeamHypothesis};
use crate::common::math::{log_softmax, top_k_indices};

/// A `(beam, token)` expansion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Candidate {
    pub score: f32,
    /// Beam index within the group.
    pub beam: usize,
    pub token: u32,
}

/// The next beams of one group.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GroupStep {
    /// Local source beam of each new slot.
    pub sources: Vec<usize>,
    pub tokens: Vec<u32>,
    pub scores: Vec<f32>,
    pub done: bool,
}

/// Score desc, then beam asc, then token asc.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.beam.cmp(&b.beam))
        .then(a.token.cmp(&b.token))
}

/// The best `2 * num_beams` expansions across all live beams of a group.
///
/// `logits` holds one processed score row per beam.
pub(crate) fn find_best_candidates(logits: ArrayView2<'_, f32>, beam_scores: &[f32]) -> Vec<Candidate> {
    let num_beams = beam_scores.len();
    let top_k_len = 2 * num_beams;
    let mut candidates = Vec::with_capacity(num_beams * top_k_len);

    for (beam, (&beam_score, row)) in beam_scores.iter().zip(logits.outer_iter()).enumerate() {
        if beam_score == f32::NEG_INFINITY {
            continue;
        }
        let log_probs = log_softmax(&row);
        for (token, log_prob) in top_k_indices(&log_probs, top_k_len) {
            candidates.push(Candidate {
                score: beam_score + log_prob,
                beam,
                token: token as u32,
            });
        }
    }

    candidates.sort_unstable_by(rank);
    candidates.truncate(top_k_len);
    candidates
}

/// Expands a group by one token.
///
/// Eos candidates ranked within the first `num_beams` become finished
/// hypotheses; the first `num_beams` other candidates become the next beams.
/// Missing beams are padded with dead (`-inf`) copies fed `pad_token_id`.
pub(crate) fn beam_step(
    logits: ArrayView2<'_, f32>,
    beams: &[&[u32]],
    beam_scores: &[f32],
    finished: &mut BeamHypotheses,
    is_eos: impl Fn(u32) -> bool,
    pad_token_id: u32,
) -> GroupStep {
    let num_beams = beam_scores.len();
    let candidates = find_best_candidates(logits, beam_scores);

    let mut step = GroupStep {
        sources: Vec::with_capacity(num_beams),
        tokens: Vec::with_capacity(num_beams),
        scores: Vec::with_capacity(num_beams),
        done: false,
    };

    for (global_rank, candidate) in candidates.into_iter().enumerate() {
        if is_eos(candidate.token) {
            if global_rank >= num_beams {
                continue;
            }
            let mut tokens = beams[candidate.beam].to_vec();
            tokens.push(candidate.token);
            finished.add(BeamHypothesis {
                tokens,
                score: candidate.score,
            });
        } else {
            step.sources.push(candidate.beam);
            step.tokens.push(candidate.token);
            step.scores.push(candidate.score);
            if step.sources.len() == num_beams {
                break;
            }
        }
    }

    let cur_len = beams.first().map_or(0, |b| b.len() + 1);
    let best_running = step.scores.first().copied().unwrap_or(f32::NEG_INFINITY);
    step.done = step.sources.is_empty() || finished.is_done(best_running, cur_len);

    // pad if beams died
    while step.sources.len() < num_beams {
        step.sources.push(step.sources.last().copied().unwrap_or(0));
        step.tokens.push(pad_token_id);
        step.scores.push(f32::NEG_INFINITY);
    }
    step
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn finished(num_beams: usize, early_stopping: bool) -> BeamHypotheses {
        BeamHypotheses::new(num_beams, 1.0, 1, 20, early_stopping)
    }

    #[test]
    fn test_find_best_candidates_sorting() {
        let logits =
            Array2::from_shape_vec((2, 3), vec![-1.0, -2.0, -3.0, -0.5, -4.0, -5.0]).unwrap();

        let candidates = find_best_candidates(logits.view(), &[0.0, 0.0]);

        let best = &candidates[0];
        assert_eq!(best.token, 0);
        assert_eq!(best.beam, 1);
        assert!((best.score - (-0.0405)).abs() < 0.001);

        let second = &candidates[1];
        assert_eq!(second.token, 0);
        assert_eq!(second.beam, 0);
        assert!((second.score - (-0.4076)).abs() < 0.001);
        assert_eq!(candidates.len(), 4);
    }

    #[test]
    fn test_find_best_candidates_ignores_dead_beams() {
        let logits = Array2::zeros((2, 5));
        let candidates = find_best_candidates(logits.view(), &[0.0, f32::NEG_INFINITY]);
        assert!(candidates.iter().all(|c| c.beam == 0));
    }

    #[test]
    fn test_find_best_candidates_tie_break() {
        // uniform rows, equal beam scores: beam 0 first, then lower token ids
        let logits = Array2::zeros((2, 4));
        let candidates = find_best_candidates(logits.view(), &[-1.0, -1.0]);
        let order: Vec<(usize, u32)> = candidates.iter().map(|c| (c.beam, c.token)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (0, 2), (0, 3)]);
    }

    #[test]
    fn test_find_best_candidates_small_vocab() {
        let logits = Array2::zeros((2, 2));
        let candidates = find_best_candidates(logits.view(), &[0.0, 0.0]);
        assert_eq!(candidates.len(), 4);
    }

    #[test]
    fn test_beam_step_eos_within_top_ranks_finishes() {
        // beam 0 strongly prefers eos (2), then 1
        let mut logits = Array2::from_elem((2, 4), -10.0f32);
        logits[[0, 2]] = 0.0;
        logits[[0, 1]] = -1.0;
        logits[[1, 3]] = -0.5;

        let history = [&[5u32][..], &[5u32][..]];
        let mut hyps = finished(2, false);
        let step = beam_step(logits.view(), &history, &[0.0, -0.5], &mut hyps, |t| t == 2, 0);

        assert_eq!(hyps.len(), 1);
        assert_eq!(hyps.best().unwrap().tokens, vec![5, 2]);
        assert_eq!(step.sources.len(), 2);
        assert!(!step.tokens.contains(&2));
        assert!(!step.done);
    }

    #[test]
    fn test_beam_step_pads_dead_beams() {
        // vocab of 2 where token 1 is eos: only one non-eos continuation per beam
        let logits = Array2::from_shape_vec((3, 2), vec![0.0, -1.0, 0.0, -1.0, 0.0, -1.0]).unwrap();
        let history = [&[5u32][..], &[5u32][..], &[5u32][..]];
        let mut hyps = BeamHypotheses::new(3, 1.0, 1, 20, false);

        let step = beam_step(
            logits.view(),
            &history,
            &[0.0, f32::NEG_INFINITY, f32::NEG_INFINITY],
            &mut hyps,
            |t| t == 1,
            9,
        );

        assert_eq!(step.sources, vec![0, 0, 0]);
        assert_eq!(step.tokens, vec![0, 9, 9]);
        assert_eq!(step.scores[1], f32::NEG_INFINITY);
        assert_eq!(hyps.len(), 1);
    }

    #[test]
    fn test_beam_step_group_done_when_bound_met() {
        let mut hyps = finished(1, true);
        hyps.add(BeamHypothesis {
            tokens: vec![5, 7, 2],
            score: -0.1,
        });

        let logits = Array2::from_elem((1, 4), 0.0f32);
        let history = [&[5u32, 7, 7][..]];
        let step = beam_step(logits.view(), &history, &[-10.0], &mut hyps, |t| t == 2, 0);
        assert!(step.done);
    }
}
