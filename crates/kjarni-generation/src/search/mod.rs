//! The search state machine.
//!
//! ```text
//! Initialized ──step()──▶ Stepping ──step()──▶ Stepping ... ──▶ Complete
//! ```
//!
//! Every step runs, in order: forward call, cache extend, logits pipeline,
//! token selection (greedy / sample / beam), cache reorder, sequence update,
//! callback and cancellation check, stopping check. State is fully updated
//! before the callback and cancellation token are consulted, so an early stop
//! always leaves a consistent result.

mod beam;
mod hypotheses;
mod select;


use std::collections::BTreeMap;
use std::time::Instant;

use ndarray::{concatenate, s, Array2, Axis, Ix3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::cache::{AttentionKind, CacheAdapter, KvCache};
use crate::common::{CancellationToken, StepControl, StepEvent, StepToken};
use crate::config::{DecodingStrategy, GenerationConfig, LengthBounds};
use crate::error::{GenerationError, Result};
use crate::logits::{apply_rows, LogitsPipeline};
use crate::model::{GenerationBackend, ModelArchitecture};
use crate::tensor::{self, NamedTensors};

pub use hypotheses::{BeamHypotheses, BeamHypothesis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Initialized,
    Stepping,
    Complete,
}

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every sequence emitted eos, or every beam group is finished.
    AllDone,
    /// The maximum length was reached.
    MaxLength,
    /// The step callback returned [`StepControl::Stop`].
    Callback,
    /// The cancellation token fired.
    Cancelled,
}

/// One candidate sequence (a beam, a sample, or the greedy path).
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    /// Index of the originating input.
    pub id: usize,
    /// Slot in the cache's beam dimension.
    pub slot: usize,
    /// Full history: left padding, prompt, generated tokens.
    pub tokens: Vec<u32>,
    /// Padded decoder prompt length.
    pub prompt_len: usize,
    /// Leading pad tokens in `tokens`.
    pub pad_len: usize,
    /// Cumulative log-probability.
    pub score: f32,
    pub done: bool,
}

impl Sequence {
    pub fn generated(&self) -> &[u32] {
        &self.tokens[self.prompt_len.min(self.tokens.len())..]
    }

    /// `tokens` without the left padding.
    pub fn output(&self) -> &[u32] {
        &self.tokens[self.pad_len.min(self.tokens.len())..]
    }

    pub fn is_live(&self) -> bool {
        !self.done && self.score != f32::NEG_INFINITY
    }
}

/// A returned sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSequence {
    /// Prompt (without padding) followed by the generated tokens.
    pub token_ids: Vec<u32>,
    /// Length-normalized score for beam search, cumulative log-probability otherwise.
    pub score: f32,
}

/// The decoder-side starting point of a search.
#[derive(Debug)]
pub struct SearchInputs {
    /// Decoder prompt per input, left-padded to one length.
    pub prompts: Vec<Vec<u32>>,
    pub pad_lens: Vec<usize>,
    /// Cache with `prompts.len() * group_size` beams.
    pub cache: KvCache,
    /// Prompt positions already covered by `cache`.
    pub past_len: usize,
}

#[derive(Debug)]
pub struct SearchOutcome {
    /// One list per input, best first, at most `num_return_sequences` long.
    pub groups: Vec<Vec<GeneratedSequence>>,
    pub stop_reason: StopReason,
    pub steps: usize,
    pub cache: KvCache,
}

/// Drives decode steps for one generation call.
pub struct SearchMachine<'a> {
    backend: &'a dyn GenerationBackend,
    adapter: CacheAdapter,
    config: &'a GenerationConfig,
    /// One pipeline per distinct padding length.
    pipelines: Vec<LogitsPipeline>,
    /// Index into `pipelines` for each input.
    pipeline_of: Vec<usize>,
    bounds: LengthBounds,
    strategy: DecodingStrategy,
    group_size: usize,
    vocab_size: usize,

    sequences: Vec<Sequence>,
    cache: KvCache,
    /// Token ids fed on the next step, `[n, s]`.
    input_ids: Array2<u32>,
    /// Mask over cached plus pending positions, `[n, past + s]`.
    attention_mask: Array2<f32>,
    finished: Vec<BeamHypotheses>,
    group_done: Vec<bool>,

    rng: StdRng,
    cancellation: CancellationToken,
    state: SearchState,
    steps: usize,
    stop_reason: Option<StopReason>,
}

impl<'a> SearchMachine<'a> {
    pub fn new(
        backend: &'a dyn GenerationBackend,
        adapter: CacheAdapter,
        config: &'a GenerationConfig,
        inputs: SearchInputs,
        cancellation: CancellationToken,
    ) -> Result<Self> {
        let SearchInputs {
            prompts,
            pad_lens,
            cache,
            past_len,
        } = inputs;

        let batch_size = prompts.len();
        let prompt_len = prompts.first().map_or(0, Vec::len);
        if batch_size == 0 || prompt_len == 0 {
            return Err(GenerationError::invalid_input("empty decoder prompt"));
        }
        if prompts.iter().any(|p| p.len() != prompt_len) || pad_lens.len() != batch_size {
            return Err(GenerationError::invalid_input(
                "decoder prompts must be padded to one length",
            ));
        }

        let strategy = config.strategy();
        let group_size = config.group_size();
        let num_seqs = batch_size * group_size;
        if cache.num_beams() != num_seqs || cache.group_size() != group_size {
            return Err(GenerationError::cache(format!(
                "cache holds {} beams in groups of {}, search needs {} in groups of {}",
                cache.num_beams(),
                cache.group_size(),
                num_seqs,
                group_size
            )));
        }
        let cached = cache.seq_len(AttentionKind::SelfAttention);
        if cached != past_len || past_len >= prompt_len {
            return Err(GenerationError::cache(format!(
                "cache covers {} positions, expected {} of a {}-token prompt",
                cached, past_len, prompt_len
            )));
        }

        let bounds = config.length_bounds(prompt_len)?;

        // processors see unpadded histories, so rows with different padding
        // need their own positions
        let mut by_pad: BTreeMap<usize, usize> = BTreeMap::new();
        let mut pipelines = Vec::new();
        let pipeline_of: Vec<usize> = pad_lens
            .iter()
            .map(|&pad_len| {
                *by_pad.entry(pad_len).or_insert_with(|| {
                    let row = config.row_bounds(&bounds, pad_len);
                    pipelines.push(LogitsPipeline::from_config(config, &row));
                    pipelines.len() - 1
                })
            })
            .collect();

        let mut sequences = Vec::with_capacity(num_seqs);
        for (id, (prompt, &pad_len)) in prompts.iter().zip(&pad_lens).enumerate() {
            for j in 0..group_size {
                // only the first beam of a group is live until the first expansion
                let score = match strategy {
                    DecodingStrategy::BeamSearch { .. } if j > 0 => f32::NEG_INFINITY,
                    _ => 0.0,
                };
                sequences.push(Sequence {
                    id,
                    slot: id * group_size + j,
                    tokens: prompt.clone(),
                    prompt_len,
                    pad_len,
                    score,
                    done: false,
                });
            }
        }

        let attention_mask = Array2::from_shape_fn((num_seqs, prompt_len), |(r, c)| {
            if c < sequences[r].pad_len {
                0.0
            } else {
                1.0
            }
        });
        let input_ids = Array2::from_shape_fn((num_seqs, prompt_len - past_len), |(r, c)| {
            sequences[r].tokens[past_len + c]
        });

        let finished = match strategy {
            DecodingStrategy::BeamSearch { num_beams } => (0..batch_size)
                .map(|_| {
                    BeamHypotheses::new(
                        num_beams,
                        config.length_penalty,
                        prompt_len,
                        bounds.max_length,
                        config.early_stopping,
                    )
                })
                .collect(),
            _ => Vec::new(),
        };

        let rng = config
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);

        Ok(Self {
            backend,
            adapter,
            config,
            pipelines,
            pipeline_of,
            bounds,
            strategy,
            group_size,
            vocab_size: backend.metadata().vocab_size,
            sequences,
            cache,
            input_ids,
            attention_mask,
            finished,
            group_done: vec![false; batch_size],
            rng,
            cancellation,
            state: SearchState::Initialized,
            steps: 0,
            stop_reason: None,
        })
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    pub fn bounds(&self) -> &LengthBounds {
        &self.bounds
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    fn num_groups(&self) -> usize {
        self.group_done.len()
    }

    /// Positions of the pending input tokens; padding maps to 0.
    fn position_ids(&self) -> Array2<u32> {
        let start = self.attention_mask.ncols() - self.input_ids.ncols();
        Array2::from_shape_fn(self.input_ids.dim(), |(r, c)| {
            let pos = start + c;
            pos.saturating_sub(self.sequences[r].pad_len) as u32
        })
    }

    /// Runs one decode step.
    pub async fn step(&mut self) -> Result<()> {
        if self.state == SearchState::Complete {
            return Ok(());
        }
        self.state = SearchState::Stepping;

        let num_seqs = self.sequences.len();
        let new_tokens = self.input_ids.ncols();

        let mut inputs: NamedTensors = self.adapter.slice_for_step(&self.cache);
        inputs.insert(tensor::INPUT_IDS, self.input_ids.clone());
        inputs.insert(tensor::ATTENTION_MASK, self.attention_mask.clone());
        if self.adapter.architecture() == ModelArchitecture::DecoderOnly {
            inputs.insert(tensor::POSITION_IDS, self.position_ids());
        }

        let mut outputs = self
            .backend
            .decode_step(inputs)
            .await
            .map_err(GenerationError::ForwardStep)?;

        let logits = outputs.take_f32::<Ix3>(tensor::LOGITS)?;
        let (rows, positions, vocab) = logits.dim();
        if rows != num_seqs || positions == 0 || vocab != self.vocab_size {
            return Err(GenerationError::malformed(format!(
                "logits shape {:?}, expected [{}, _, {}]",
                logits.shape(),
                num_seqs,
                self.vocab_size
            )));
        }
        let mut logits = logits.index_axis_move(Axis(1), positions - 1);

        self.adapter.extend(&mut self.cache, &mut outputs, new_tokens)?;

        {
            let histories: Vec<&[u32]> = self.sequences.iter().map(Sequence::output).collect();
            let owners: Vec<usize> = self.sequences.iter().map(|s| self.pipeline_of[s.id]).collect();
            apply_rows(&self.pipelines, &owners, &histories, &mut logits)?;
        }

        let (next_tokens, emitted) = match self.strategy {
            DecodingStrategy::BeamSearch { .. } => self.advance_beams(&logits)?,
            DecodingStrategy::Greedy | DecodingStrategy::Sample => self.choose_tokens(&logits),
        };

        self.input_ids = Array2::from_shape_fn((num_seqs, 1), |(r, _)| next_tokens[r]);
        let column = Array2::from_shape_fn((num_seqs, 1), |(r, _)| {
            if self.sequences[r].is_live() {
                1.0
            } else {
                0.0
            }
        });
        self.attention_mask = concatenate(Axis(1), &[self.attention_mask.view(), column.view()])
            .map_err(|e| GenerationError::cache(e.to_string()))?;

        let step = self.steps;
        self.steps += 1;
        let cur_len = self.attention_mask.ncols();
        log::trace!(
            "step {} cur_len {} emitted {} live {}",
            step,
            cur_len,
            emitted.len(),
            self.sequences.iter().filter(|s| s.is_live()).count()
        );

        let natural = if cur_len >= self.bounds.max_length {
            Some(StopReason::MaxLength)
        } else if self.all_done() {
            Some(StopReason::AllDone)
        } else {
            None
        };

        let callback_stop = self.config.callback.as_ref().is_some_and(|callback| {
            let event = StepEvent {
                step,
                cur_len,
                tokens: &emitted,
            };
            callback.on_step(&event) == StepControl::Stop
        });

        let reason = natural.or(if callback_stop {
            Some(StopReason::Callback)
        } else if self.cancellation.is_cancelled() {
            Some(StopReason::Cancelled)
        } else {
            None
        });
        if let Some(reason) = reason {
            self.complete(reason);
        }
        Ok(())
    }

    /// Greedy or sampled choice for every unfinished sequence.
    fn choose_tokens(&mut self, logits: &Array2<f32>) -> (Vec<u32>, Vec<StepToken>) {
        let pad = self.config.pad_token_id;
        let max_length = self.bounds.max_length;
        let sampling = self.strategy == DecodingStrategy::Sample;

        let mut next_tokens = vec![pad; self.sequences.len()];
        let mut emitted = Vec::with_capacity(self.sequences.len());

        for (slot, row) in logits.outer_iter().enumerate() {
            let seq = &mut self.sequences[slot];
            if seq.done {
                continue;
            }
            let choice = if sampling {
                select::sample(&row, &mut self.rng)
            } else {
                select::greedy(&row)
            };
            let Some(choice) = choice else {
                log::warn!(
                    "Sequence {} of input {} has no admissible token; stopping it",
                    slot,
                    seq.id
                );
                seq.done = true;
                continue;
            };

            seq.tokens.push(choice.token);
            seq.score += choice.log_prob;
            if self.config.is_eos(choice.token) || seq.tokens.len() >= max_length {
                seq.done = true;
            } else {
                next_tokens[slot] = choice.token;
            }
            emitted.push(StepToken {
                input_id: seq.id,
                slot,
                token_id: choice.token,
            });
        }
        (next_tokens, emitted)
    }

    /// One beam-search expansion for every unfinished group, in parallel.
    fn advance_beams(&mut self, logits: &Array2<f32>) -> Result<(Vec<u32>, Vec<StepToken>)> {
        let num_beams = self.group_size;
        let num_seqs = self.sequences.len();
        let config = self.config;
        let pad = config.pad_token_id;
        let sequences = &self.sequences;

        let updates: Vec<Option<beam::GroupStep>> = self
            .finished
            .par_iter_mut()
            .zip(self.group_done.par_iter())
            .enumerate()
            .map(|(group, (finished, &done))| {
                if done {
                    return None;
                }
                let (start, end) = (group * num_beams, (group + 1) * num_beams);
                let beams: Vec<&[u32]> =
                    sequences[start..end].iter().map(|s| s.tokens.as_slice()).collect();
                let scores: Vec<f32> = sequences[start..end].iter().map(|s| s.score).collect();
                Some(beam::beam_step(
                    logits.slice(s![start..end, ..]),
                    &beams,
                    &scores,
                    finished,
                    |token| config.is_eos(token),
                    pad,
                ))
            })
            .collect();

        let mut permutation: Vec<usize> = (0..num_seqs).collect();
        let mut next_tokens = vec![pad; num_seqs];
        let mut emitted = Vec::with_capacity(num_seqs);
        let mut reordered = Vec::with_capacity(num_seqs);

        for (group, update) in updates.into_iter().enumerate() {
            let base = group * num_beams;
            let Some(update) = update else {
                reordered.extend_from_slice(&self.sequences[base..base + num_beams]);
                continue;
            };
            for j in 0..num_beams {
                let source = base + update.sources[j];
                permutation[base + j] = source;

                let mut seq = self.sequences[source].clone();
                seq.slot = base + j;
                seq.tokens.push(update.tokens[j]);
                seq.score = update.scores[j];
                seq.done = update.done;
                if seq.score != f32::NEG_INFINITY {
                    emitted.push(StepToken {
                        input_id: seq.id,
                        slot: seq.slot,
                        token_id: update.tokens[j],
                    });
                    if !update.done {
                        next_tokens[base + j] = update.tokens[j];
                    }
                }
                reordered.push(seq);
            }
            self.group_done[group] = update.done;
        }

        self.adapter.reorder(&mut self.cache, &permutation)?;
        self.attention_mask = self.attention_mask.select(Axis(0), &permutation);
        self.sequences = reordered;
        Ok((next_tokens, emitted))
    }

    fn all_done(&self) -> bool {
        match self.strategy {
            DecodingStrategy::BeamSearch { .. } => self.group_done.iter().all(|&d| d),
            _ => self.sequences.iter().all(|s| s.done),
        }
    }

    fn complete(&mut self, reason: StopReason) {
        if let DecodingStrategy::BeamSearch { .. } = self.strategy {
            // unfinished groups keep their live beams as hypotheses
            for group in 0..self.num_groups() {
                if self.group_done[group] {
                    continue;
                }
                let base = group * self.group_size;
                for seq in &self.sequences[base..base + self.group_size] {
                    if seq.score != f32::NEG_INFINITY {
                        self.finished[group].add(BeamHypothesis {
                            tokens: seq.tokens.clone(),
                            score: seq.score,
                        });
                    }
                }
                self.group_done[group] = true;
            }
        }
        for seq in &mut self.sequences {
            seq.done = true;
        }
        self.state = SearchState::Complete;
        self.stop_reason = Some(reason);
    }

    /// Steps until complete and collects the results.
    pub async fn run(mut self) -> Result<SearchOutcome> {
        let start = Instant::now();
        if self.bounds.max_new_tokens() == 0 {
            log::warn!(
                "Input length {} already reaches max length {}; nothing will be generated. \
                 Consider setting max_new_tokens.",
                self.bounds.prompt_len,
                self.bounds.max_length
            );
            self.complete(StopReason::MaxLength);
        }
        while self.state != SearchState::Complete {
            self.step().await?;
        }

        let elapsed = start.elapsed();
        log::debug!(
            "Search finished: {:?} after {} steps in {:.2?} ({:?})",
            self.stop_reason,
            self.steps,
            elapsed,
            self.strategy
        );
        Ok(self.finish())
    }

    fn finish(self) -> SearchOutcome {
        let keep = self.config.num_return_sequences;
        let group_size = self.group_size;

        let groups = match self.strategy {
            DecodingStrategy::BeamSearch { .. } => self
                .finished
                .into_iter()
                .enumerate()
                .map(|(group, hypotheses)| {
                    let pad_len = self.sequences[group * group_size].pad_len;
                    hypotheses
                        .into_sorted()
                        .into_iter()
                        .take(keep)
                        .map(|(hypothesis, score)| GeneratedSequence {
                            token_ids: hypothesis.tokens[pad_len.min(hypothesis.tokens.len())..]
                                .to_vec(),
                            score,
                        })
                        .collect()
                })
                .collect(),
            DecodingStrategy::Greedy | DecodingStrategy::Sample => self
                .sequences
                .chunks(group_size)
                .map(|group| {
                    let mut ranked: Vec<&Sequence> = group.iter().collect();
                    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
                    ranked
                        .into_iter()
                        .take(keep)
                        .map(|seq| GeneratedSequence {
                            token_ids: seq.output().to_vec(),
                            score: seq.score,
                        })
                        .collect()
                })
                .collect(),
        };

        SearchOutcome {
            groups,
            stop_reason: self.stop_reason.unwrap_or(StopReason::AllDone),
            steps: self.steps,
            cache: self.cache,
        }
    }
}
