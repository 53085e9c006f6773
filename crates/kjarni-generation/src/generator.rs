//! The public entry point of a generation call.

use std::sync::Arc;
use std::time::Instant;

use ndarray::{Array2, Axis, Ix3};

use crate::cache::{AttentionKind, CacheAdapter, EncoderState, KvCache};
use crate::common::CancellationToken;
use crate::config::{resolve_generation_config, GenerationConfig, GenerationParams};
use crate::error::{GenerationError, Result};
use crate::model::{GenerationBackend, ModelArchitecture, ModelMetadata};
use crate::search::{GeneratedSequence, SearchInputs, SearchMachine, StopReason};
use crate::tensor::{self, NamedTensors};

/// Per-call options beyond the generation parameters.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub cancellation: CancellationToken,
    /// Hand the cache back in [`GenerationResult::cache`].
    pub return_cache: bool,
    /// A cache returned by an earlier call, covering a prefix of the inputs.
    /// Decoder-only models only.
    pub past_cache: Option<KvCache>,
}

impl GenerateOptions {
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_return_cache(mut self, return_cache: bool) -> Self {
        self.return_cache = return_cache;
        self
    }

    pub fn with_past_cache(mut self, cache: KvCache) -> Self {
        self.past_cache = Some(cache);
        self
    }
}

#[derive(Debug)]
pub struct GenerationResult {
    /// One list per input in batch order, best first.
    pub sequences: Vec<Vec<GeneratedSequence>>,
    pub stop_reason: StopReason,
    /// Decode steps run.
    pub steps: usize,
    pub cache: Option<KvCache>,
}

impl GenerationResult {
    /// The highest-scoring sequence for input `input`.
    pub fn best(&self, input: usize) -> Option<&GeneratedSequence> {
        self.sequences.get(input).and_then(|group| group.first())
    }
}

/// Drives generation for one model.
pub struct Generator {
    backend: Arc<dyn GenerationBackend>,
    adapter: CacheAdapter,
}

impl Generator {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        let adapter = CacheAdapter::for_model(backend.metadata());
        Self { backend, adapter }
    }

    pub fn metadata(&self) -> &ModelMetadata {
        self.backend.metadata()
    }

    pub fn adapter(&self) -> CacheAdapter {
        self.adapter
    }

    /// Builtin defaults, then the stored config, then `overrides`.
    pub fn resolve_config(&self, overrides: Option<&GenerationParams>) -> Result<GenerationConfig> {
        let metadata = self.backend.metadata();
        resolve_generation_config(
            &metadata.builtin_defaults,
            metadata.stored_config.as_ref(),
            overrides,
        )
    }

    pub async fn generate(
        &self,
        inputs: &[Vec<u32>],
        overrides: Option<&GenerationParams>,
    ) -> Result<GenerationResult> {
        self.generate_with_options(inputs, overrides, GenerateOptions::default())
            .await
    }

    pub async fn generate_with_options(
        &self,
        inputs: &[Vec<u32>],
        overrides: Option<&GenerationParams>,
        options: GenerateOptions,
    ) -> Result<GenerationResult> {
        let t_start = Instant::now();
        let config = self.resolve_config(overrides)?;
        self.validate_inputs(inputs)?;

        let GenerateOptions {
            cancellation,
            return_cache,
            past_cache,
        } = options;

        // length conflicts are config errors and must surface before the engine runs
        let decoder_prompt_len = match self.adapter.architecture() {
            ModelArchitecture::DecoderOnly => inputs.iter().map(Vec::len).max().unwrap_or(0),
            ModelArchitecture::EncoderDecoder => 1,
        };
        config.length_bounds(decoder_prompt_len)?;

        let search_inputs = match self.adapter.architecture() {
            ModelArchitecture::DecoderOnly => {
                self.prepare_decoder_only(inputs, &config, past_cache)?
            }
            ModelArchitecture::EncoderDecoder => {
                if past_cache.is_some() {
                    return Err(GenerationError::invalid_input(
                        "cache continuation is only supported for decoder-only models",
                    ));
                }
                self.prepare_encoder_decoder(inputs, &config).await?
            }
        };

        log::debug!(
            "[Generate] {} input(s), strategy {:?}, group size {}",
            inputs.len(),
            config.strategy(),
            config.group_size()
        );

        let machine = SearchMachine::new(
            self.backend.as_ref(),
            self.adapter,
            &config,
            search_inputs,
            cancellation,
        )?;
        let outcome = machine.run().await?;

        let elapsed = t_start.elapsed();
        let num_tokens = outcome.steps * inputs.len();
        if num_tokens > 0 && elapsed.as_secs_f32() > 0.0 {
            log::info!(
                "[Generate] {} steps for {} input(s) in {:?}. Speed: {:.2} t/s ({:?})",
                outcome.steps,
                inputs.len(),
                elapsed,
                num_tokens as f32 / elapsed.as_secs_f32(),
                outcome.stop_reason
            );
        } else {
            log::info!(
                "[Generate] Total Generation Time: {:?} ({:?})",
                elapsed,
                outcome.stop_reason
            );
        }

        Ok(GenerationResult {
            sequences: outcome.groups,
            stop_reason: outcome.stop_reason,
            steps: outcome.steps,
            cache: return_cache.then_some(outcome.cache),
        })
    }

    fn validate_inputs(&self, inputs: &[Vec<u32>]) -> Result<()> {
        if inputs.is_empty() {
            return Err(GenerationError::invalid_input("empty input batch"));
        }
        let vocab_size = self.backend.metadata().vocab_size;
        for (i, row) in inputs.iter().enumerate() {
            if row.is_empty() {
                return Err(GenerationError::invalid_input(format!("input {} is empty", i)));
            }
            if let Some(&token) = row.iter().find(|&&t| t as usize >= vocab_size) {
                return Err(GenerationError::invalid_input(format!(
                    "input {} has token id {} outside the vocabulary of {}",
                    i, token, vocab_size
                )));
            }
        }
        Ok(())
    }

    /// Left-pads the prompts and builds (or adopts) the cache.
    fn prepare_decoder_only(
        &self,
        inputs: &[Vec<u32>],
        config: &GenerationConfig,
        past_cache: Option<KvCache>,
    ) -> Result<SearchInputs> {
        let group_size = config.group_size();
        let num_seqs = inputs.len() * group_size;
        let max_len = inputs.iter().map(Vec::len).max().unwrap_or(0);

        let mut prompts = Vec::with_capacity(inputs.len());
        let mut pad_lens = Vec::with_capacity(inputs.len());
        for row in inputs {
            let pad_len = max_len - row.len();
            let mut prompt = vec![config.pad_token_id; pad_len];
            prompt.extend_from_slice(row);
            prompts.push(prompt);
            pad_lens.push(pad_len);
        }

        let (cache, past_len) = match past_cache {
            Some(mut cache) => {
                if pad_lens.iter().any(|&p| p > 0) {
                    return Err(GenerationError::invalid_input(
                        "cache continuation needs inputs of equal length",
                    ));
                }
                if cache.num_beams() != num_seqs {
                    return Err(GenerationError::cache(format!(
                        "past cache has {} beams, this call needs {}",
                        cache.num_beams(),
                        num_seqs
                    )));
                }
                cache.set_group_size(group_size)?;
                let past_len = cache.seq_len(AttentionKind::SelfAttention);
                log::debug!("[Generate] Reusing cache covering {} positions", past_len);
                (cache, past_len)
            }
            None => (self.adapter.init(num_seqs, group_size, None)?, 0),
        };

        Ok(SearchInputs {
            prompts,
            pad_lens,
            cache,
            past_len,
        })
    }

    /// Runs the encoder once and seeds the decoder with the start token.
    async fn prepare_encoder_decoder(
        &self,
        inputs: &[Vec<u32>],
        config: &GenerationConfig,
    ) -> Result<SearchInputs> {
        let group_size = config.group_size();
        let batch_size = inputs.len();
        let max_len = inputs.iter().map(Vec::len).max().unwrap_or(0);

        let input_ids = Array2::from_shape_fn((batch_size, max_len), |(r, c)| {
            inputs[r].get(c).copied().unwrap_or(config.pad_token_id)
        });
        let attention_mask = Array2::from_shape_fn((batch_size, max_len), |(r, c)| {
            if c < inputs[r].len() {
                1.0f32
            } else {
                0.0
            }
        });

        let t_encode = Instant::now();
        let mut outputs = self
            .backend
            .encode(
                NamedTensors::new()
                    .with(tensor::INPUT_IDS, input_ids)
                    .with(tensor::ATTENTION_MASK, attention_mask.clone()),
            )
            .await
            .map_err(GenerationError::ForwardStep)?;
        let hidden_states = outputs.take_f32::<Ix3>(tensor::LAST_HIDDEN_STATE)?;
        if hidden_states.shape()[0] != batch_size || hidden_states.shape()[1] != max_len {
            return Err(GenerationError::malformed(format!(
                "encoder output shape {:?}, expected [{}, {}, _]",
                hidden_states.shape(),
                batch_size,
                max_len
            )));
        }
        log::debug!("[Generate] Encoder pass: {:?}", t_encode.elapsed());

        // one copy per beam, input-major
        let expand: Vec<usize> = (0..batch_size)
            .flat_map(|i| std::iter::repeat(i).take(group_size))
            .collect();
        let encoder = EncoderState::new(
            hidden_states.select(Axis(0), &expand),
            attention_mask.select(Axis(0), &expand),
        );
        let cache = self
            .adapter
            .init(batch_size * group_size, group_size, Some(encoder))?;

        Ok(SearchInputs {
            prompts: vec![vec![config.decoder_start_token_id]; batch_size],
            pad_lens: vec![0; batch_size],
            cache,
            past_len: 0,
        })
    }
}
