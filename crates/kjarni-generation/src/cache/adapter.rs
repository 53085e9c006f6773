//! Architecture-specific cache strategy behind one interface.

use ndarray::{Array4, Ix4};

use super::{AttentionKind, EncoderState, KvCache};
use crate::error::{GenerationError, Result};
use crate::model::{ModelArchitecture, ModelMetadata};
use crate::tensor::{
    self, past_key_name, past_value_name, present_key_name, present_value_name, NamedTensors,
};

/// Per-layer cache geometry of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
}

impl From<&ModelMetadata> for CacheLayout {
    fn from(metadata: &ModelMetadata) -> Self {
        Self {
            num_layers: metadata.num_layers,
            num_heads: metadata.num_heads,
            head_dim: metadata.head_dim,
        }
    }
}

/// Creates, extends, reorders and slices the cache for one model family.
///
/// - `DecoderOnly`: one self-attention entry per layer, grown every step.
/// - `EncoderDecoder`: self-attention entries grown every step, plus
///   cross-attention entries populated from the first step's outputs and
///   carried unchanged (except for beam reindexing) afterwards. The encoder
///   output lives in the cache and is fed to every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAdapter {
    DecoderOnly(CacheLayout),
    EncoderDecoder(CacheLayout),
}

impl CacheAdapter {
    pub fn for_model(metadata: &ModelMetadata) -> Self {
        let layout = CacheLayout::from(metadata);
        match metadata.architecture {
            ModelArchitecture::DecoderOnly => CacheAdapter::DecoderOnly(layout),
            ModelArchitecture::EncoderDecoder => CacheAdapter::EncoderDecoder(layout),
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        match self {
            CacheAdapter::DecoderOnly(layout) | CacheAdapter::EncoderDecoder(layout) => layout,
        }
    }

    pub fn architecture(&self) -> ModelArchitecture {
        match self {
            CacheAdapter::DecoderOnly(_) => ModelArchitecture::DecoderOnly,
            CacheAdapter::EncoderDecoder(_) => ModelArchitecture::EncoderDecoder,
        }
    }

    /// An empty cache. Encoder-decoder caches require the (beam-expanded)
    /// encoder output; decoder-only caches refuse one.
    pub fn init(
        &self,
        num_beams: usize,
        group_size: usize,
        encoder: Option<EncoderState>,
    ) -> Result<KvCache> {
        let mut cache = KvCache::new(num_beams, group_size)?;
        match (self, encoder) {
            (CacheAdapter::EncoderDecoder(_), Some(state)) => cache.set_encoder_state(state)?,
            (CacheAdapter::EncoderDecoder(_), None) => {
                return Err(GenerationError::cache(
                    "encoder-decoder cache needs the encoder output",
                ))
            }
            (CacheAdapter::DecoderOnly(_), Some(_)) => {
                return Err(GenerationError::cache(
                    "decoder-only cache cannot hold an encoder output",
                ))
            }
            (CacheAdapter::DecoderOnly(_), None) => {}
        }
        Ok(cache)
    }

    /// Moves this step's `present.*` fragments out of `outputs` into the cache.
    ///
    /// Self-attention fragments must cover exactly `new_tokens` positions.
    /// Cross-attention fragments are taken on the first step only.
    pub fn extend(
        &self,
        cache: &mut KvCache,
        outputs: &mut NamedTensors,
        new_tokens: usize,
    ) -> Result<()> {
        let layout = *self.layout();
        for layer in 0..layout.num_layers {
            let (keys, values) = take_fragment(outputs, layer, AttentionKind::SelfAttention)?;
            check_layout(&layout, layer, AttentionKind::SelfAttention, &keys)?;
            if keys.shape()[2] != new_tokens {
                return Err(GenerationError::cache(format!(
                    "layer {} self-attention fragment covers {} positions, expected {}",
                    layer,
                    keys.shape()[2],
                    new_tokens
                )));
            }
            cache.extend(layer, AttentionKind::SelfAttention, keys, values)?;

            if let CacheAdapter::EncoderDecoder(_) = self {
                let kind = AttentionKind::CrossAttention;
                if cache.contains(layer, kind) {
                    outputs.remove(&present_key_name(layer, kind));
                    outputs.remove(&present_value_name(layer, kind));
                } else {
                    let (keys, values) = take_fragment(outputs, layer, kind)?;
                    check_layout(&layout, layer, kind, &keys)?;
                    cache.extend(layer, kind, keys, values)?;
                }
            }
        }
        Ok(())
    }

    pub fn reorder(&self, cache: &mut KvCache, permutation: &[usize]) -> Result<()> {
        cache.reorder(permutation)
    }

    /// The cache-derived inputs of the next forward step.
    ///
    /// Self-attention entries that do not exist yet are sent with zero length
    /// so the engine always sees a complete set of `past_key_values.*.decoder.*`.
    pub fn slice_for_step(&self, cache: &KvCache) -> NamedTensors {
        let layout = self.layout();
        let mut inputs = NamedTensors::new();

        for layer in 0..layout.num_layers {
            let kind = AttentionKind::SelfAttention;
            match cache.get(layer, kind) {
                Some(pair) => {
                    inputs.insert(past_key_name(layer, kind), pair.keys.clone());
                    inputs.insert(past_value_name(layer, kind), pair.values.clone());
                }
                None => {
                    let empty = Array4::<f32>::zeros((
                        cache.num_beams(),
                        layout.num_heads,
                        0,
                        layout.head_dim,
                    ));
                    inputs.insert(past_key_name(layer, kind), empty.clone());
                    inputs.insert(past_value_name(layer, kind), empty);
                }
            }

            let kind = AttentionKind::CrossAttention;
            if let Some(pair) = cache.get(layer, kind) {
                inputs.insert(past_key_name(layer, kind), pair.keys.clone());
                inputs.insert(past_value_name(layer, kind), pair.values.clone());
            }
        }

        if let Some(encoder) = cache.encoder_state() {
            inputs.insert(tensor::ENCODER_HIDDEN_STATES, encoder.hidden_states.clone());
            inputs.insert(tensor::ENCODER_ATTENTION_MASK, encoder.attention_mask.clone());
        }
        inputs
    }
}

fn take_fragment(
    outputs: &mut NamedTensors,
    layer: usize,
    kind: AttentionKind,
) -> Result<(Array4<f32>, Array4<f32>)> {
    let keys = outputs.take_f32::<Ix4>(&present_key_name(layer, kind))?;
    let values = outputs.take_f32::<Ix4>(&present_value_name(layer, kind))?;
    Ok((keys, values))
}

fn check_layout(
    layout: &CacheLayout,
    layer: usize,
    kind: AttentionKind,
    keys: &Array4<f32>,
) -> Result<()> {
    let shape = keys.shape();
    if shape[1] != layout.num_heads || shape[3] != layout.head_dim {
        return Err(GenerationError::cache(format!(
            "layer {} {:?}: fragment shape {:?} does not match {} heads x {} head_dim",
            layer, kind, shape, layout.num_heads, layout.head_dim
        )));
    }
    Ok(())
}
