//! Key-value cache for autoregressive decoding.
//!
//! The cache maps `(layer, attention kind)` to a key tensor and a value tensor
//! whose leading dimension indexes live beams:
//!
//! ```text
//! keys / values: [num_beams, num_heads, seq_len, head_dim]
//!                 │          │          │        │
//!                 │          │          │        └─ per-head size
//!                 │          │          └─ grows by the number of new tokens each step
//!                 │          └─ key/value heads
//!                 └─ beam dimension; reindexed on every reorder
//! ```
//!
//! Beams of one input occupy contiguous slots: input `i` owns slots
//! `i * group_size .. (i + 1) * group_size`. A reorder may shuffle beams
//! within a group but never across groups.
//!
//! Tensors are reference counted, so handing the cache to a forward step does
//! not copy it. Extending still reallocates each entry along the sequence
//! axis, which costs O(cached length) per step.
//!
//! Reorder commutes with extend: reordering the cache then extending it with
//! fragments for the new beam order gives the same tensors as extending with
//! fragments in the old order and then reordering.

mod adapter;


use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use ndarray::{concatenate, ArcArray, Array2, Array3, Array4, Axis, Ix2, Ix3, Ix4};
use rayon::prelude::*;

use crate::error::{GenerationError, Result};

pub use adapter::{CacheAdapter, CacheLayout};

/// Which attention block a cache entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttentionKind {
    /// Decoder self-attention; grows every step.
    SelfAttention,
    /// Decoder-to-encoder attention; fixed after the first step.
    CrossAttention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub layer: usize,
    pub kind: AttentionKind,
}

impl CacheKey {
    pub fn new(layer: usize, kind: AttentionKind) -> Self {
        Self { layer, kind }
    }
}

/// Key and value tensors for one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct KvPair {
    pub keys: ArcArray<f32, Ix4>,
    pub values: ArcArray<f32, Ix4>,
}

impl KvPair {
    pub fn num_beams(&self) -> usize {
        self.keys.shape()[0]
    }

    pub fn num_heads(&self) -> usize {
        self.keys.shape()[1]
    }

    pub fn seq_len(&self) -> usize {
        self.keys.shape()[2]
    }

    pub fn head_dim(&self) -> usize {
        self.keys.shape()[3]
    }
}

/// Encoder output, expanded to the beam dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderState {
    /// `[num_beams, src_len, hidden]`
    pub hidden_states: ArcArray<f32, Ix3>,
    /// `[num_beams, src_len]`
    pub attention_mask: ArcArray<f32, Ix2>,
}

impl EncoderState {
    pub fn new(hidden_states: Array3<f32>, attention_mask: Array2<f32>) -> Self {
        Self {
            hidden_states: hidden_states.into_shared(),
            attention_mask: attention_mask.into_shared(),
        }
    }

    pub fn num_beams(&self) -> usize {
        self.hidden_states.shape()[0]
    }
}

/// The key-value cache of one generation call.
#[derive(Debug, Clone)]
pub struct KvCache {
    entries: BTreeMap<CacheKey, KvPair>,
    num_beams: usize,
    group_size: usize,
    encoder: Option<EncoderState>,
}

impl KvCache {
    /// An empty cache for `num_beams` slots split into groups of `group_size`.
    pub fn new(num_beams: usize, group_size: usize) -> Result<Self> {
        check_grouping(num_beams, group_size)?;
        Ok(Self {
            entries: BTreeMap::new(),
            num_beams,
            group_size,
            encoder: None,
        })
    }

    pub fn num_beams(&self) -> usize {
        self.num_beams
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Re-splits the beam dimension, e.g. when a returned cache is reused with
    /// a different strategy.
    pub fn set_group_size(&mut self, group_size: usize) -> Result<()> {
        check_grouping(self.num_beams, group_size)?;
        self.group_size = group_size;
        Ok(())
    }

    pub fn get(&self, layer: usize, kind: AttentionKind) -> Option<&KvPair> {
        self.entries.get(&CacheKey::new(layer, kind))
    }

    pub fn contains(&self, layer: usize, kind: AttentionKind) -> bool {
        self.entries.contains_key(&CacheKey::new(layer, kind))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &KvPair)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached sequence length for `kind`, or 0 when nothing is cached yet.
    pub fn seq_len(&self, kind: AttentionKind) -> usize {
        self.entries
            .iter()
            .find(|(key, _)| key.kind == kind)
            .map_or(0, |(_, pair)| pair.seq_len())
    }

    pub fn encoder_state(&self) -> Option<&EncoderState> {
        self.encoder.as_ref()
    }

    pub fn set_encoder_state(&mut self, state: EncoderState) -> Result<()> {
        if state.num_beams() != self.num_beams || state.attention_mask.nrows() != self.num_beams {
            return Err(GenerationError::cache(format!(
                "encoder state has {} rows, cache has {} beams",
                state.num_beams(),
                self.num_beams
            )));
        }
        self.encoder = Some(state);
        Ok(())
    }

    /// Appends `keys` / `values` along the sequence axis of an entry,
    /// creating it if absent.
    pub fn extend(
        &mut self,
        layer: usize,
        kind: AttentionKind,
        keys: Array4<f32>,
        values: Array4<f32>,
    ) -> Result<()> {
        if keys.shape() != values.shape() {
            return Err(GenerationError::cache(format!(
                "layer {} {:?}: key shape {:?} != value shape {:?}",
                layer,
                kind,
                keys.shape(),
                values.shape()
            )));
        }
        if keys.shape()[0] != self.num_beams {
            return Err(GenerationError::cache(format!(
                "layer {} {:?}: fragment has {} beams, cache has {}",
                layer,
                kind,
                keys.shape()[0],
                self.num_beams
            )));
        }

        let pair = match self.entries.entry(CacheKey::new(layer, kind)) {
            Entry::Vacant(slot) => {
                slot.insert(KvPair {
                    keys: keys.into_shared(),
                    values: values.into_shared(),
                });
                return Ok(());
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        if pair.num_heads() != keys.shape()[1] || pair.head_dim() != keys.shape()[3] {
            return Err(GenerationError::cache(format!(
                "layer {} {:?}: fragment heads x head_dim {}x{} != cached {}x{}",
                layer,
                kind,
                keys.shape()[1],
                keys.shape()[3],
                pair.num_heads(),
                pair.head_dim()
            )));
        }

        pair.keys = concatenate(Axis(2), &[pair.keys.view(), keys.view()])
            .map_err(|e| GenerationError::cache(e.to_string()))?
            .into_shared();
        pair.values = concatenate(Axis(2), &[pair.values.view(), values.view()])
            .map_err(|e| GenerationError::cache(e.to_string()))?
            .into_shared();
        Ok(())
    }

    /// Reindexes the beam dimension: new slot `i` takes old slot `permutation[i]`.
    ///
    /// Parallelized across entries using Rayon.
    pub fn reorder(&mut self, permutation: &[usize]) -> Result<()> {
        if permutation.len() != self.num_beams {
            return Err(GenerationError::cache(format!(
                "permutation length {} != {} beams",
                permutation.len(),
                self.num_beams
            )));
        }
        for (slot, &source) in permutation.iter().enumerate() {
            if source >= self.num_beams {
                return Err(GenerationError::cache(format!(
                    "permutation index {} out of range for {} beams",
                    source, self.num_beams
                )));
            }
            if source / self.group_size != slot / self.group_size {
                return Err(GenerationError::cache(format!(
                    "permutation moves beam {} into slot {} of another input group",
                    source, slot
                )));
            }
        }
        if permutation.iter().enumerate().all(|(slot, &source)| slot == source) {
            return Ok(());
        }

        self.entries.par_iter_mut().for_each(|(_, pair)| {
            pair.keys = pair.keys.select(Axis(0), permutation).into_shared();
            pair.values = pair.values.select(Axis(0), permutation).into_shared();
        });
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.hidden_states = encoder.hidden_states.select(Axis(0), permutation).into_shared();
            encoder.attention_mask = encoder.attention_mask.select(Axis(0), permutation).into_shared();
        }
        Ok(())
    }
}

fn check_grouping(num_beams: usize, group_size: usize) -> Result<()> {
    if group_size == 0 || num_beams % group_size != 0 {
        return Err(GenerationError::cache(format!(
            "{} beams cannot be split into groups of {}",
            num_beams, group_size
        )));
    }
    Ok(())
}
