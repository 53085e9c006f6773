//! Named tensors exchanged with the external execution engine.
//!
//! The engine is opaque: the decoding loop only knows the names and shapes of
//! the tensors it sends and receives. Naming follows the "decoder with past"
//! export convention:
//!
//! | Direction | Name | Shape |
//! |-----------|------|-------|
//! | in  | `input_ids` | `[n, s]` u32 |
//! | in  | `attention_mask` | `[n, past + s]` f32 |
//! | in  | `position_ids` | `[n, s]` u32 (decoder-only) |
//! | in  | `encoder_hidden_states` | `[n, src, hidden]` f32 |
//! | in  | `encoder_attention_mask` | `[n, src]` f32 |
//! | in  | `past_key_values.{layer}.{decoder,encoder}.{key,value}` | `[n, heads, past, head_dim]` |
//! | out | `logits` | `[n, s, vocab]` f32 |
//! | out | `present.{layer}.{decoder,encoder}.{key,value}` | `[n, heads, s, head_dim]` |
//! | out | `last_hidden_state` (encoder) | `[n, src, hidden]` f32 |

use std::collections::HashMap;

use ndarray::{Array, ArrayD, ArcArray, Dimension, IxDyn};

use crate::cache::AttentionKind;
use crate::error::{GenerationError, Result};

pub const INPUT_IDS: &str = "input_ids";
pub const ATTENTION_MASK: &str = "attention_mask";
pub const POSITION_IDS: &str = "position_ids";
pub const ENCODER_HIDDEN_STATES: &str = "encoder_hidden_states";
pub const ENCODER_ATTENTION_MASK: &str = "encoder_attention_mask";
pub const LAST_HIDDEN_STATE: &str = "last_hidden_state";
pub const LOGITS: &str = "logits";

fn group_name(kind: AttentionKind) -> &'static str {
    match kind {
        AttentionKind::SelfAttention => "decoder",
        AttentionKind::CrossAttention => "encoder",
    }
}

/// `past_key_values.{layer}.{group}.key`
pub fn past_key_name(layer: usize, kind: AttentionKind) -> String {
    format!("past_key_values.{}.{}.key", layer, group_name(kind))
}

/// `past_key_values.{layer}.{group}.value`
pub fn past_value_name(layer: usize, kind: AttentionKind) -> String {
    format!("past_key_values.{}.{}.value", layer, group_name(kind))
}

/// `present.{layer}.{group}.key`
pub fn present_key_name(layer: usize, kind: AttentionKind) -> String {
    format!("present.{}.{}.key", layer, group_name(kind))
}

/// `present.{layer}.{group}.value`
pub fn present_value_name(layer: usize, kind: AttentionKind) -> String {
    format!("present.{}.{}.value", layer, group_name(kind))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    U32,
}

/// A dynamically shaped tensor held on the host.
///
/// f32 data is reference counted: cache tensors handed to the engine every
/// step are shared with the cache, not copied.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    F32(ArcArray<f32, IxDyn>),
    U32(ArrayD<u32>),
}

impl Tensor {
    pub fn dtype(&self) -> DType {
        match self {
            Tensor::F32(_) => DType::F32,
            Tensor::U32(_) => DType::U32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::F32(a) => a.shape(),
            Tensor::U32(a) => a.shape(),
        }
    }

    pub fn as_f32(&self) -> Option<&ArcArray<f32, IxDyn>> {
        match self {
            Tensor::F32(a) => Some(a),
            Tensor::U32(_) => None,
        }
    }

    pub fn as_u32(&self) -> Option<&ArrayD<u32>> {
        match self {
            Tensor::U32(a) => Some(a),
            Tensor::F32(_) => None,
        }
    }
}

impl<D: Dimension> From<Array<f32, D>> for Tensor {
    fn from(array: Array<f32, D>) -> Self {
        Tensor::F32(array.into_dyn().into_shared())
    }
}

impl<D: Dimension> From<ArcArray<f32, D>> for Tensor {
    fn from(array: ArcArray<f32, D>) -> Self {
        Tensor::F32(array.into_dyn())
    }
}

impl<D: Dimension> From<Array<u32, D>> for Tensor {
    fn from(array: Array<u32, D>) -> Self {
        Tensor::U32(array.into_dyn())
    }
}

/// A set of tensors keyed by name; the unit of exchange with the engine.
#[derive(Debug, Clone, Default)]
pub struct NamedTensors {
    tensors: HashMap<String, Tensor>,
}

impl NamedTensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: impl Into<Tensor>) {
        self.tensors.insert(name.into(), tensor.into());
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, tensor: impl Into<Tensor>) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.tensors.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensor names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }

    /// Removes an f32 tensor and converts it to a fixed rank. The data is
    /// copied only when another handle still shares it.
    ///
    /// Fails with [`GenerationError::ForwardStep`] when the tensor is missing,
    /// has the wrong dtype, or the wrong rank: output from the engine that
    /// breaks the contract is treated as an engine failure.
    pub fn take_f32<D: Dimension>(&mut self, name: &str) -> Result<Array<f32, D>> {
        match self.tensors.remove(name) {
            Some(Tensor::F32(array)) => {
                let ndim = array.ndim();
                array.into_owned().into_dimensionality::<D>().map_err(|_| {
                    GenerationError::malformed(format!(
                        "tensor '{}' has rank {}, expected {}",
                        name,
                        ndim,
                        D::NDIM.map_or_else(|| "dynamic".to_string(), |n| n.to_string())
                    ))
                })
            }
            Some(Tensor::U32(_)) => Err(GenerationError::malformed(format!(
                "tensor '{}' has dtype u32, expected f32",
                name
            ))),
            None => Err(GenerationError::malformed(format!(
                "missing output tensor '{}'",
                name
            ))),
        }
    }
}

impl FromIterator<(String, Tensor)> for NamedTensors {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3, Ix2, Ix3};

    #[test]
    fn test_cache_tensor_names() {
        assert_eq!(
            past_key_name(3, AttentionKind::SelfAttention),
            "past_key_values.3.decoder.key"
        );
        assert_eq!(
            past_value_name(0, AttentionKind::CrossAttention),
            "past_key_values.0.encoder.value"
        );
        assert_eq!(
            present_key_name(11, AttentionKind::CrossAttention),
            "present.11.encoder.key"
        );
        assert_eq!(
            present_value_name(1, AttentionKind::SelfAttention),
            "present.1.decoder.value"
        );
    }

    #[test]
    fn test_take_f32_with_rank() {
        let mut tensors = NamedTensors::new().with(LOGITS, Array3::<f32>::zeros((2, 1, 8)));
        let logits = tensors.take_f32::<Ix3>(LOGITS).unwrap();
        assert_eq!(logits.dim(), (2, 1, 8));
        assert!(tensors.is_empty());
    }

    #[test]
    fn test_take_f32_wrong_rank_is_forward_error() {
        let mut tensors = NamedTensors::new().with(LOGITS, Array3::<f32>::zeros((2, 1, 8)));
        let err = tensors.take_f32::<Ix2>(LOGITS).unwrap_err();
        assert!(err.is_forward_step());
        assert!(err.to_string().contains("rank 3"));
    }

    #[test]
    fn test_take_f32_missing_or_wrong_dtype() {
        let mut tensors = NamedTensors::new().with(INPUT_IDS, Array2::<u32>::zeros((1, 1)));
        assert!(tensors.take_f32::<Ix2>(LOGITS).unwrap_err().is_forward_step());
        assert!(tensors.take_f32::<Ix2>(INPUT_IDS).unwrap_err().is_forward_step());
    }

    #[test]
    fn test_shared_f32_is_not_copied() {
        let shared = Array3::<f32>::ones((2, 3, 4)).into_shared();
        let tensors = NamedTensors::new().with(LOGITS, shared.clone());
        let held = tensors.get(LOGITS).unwrap().as_f32().unwrap();
        assert_eq!(held.as_ptr(), shared.as_ptr());
    }

    #[test]
    fn test_names_sorted() {
        let tensors = NamedTensors::new()
            .with(INPUT_IDS, Array2::<u32>::zeros((1, 1)))
            .with(ATTENTION_MASK, Array2::<f32>::ones((1, 1)));
        assert_eq!(tensors.names(), vec![ATTENTION_MASK, INPUT_IDS]);
        assert_eq!(tensors.get(INPUT_IDS).unwrap().dtype(), DType::U32);
        assert_eq!(tensors.get(ATTENTION_MASK).unwrap().shape(), &[1, 1]);
    }
}
