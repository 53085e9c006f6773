//! Autoregressive decoding engine for kjarni models
//!
//! Turns a batch of token-id prompts into generated continuations by calling an
//! external forward step repeatedly. The crate owns everything around the model:
//! generation config resolution, the logits processor pipeline, the key-value
//! cache lifecycle and the greedy / sampling / beam search loop.
//!
//! ```ignore
//! let generator = Generator::new(Arc::new(my_backend));
//! let result = generator
//!     .generate(&[prompt_ids], Some(&GenerationParams::beam_search(4)))
//!     .await?;
//! let best = result.best(0).unwrap();
//! ```

pub mod cache;
pub mod common;
pub mod config;
pub mod error;
pub mod generator;
pub mod logits;
pub mod model;
pub mod search;
pub mod tensor;

pub use cache::{AttentionKind, CacheAdapter, CacheKey, EncoderState, KvCache, KvPair};
pub use common::{
    CancellationHandle, CancellationToken, StepCallback, StepCallbackRef, StepControl, StepEvent,
    StepToken,
};
pub use config::{
    resolve_generation_config, DecodingStrategy, GenerationConfig, GenerationParams, LengthBounds,
};
pub use error::{GenerationError, Result};
pub use generator::{GenerateOptions, GenerationResult, Generator};
pub use logits::{LogitsPipeline, LogitsProcessor};
pub use model::{GenerationBackend, ModelArchitecture, ModelMetadata};
pub use search::{GeneratedSequence, SearchMachine, SearchState, Sequence, StopReason};
pub use tensor::{NamedTensors, Tensor};

pub mod prelude {
    pub use crate::common::{CancellationToken, StepControl, StepEvent};
    pub use crate::config::GenerationParams;
    pub use crate::error::{GenerationError, Result};
    pub use crate::generator::{GenerateOptions, GenerationResult, Generator};
    pub use crate::model::{GenerationBackend, ModelArchitecture, ModelMetadata};
    pub use crate::tensor::NamedTensors;
}

#[cfg(test)]
mod tests;
