//! Error types for the decoding engine.

use thiserror::Error;

/// Errors that can occur during a generation call.
///
/// None of these are retried internally. Configuration and input errors are
/// raised before the first forward step; cache errors abort the call because
/// continuing would silently corrupt the output.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Unresolvable or contradictory generation parameters.
    #[error("Invalid generation config: {0}")]
    Config(String),

    /// Empty or malformed input batch.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Beam dimension mismatch between the cache and the live beams.
    #[error("KV cache consistency violated: {0}")]
    CacheConsistency(String),

    /// The external engine failed or returned malformed output.
    #[error("Forward step failed: {0}")]
    ForwardStep(#[source] anyhow::Error),
}

impl GenerationError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub(crate) fn cache(msg: impl Into<String>) -> Self {
        Self::CacheConsistency(msg.into())
    }

    /// Output from the engine that does not satisfy the named-tensor contract.
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::ForwardStep(anyhow::anyhow!(msg.into()))
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }

    pub fn is_cache_consistency(&self) -> bool {
        matches!(self, Self::CacheConsistency(_))
    }

    pub fn is_forward_step(&self) -> bool {
        matches!(self, Self::ForwardStep(_))
    }
}

/// Result type for generation operations.
pub type Result<T> = std::result::Result<T, GenerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = GenerationError::config("num_beams must be > 0");
        assert_eq!(
            err.to_string(),
            "Invalid generation config: num_beams must be > 0"
        );

        let err = GenerationError::cache("permutation length 3 != 4 beams");
        assert!(err.to_string().contains("permutation length 3"));
    }

    #[test]
    fn test_forward_step_keeps_source() {
        use std::error::Error;

        let err = GenerationError::ForwardStep(anyhow::anyhow!("device lost"));
        assert!(err.is_forward_step());
        assert_eq!(err.source().map(|s| s.to_string()), Some("device lost".into()));
    }

    #[test]
    fn test_kind_predicates() {
        assert!(GenerationError::invalid_input("empty batch").is_invalid_input());
        assert!(GenerationError::cache("x").is_cache_consistency());
        assert!(GenerationError::malformed("missing logits").is_forward_step());
        assert!(!GenerationError::config("x").is_forward_step());
    }
}
