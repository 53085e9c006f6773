//! Shared building blocks for the decoding loop.

pub mod callback;
pub mod cancellation;
pub mod math;

pub use callback::{StepCallback, StepCallbackRef, StepControl, StepEvent, StepToken};
pub use cancellation::{CancellationHandle, CancellationToken};
