//! Per-step progress callback.

use std::fmt;
use std::sync::Arc;

/// A token chosen for one live sequence during a decode step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepToken {
    /// Index of the originating input in the batch.
    pub input_id: usize,
    /// Slot of the sequence in the beam dimension.
    pub slot: usize,
    pub token_id: u32,
}

/// What the decode loop reports after each step.
#[derive(Debug, Clone, Copy)]
pub struct StepEvent<'a> {
    /// Zero-based decode step.
    pub step: usize,
    /// Current (padded) sequence length after this step.
    pub cur_len: usize,
    pub tokens: &'a [StepToken],
}

/// Returned from a callback to continue or end generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepControl {
    #[default]
    Continue,
    Stop,
}

/// Invoked synchronously once per decode step, from the decode loop itself.
pub trait StepCallback: Send + Sync {
    fn on_step(&self, event: &StepEvent<'_>) -> StepControl;
}

impl<F> StepCallback for F
where
    F: Fn(&StepEvent<'_>) -> StepControl + Send + Sync,
{
    fn on_step(&self, event: &StepEvent<'_>) -> StepControl {
        self(event)
    }
}

/// Shared handle to a callback, so configs stay cheap to clone.
#[derive(Clone)]
pub struct StepCallbackRef(Arc<dyn StepCallback>);

impl StepCallbackRef {
    pub fn new(callback: impl StepCallback + 'static) -> Self {
        Self(Arc::new(callback))
    }

    pub fn on_step(&self, event: &StepEvent<'_>) -> StepControl {
        self.0.on_step(event)
    }
}

impl From<Arc<dyn StepCallback>> for StepCallbackRef {
    fn from(callback: Arc<dyn StepCallback>) -> Self {
        Self(callback)
    }
}

impl fmt::Debug for StepCallbackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StepCallbackRef(..)")
    }
}
