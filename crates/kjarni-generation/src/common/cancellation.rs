//! Cooperative cancellation of a generation call.
//!
//! The search loop reads the token once per step, after that step's cache and
//! sequence updates, and then ends with `StopReason::Cancelled`. The partial
//! result is returned like any other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

/// The read side, passed in `GenerateOptions`.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    /// `None` when no handle exists, so the token can never fire.
    flag: Option<Arc<AtomicBool>>,
}

impl CancellationToken {
    /// A token and the handle that fires it.
    ///
    /// ```ignore
    /// let (token, handle) = CancellationToken::new();
    /// let options = GenerateOptions::default().with_cancellation(token);
    /// handle.cancel_after(Duration::from_secs(2));
    /// let result = generator.generate_with_options(&inputs, None, options).await?;
    /// ```
    pub fn new() -> (Self, CancellationHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let token = Self {
            flag: Some(flag.clone()),
        };
        (token, CancellationHandle { flag })
    }

    pub fn never() -> Self {
        Self { flag: None }
    }

    /// Stops generation after its first step.
    pub fn already_cancelled() -> Self {
        Self {
            flag: Some(Arc::new(AtomicBool::new(true))),
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

/// The write side of a [`CancellationToken`]; clones fire the same token.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    flag: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Fires once `timeout` has elapsed. Needs a running tokio runtime.
    pub fn cancel_after(self, timeout: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            self.cancel();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_token_stays_live() {
        assert!(!CancellationToken::never().is_cancelled());
        assert!(!CancellationToken::default().is_cancelled());
        assert!(CancellationToken::already_cancelled().is_cancelled());
    }

    #[test]
    fn test_handle_fires_every_clone() {
        let (token, handle) = CancellationToken::new();
        let copy = token.clone();
        assert!(!token.is_cancelled());

        handle.clone().cancel();
        assert!(token.is_cancelled());
        assert!(copy.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_after_fires_later() {
        let (token, handle) = CancellationToken::new();
        let timer = handle.cancel_after(Duration::from_millis(10));
        assert!(!token.is_cancelled());

        timer.await.unwrap();
        assert!(token.is_cancelled());
    }
}
