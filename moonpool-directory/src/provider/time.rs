//! Time provider abstraction.
//!
//! The directory never reads the wall clock directly: retry delays, the
//! lazy deregistration grace period and cache expiry all go through a
//! [`TimeProvider`], so tests can drive time deterministically.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during time operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The time provider has been shut down and is no longer accessible.
    #[error("time provider shut down")]
    Shutdown,
}

/// Provider trait for time operations.
///
/// `now()` is the elapsed time since the provider was created. All
/// timestamps stored by the directory (activation creation time, cache
/// refresh time) are values returned by `now()`.
#[async_trait(?Send)]
pub trait TimeProvider: Clone {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration) -> Result<(), TimeError>;

    /// Get the current time, as elapsed time since provider creation.
    fn now(&self) -> Duration;
}

/// Real time provider using Tokio's time facilities.
///
/// Reads tokio's clock rather than `std::time::Instant`, so a runtime with
/// paused time (`#[tokio::test(start_paused = true)]`) controls it too.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: tokio::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) -> Result<(), TimeError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }
}
