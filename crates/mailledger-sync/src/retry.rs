//! Bounded exponential backoff for remote calls.

use std::future::Future;
use std::time::Duration;

use mailledger_remote::Error as RemoteError;
use tracing::warn;

use crate::config::RetryConfig;

/// Retry schedule applied to every remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
    /// Timeout applied to each attempt.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    /// Build a policy from configuration.
    #[must_use]
    pub fn new(config: &RetryConfig, call_timeout: Duration) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            call_timeout,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// An attempt that exceeds `call_timeout` counts as a transient failure.
    ///
    /// # Errors
    ///
    /// Returns the last error seen.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            let result = tokio::time::timeout(self.call_timeout, op())
                .await
                .unwrap_or_else(|_| {
                    Err(RemoteError::Transient(format!(
                        "{label} timed out after {:?}",
                        self.call_timeout
                    )))
                });

            match result {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "{label} failed (attempt {attempt}/{}), retrying in {delay:?}: {e}",
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.max_delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
