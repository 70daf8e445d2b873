//! Bounded retries for backend calls.
//!
//! Only transient failures are retried. Permanent ones (missing object,
//! permission denied) return on the first attempt.

use crate::services::object_storage::BackendResult;
use std::{future::Future, time::Duration};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first. Always at least one.
    pub max_attempts: u32,
    /// Delay before the second attempt, growing linearly after that.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// Returns the final result and how many retries were spent.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> (BackendResult<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return (Ok(value), retries),
                Err(err) if err.is_transient() && retries + 1 < self.max_attempts => {
                    retries += 1;
                    warn!(operation, attempt = retries, error = %err, "transient backend error, retrying");
                    tokio::time::sleep(self.backoff * retries).await;
                }
                Err(err) => return (Err(err), retries),
            }
        }
    }
}
