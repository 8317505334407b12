//! Fixed-delay retry policies for engine and network calls.
//!
//! Every call that talks to the container engine or the network runs through
//! [`execute_with_policy`], which takes the attempt budget, the delay and a
//! retryability predicate as plain values. Non-retryable errors propagate on
//! first occurrence; on exhaustion the last error is returned unchanged.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Attempt budget and delay for one class of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Fixed delay between attempts (milliseconds).
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
        }
    }

    /// Engine API calls (create/stop/remove/restart).
    pub const fn engine() -> Self {
        Self::new(5, 5_000)
    }

    /// Stop/remove during teardown.
    pub const fn teardown() -> Self {
        Self::new(3, 5_000)
    }

    /// Readiness polling.
    pub const fn readiness() -> Self {
        Self::new(20, 5_000)
    }

    /// A whole launch attempt (port reservation + create) under the hard timeout.
    pub const fn launch() -> Self {
        Self::new(4, 5_000)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// A policy that never sleeps, keeping the attempt budget.
    pub fn without_delay(self) -> Self {
        Self {
            delay_ms: 0,
            ..self
        }
    }
}

/// Outcome details of a policy execution that ended in failure.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Attempts actually made.
    pub attempts: u32,
    /// The error from the final attempt.
    pub error: E,
}

/// Run `operation` under `policy`, retrying errors for which `is_retryable`
/// returns true.
///
/// A budget of zero attempts is treated as one.
pub async fn execute_with_policy<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    op_name: &str,
    is_retryable: P,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    execute_counting(policy, op_name, is_retryable, operation)
        .await
        .map_err(|exhausted| exhausted.error)
}

/// Like [`execute_with_policy`] but also reports how many attempts were made.
pub async fn execute_counting<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    op_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(op = op_name, attempts = attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !is_retryable(&e) => {
                tracing::debug!(op = op_name, attempt, error = %e, "Non-retryable failure");
                return Err(Exhausted {
                    attempts: attempt,
                    error: e,
                });
            }
            Err(e) if attempt >= max_attempts => {
                tracing::warn!(
                    op = op_name,
                    attempts = attempt,
                    last_error = %e,
                    "Retries exhausted"
                );
                return Err(Exhausted {
                    attempts: attempt,
                    error: e,
                });
            }
            Err(e) => {
                tracing::debug!(
                    op = op_name,
                    attempt,
                    max_attempts,
                    error = %e,
                    "Attempt failed, will retry"
                );
                tokio::time::sleep(policy.delay()).await;
                attempt += 1;
            }
        }
    }
}
