// Copyright (c) 2025 - Cowboy AI, Inc.
//! Convergence Poller
//!
//! Providers are eventually consistent: a create call returns before the
//! resource is usable. [`poll_until`] re-runs a readiness check with an
//! exponential backoff until it succeeds, fails fatally, runs out of budget or
//! is cancelled.
//!
//! ```text
//! attempt   delay (min=1s, max=4s)
//! ───────────────────────────────
//!    1          1s
//!    2          2s
//!    3          4s
//!   >3          4s   (capped, never past the timeout)
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PollPolicy;
use crate::errors::{ProvisioningError, ProvisioningResult};

/// Outcome of a failed readiness check
#[derive(Debug)]
pub enum CheckError {
    /// Not ready yet; retry after a delay
    NotReady(String),

    /// Abort the poll with this error
    Fatal(ProvisioningError),
}

impl CheckError {
    pub fn not_ready(reason: impl Into<String>) -> Self {
        CheckError::NotReady(reason.into())
    }
}

impl From<ProvisioningError> for CheckError {
    fn from(err: ProvisioningError) -> Self {
        if err.is_recoverable() {
            CheckError::NotReady(err.to_string())
        } else {
            CheckError::Fatal(err)
        }
    }
}

/// Run `check` until it returns a value.
///
/// Delays start at `policy.min_delay` and double up to `policy.max_delay`.
/// When the remaining budget is shorter than `min_delay` the poll gives up
/// with [`ProvisioningError::Timeout`] rather than retrying early. The token
/// is observed while the check runs and while sleeping.
pub async fn poll_until<T, F, Fut>(
    operation: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> ProvisioningResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CheckError>>,
{
    let started = Instant::now();
    let mut delay = policy.min_delay;
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ProvisioningError::cancelled(operation));
        }

        attempts += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProvisioningError::cancelled(operation)),
            outcome = check() => outcome,
        };

        let reason = match outcome {
            Ok(value) => {
                debug!(operation, attempts, "converged");
                return Ok(value);
            }
            Err(CheckError::Fatal(err)) => return Err(err),
            Err(CheckError::NotReady(reason)) => reason,
        };

        let elapsed = started.elapsed();
        let remaining = policy.timeout.saturating_sub(elapsed);
        if remaining.is_zero() || remaining < policy.min_delay {
            warn!(operation, attempts, ?elapsed, %reason, "convergence budget exhausted");
            return Err(ProvisioningError::Timeout {
                operation: operation.to_string(),
                elapsed,
                attempts,
            });
        }

        let wait = delay.min(remaining);
        debug!(operation, attempts, ?wait, %reason, "not ready, retrying");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProvisioningError::cancelled(operation)),
            _ = tokio::time::sleep(wait) => {}
        }

        delay = next_delay(delay, policy.max_delay);
    }
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
