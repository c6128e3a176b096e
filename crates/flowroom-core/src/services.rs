// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policies for calls to external services.
//!
//! Service clients themselves live with the engine. What the core fixes is how long a call may
//! take overall and how often it's retried, so sprints holding contact locks stay bounded.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout_at};
use tracing::debug;

/// How a call to an external service is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deadline for the call including all retries.
    pub timeout: Duration,
    /// Pause before each retry, so its length is the number of retries.
    pub backoffs: &'static [Duration],
}

impl RetryPolicy {
    /// Airtime transfers.
    pub const AIRTIME: RetryPolicy = RetryPolicy {
        timeout: Duration::from_secs(120),
        backoffs: &[Duration::from_secs(5), Duration::from_secs(10)],
    };

    /// Email delivery over SMTP.
    pub const SMTP: RetryPolicy = RetryPolicy {
        timeout: Duration::from_secs(10),
        backoffs: &[Duration::from_secs(3), Duration::from_secs(6)],
    };

    pub fn max_retries(&self) -> usize {
        self.backoffs.len()
    }

    /// The pause before retry `attempt`, 1-indexed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Option<Duration> {
        attempt.checked_sub(1).and_then(|i| self.backoffs.get(i)).copied()
    }
}

/// Why a call with retries gave up.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The last attempt failed and no retries were left.
    Failed(E),
    /// The policy's deadline passed.
    TimedOut,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "{}", e),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Calls `op` until it succeeds, its retries run out, or the policy's deadline passes.
/// `op` is given the 0-indexed attempt number.
pub async fn with_retries<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let deadline = Instant::now() + policy.timeout;

    let attempts = async {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    attempt += 1;
                    let Some(delay) = policy.delay_for_attempt(attempt) else {
                        return Err(RetryError::Failed(e));
                    };
                    debug!(error = %e, attempt, "Service call failed, retrying");
                    sleep(delay).await;
                }
            }
        }
    };

    timeout_at(deadline, attempts)
        .await
        .unwrap_or(Err(RetryError::TimedOut))
}
