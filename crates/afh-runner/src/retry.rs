// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry policy for scenarios.
//!
//! A retried scenario starts again from the loaded home page; nothing of the
//! failed attempt is resumed. There is no backoff between attempts.

use afh_error::{HarnessError, HarnessErrorDto};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// How many times a failed scenario is re-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts after the first. `0` disables retries.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}

impl RetryPolicy {
    /// Policy allowing `max_retries` extra attempts.
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Attempts allowed in total.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether the scenario gets another attempt after `attempt` (1-based)
    /// failed with `err`.
    pub fn should_retry(&self, attempt: u32, err: &HarnessError) -> bool {
        if !err.code.is_retryable() {
            return false;
        }
        let again = attempt < self.max_attempts();
        if again {
            warn!(
                target: "afh.runner",
                attempt,
                code = %err.code,
                error = %err.message,
                "attempt failed, retrying"
            );
        }
        again
    }
}

/// One attempt of a scenario or setup phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Wall-clock time of the attempt.
    #[serde(with = "crate::report::duration_millis", rename = "duration_ms")]
    pub duration: Duration,
    /// Failure, when the attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HarnessErrorDto>,
}

impl AttemptRecord {
    /// Record of a passed attempt.
    pub fn passed(attempt: u32, duration: Duration) -> Self {
        Self {
            attempt,
            duration,
            error: None,
        }
    }

    /// Record of a failed attempt.
    pub fn failed(attempt: u32, duration: Duration, err: &HarnessError) -> Self {
        Self {
            attempt,
            duration,
            error: Some(err.into()),
        }
    }
}
