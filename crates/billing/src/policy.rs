//! Retry / escalation policy shared by the scheduler and webhook paths

use serde::Serialize;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Cancellation reason recorded when the retry budget is exhausted
pub const PAYMENT_FAILURE_LIMIT_REACHED: &str = "payment_failure_limit_reached";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    /// Mark past due and let the next scheduler pass retry
    Retry,
    /// Cancel immediately
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decide given the failure count *after* the current failure was counted.
    pub fn decide(&self, failed_payment_count: u32) -> RetryDecision {
        if failed_payment_count < self.max_retries {
            RetryDecision::Retry
        } else {
            RetryDecision::Escalate
        }
    }
}
