//! Retry policy (§4.8).

use std::time::Duration;

use crate::error::ContainerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fail,
}

/// `{maxRetries = 3, delay = 1 second}` by default. A successful read or
/// get-chunks resets the caller's retry counter to zero.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        RetryPolicy { max_retries, delay }
    }

    /// A policy with no backoff, for tests that want retry-bound assertions
    /// without actually sleeping.
    pub fn no_delay(max_retries: u32) -> Self {
        RetryPolicy {
            max_retries,
            delay: Duration::from_secs(0),
        }
    }

    /// `SecurityFault` and a `NOT_RETRIABLE` storage-container error never
    /// retry, no matter the current attempt count.
    pub fn decide(&self, cause: &ContainerError, attempt: u32) -> RetryDecision {
        if !cause.is_retryable() {
            return RetryDecision::Fail;
        }
        if attempt >= self.max_retries {
            RetryDecision::Fail
        } else {
            RetryDecision::Retry
        }
    }
}
