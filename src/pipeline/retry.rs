use super::classifier::Classification;

pub const MAX_RETRIES: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the job to `pending`.
    Retry,
    /// Move the job to `failed`.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: MAX_RETRIES }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: i32) -> Self {
        Self { max_retries }
    }

    /// `retry_count` is the count after the failed attempt has been recorded.
    pub fn decide(&self, retry_count: i32, verdict: Classification) -> RetryDecision {
        if !verdict.retryable || retry_count >= self.max_retries {
            RetryDecision::Fail
        } else {
            RetryDecision::Retry
        }
    }
}
