use std::time::Duration;

/// The outcome of delivering a single event to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// The event was fully and finally processed
    Success,
    /// The consumer failed to process the event
    Failure(ProcessingFailure),
}

impl ProcessingResult {
    /// A failure that should be retried after `retry_delay`
    pub fn retryable(reason: impl Into<String>, retry_delay: Duration) -> Self {
        Self::Failure(ProcessingFailure {
            reason: reason.into(),
            retryable: true,
            retry_delay,
        })
    }

    /// A failure that parks the processor (or partition) until it is replayed
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Failure(ProcessingFailure {
            reason: reason.into(),
            retryable: false,
            retry_delay: Duration::ZERO,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingFailure {
    pub reason: String,
    pub retryable: bool,
    /// Only meaningful when `retryable` is set
    pub retry_delay: Duration,
}

/// Handed to a consumer when an event is delivered again after failing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    /// Number of retries of this event that have failed so far
    pub processing_attempts: u32,
    /// The reason the last attempt failed
    pub failure_reason: String,
}
