//! Retry scheduling shared by both processing engines.
//!
//! The engines never decide on their own how often to retry: they record the attempts and honour
//! the retry delay of every failure. A [`RetryPolicy`] is how a host puts bounds on that, by
//! wrapping its invoker in a [`PolicyInvoker`].

use std::time::Duration;

use async_trait::async_trait;
use eventstream_types::{
    PartitionId, ProcessingFailure, ProcessingResult, RetryContext, StreamEvent, far_future,
};
use iox_time::Time;
use observability_deps::tracing::warn;
use tokio_util::sync::CancellationToken;

use crate::ProcessingInvoker;

/// When a failure may be retried
pub fn retry_time_for(now: Time, failure: &ProcessingFailure) -> Time {
    if !failure.retryable {
        return far_future();
    }
    let delay = i64::try_from(failure.retry_delay.as_nanos()).unwrap_or(i64::MAX);
    Time::from_timestamp_nanos(now.timestamp_nanos().saturating_add(delay))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backoff {
    /// Wait the base delay before every retry
    Fixed,
    /// Double the delay with every retry, up to the max delay
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Give up once this many retries of an event have failed. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// The delay before retrying an event that has failed `attempt + 1` times
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => self
                .base_delay
                .checked_mul(2u32.saturating_pow(attempt))
                .unwrap_or(self.max_delay)
                .min(self.max_delay),
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt < max)
    }

    /// Apply the policy to a failure of an event that has been delivered with `retry`
    pub fn apply(
        &self,
        failure: ProcessingFailure,
        retry: Option<&RetryContext>,
    ) -> ProcessingFailure {
        if !failure.retryable {
            return failure;
        }
        // number of failures of this event before this one
        let attempt = retry.map_or(0, |retry| retry.processing_attempts.saturating_add(1));
        if self.should_retry(attempt) {
            ProcessingFailure {
                retry_delay: self.delay_for(attempt),
                ..failure
            }
        } else {
            ProcessingFailure {
                retryable: false,
                retry_delay: Duration::ZERO,
                ..failure
            }
        }
    }
}

/// A [`ProcessingInvoker`] that schedules the retries of another according to a [`RetryPolicy`]
#[derive(Debug)]
pub struct PolicyInvoker<I> {
    inner: I,
    policy: RetryPolicy,
}

impl<I: ProcessingInvoker> PolicyInvoker<I> {
    pub fn new(inner: I, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<I: ProcessingInvoker> ProcessingInvoker for PolicyInvoker<I> {
    async fn invoke(
        &self,
        event: &StreamEvent,
        partition: Option<&PartitionId>,
        retry: Option<&RetryContext>,
        cancellation: &CancellationToken,
    ) -> ProcessingResult {
        match self
            .inner
            .invoke(event, partition, retry, cancellation)
            .await
        {
            ProcessingResult::Failure(failure) => {
                let failure = self.policy.apply(failure, retry);
                if !failure.retryable {
                    warn!(
                        position = %event.position,
                        ?partition,
                        reason = %failure.reason,
                        "giving up on retrying event"
                    );
                }
                ProcessingResult::Failure(failure)
            }
            success => success,
        }
    }
}
