use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use eventstream_types::{PartitionId, ProcessingResult, RetryContext, StreamEvent};
use tokio_util::sync::CancellationToken;

/// Delivers events to the consumer a stream processor runs for.
///
/// Delivery itself, typically a call to a remote client, is opaque to the processors. Any error
/// in delivering should be reported as a [`ProcessingResult::Failure`], together with whether and
/// when to retry.
#[async_trait]
pub trait ProcessingInvoker: Debug + Send + Sync + 'static {
    /// Deliver `event` to the consumer.
    ///
    /// `partition` is set for partitioned consumers. `retry` is set when the event is delivered
    /// again after a failure.
    async fn invoke(
        &self,
        event: &StreamEvent,
        partition: Option<&PartitionId>,
        retry: Option<&RetryContext>,
        cancellation: &CancellationToken,
    ) -> ProcessingResult;
}

#[async_trait]
impl<T: ProcessingInvoker + ?Sized> ProcessingInvoker for Arc<T> {
    async fn invoke(
        &self,
        event: &StreamEvent,
        partition: Option<&PartitionId>,
        retry: Option<&RetryContext>,
        cancellation: &CancellationToken,
    ) -> ProcessingResult {
        (**self).invoke(event, partition, retry, cancellation).await
    }
}
