use std::sync::Arc;

use async_trait::async_trait;
use eventstream_source::EventSource;
use eventstream_types::{
    PartitionId, PartitionedProcessorState, ProcessingFailure, ProcessingResult, ProcessorKind,
    StreamEvent, StreamPosition, StreamProcessorId, StreamProcessorState,
};
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use iox_time::TimeProvider;
use observability_deps::tracing::{debug, info, warn};

use crate::control::{PositionOverride, ProcessorControl, Wake, tail_changed, wait_until};
use crate::retry::retry_time_for;
use crate::{ProcessingInvoker, ProcessorError, Result, StreamProcessor, StreamProcessorStateStore};

/// Delivers the events of a stream with failures isolated per partition.
///
/// The processor keeps a single read cursor over the stream. When an event fails, its partition
/// is recorded as failing and the cursor moves on, passing over any later events of that
/// partition. Once the partition's retry time comes up, its events are delivered again from the
/// failed one onwards, in order, until it has caught up with the cursor.
#[derive(Debug)]
pub struct PartitionedStreamProcessor {
    id: StreamProcessorId,
    source: Arc<dyn EventSource>,
    invoker: Arc<dyn ProcessingInvoker>,
    store: Arc<dyn StreamProcessorStateStore>,
    time_provider: Arc<dyn TimeProvider>,
}

impl PartitionedStreamProcessor {
    pub fn new(
        id: StreamProcessorId,
        source: Arc<dyn EventSource>,
        invoker: Arc<dyn ProcessingInvoker>,
        store: Arc<dyn StreamProcessorStateStore>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            id,
            source,
            invoker,
            store,
            time_provider,
        }
    }

    async fn load_state(&self) -> Result<PartitionedProcessorState> {
        match self.store.get(&self.id).await? {
            None => Ok(PartitionedProcessorState::new(StreamPosition::START)),
            Some(StreamProcessorState::Partitioned(state)) => Ok(state),
            Some(state) => Err(ProcessorError::KindMismatch {
                id: self.id,
                expected: ProcessorKind::Partitioned,
                found: state.kind(),
            }),
        }
    }

    async fn persist(&self, state: &PartitionedProcessorState) -> Result<()> {
        self.store
            .persist(&self.id, &StreamProcessorState::from(state.clone()))
            .await?;
        Ok(())
    }

    async fn apply_override(
        &self,
        command: PositionOverride,
        state: PartitionedProcessorState,
    ) -> PartitionedProcessorState {
        let reset = PartitionedProcessorState::new(command.position());
        if command
            .apply(self.store.as_ref(), &self.id, reset.clone().into())
            .await
        {
            reset
        } else {
            state
        }
    }

    async fn next_in_partition(
        &self,
        partition: &PartitionId,
        position: StreamPosition,
    ) -> Result<Option<StreamEvent>> {
        Ok(self
            .source
            .fetch_next_in_partition(self.id.scope, self.id.source_stream, partition, position)
            .await?)
    }

    fn record_failure(
        &self,
        state: &mut PartitionedProcessorState,
        partition: PartitionId,
        position: StreamPosition,
        failure: ProcessingFailure,
    ) {
        let retry_time = retry_time_for(self.time_provider.now(), &failure);
        let was_failing = state
            .partitions
            .get(&partition)
            .is_some_and(|failing| failing.failed && failing.position == position);
        state.failed(partition.clone(), position, failure.reason, retry_time);

        let Some(failing_partition) = state.partitions.get(&partition) else {
            return;
        };
        if failing_partition.is_parked() {
            warn!(
                id = %self.id,
                %partition,
                %position,
                reason = %failing_partition.failure_reason,
                "event failed permanently, partition parked"
            );
        } else {
            info!(
                id = %self.id,
                %partition,
                %position,
                retry = was_failing,
                attempts = failing_partition.processing_attempts,
                reason = %failing_partition.failure_reason,
                "event failed, will retry partition"
            );
        }
    }

    /// Wait for the stream to grow, or for the next failing partition to come due
    fn wait_for_work<'a>(
        &self,
        state: &PartitionedProcessorState,
        tail: &'a mut tokio::sync::watch::Receiver<StreamPosition>,
    ) -> BoxFuture<'a, ()> {
        let retry: BoxFuture<'static, ()> = match state.next_retry_time() {
            Some(retry_time) => wait_until(&self.time_provider, retry_time),
            None => future::pending().boxed(),
        };
        async move {
            tokio::select! {
                _ = tail_changed(tail) => {}
                _ = retry => {}
            }
        }
        .boxed()
    }
}

#[async_trait]
impl StreamProcessor for PartitionedStreamProcessor {
    fn id(&self) -> StreamProcessorId {
        self.id
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Partitioned
    }

    async fn start(&self, control: &mut ProcessorControl) -> Result<()> {
        let mut state = self.load_state().await?;
        let mut tail = self
            .source
            .watch_tail(self.id.scope, self.id.source_stream);
        info!(
            id = %self.id,
            position = %state.position,
            failing_partitions = state.partitions.len(),
            "starting partitioned stream processor"
        );

        while !control.is_cancelled() {
            if let Some(command) = control.try_position_override() {
                state = self.apply_override(command, state).await;
                continue;
            }

            // failing partitions that are due go first, so they catch up before the cursor moves
            let now = self.time_provider.now();
            let due = state.next_due_partition(now).map(|(partition, failing)| {
                (partition.clone(), failing.position, failing.retry_context())
            });
            if let Some((partition, position, retry)) = due {
                let Some(event) = self.next_in_partition(&partition, position).await? else {
                    state.retried(&partition, None, now);
                    self.persist(&state).await?;
                    continue;
                };

                let result = self
                    .invoker
                    .invoke(&event, Some(&partition), retry.as_ref(), control.cancellation())
                    .await;
                if control.is_cancelled() {
                    debug!(
                        id = %self.id,
                        %partition,
                        position = %event.position,
                        "cancelled while retrying, not recording outcome"
                    );
                    break;
                }

                match result {
                    ProcessingResult::Success => {
                        let next = self
                            .next_in_partition(&partition, event.position.next())
                            .await?
                            .map(|event| event.position);
                        state.retried(&partition, next, self.time_provider.now());
                        if !state.is_failing(&partition) {
                            info!(id = %self.id, %partition, "partition caught up");
                        }
                    }
                    ProcessingResult::Failure(failure) => {
                        self.record_failure(&mut state, partition, event.position, failure)
                    }
                }
                self.persist(&state).await?;
                continue;
            }

            tail.mark_unchanged();
            let next = self
                .source
                .fetch_next(self.id.scope, self.id.source_stream, state.position)
                .await?;
            let Some(event) = next else {
                let wait = self.wait_for_work(&state, &mut tail);
                match control.suspend(wait).await {
                    Wake::Cancelled => break,
                    Wake::PositionOverride(command) => {
                        state = self.apply_override(command, state).await
                    }
                    Wake::Ready => {}
                }
                continue;
            };

            if state.is_failing(&event.partition) {
                debug!(
                    id = %self.id,
                    partition = %event.partition,
                    position = %event.position,
                    "partition failing, passing over event"
                );
                state.skipped(event.position);
                self.persist(&state).await?;
                continue;
            }

            let result = self
                .invoker
                .invoke(&event, Some(&event.partition), None, control.cancellation())
                .await;
            if control.is_cancelled() {
                debug!(
                    id = %self.id,
                    position = %event.position,
                    "cancelled while processing, not recording outcome"
                );
                break;
            }

            match result {
                ProcessingResult::Success => state.processed(event.position),
                ProcessingResult::Failure(failure) => {
                    self.record_failure(&mut state, event.partition, event.position, failure)
                }
            }
            self.persist(&state).await?;
        }

        info!(
            id = %self.id,
            position = %state.position,
            failing_partitions = state.partitions.len(),
            "stopped partitioned stream processor"
        );
        Ok(())
    }

    async fn current_state(&self) -> Result<StreamProcessorState> {
        Ok(self.load_state().await?.into())
    }
}
