use std::sync::Arc;

use async_trait::async_trait;
use eventstream_source::EventSource;
use eventstream_types::{
    ProcessingResult, ProcessorKind, StreamPosition, StreamProcessorId, StreamProcessorState,
    UnpartitionedProcessorState,
};
use iox_time::TimeProvider;
use observability_deps::tracing::{debug, info, warn};

use crate::control::{PositionOverride, ProcessorControl, Wake, tail_changed, wait_until};
use crate::retry::retry_time_for;
use crate::{ProcessingInvoker, ProcessorError, Result, StreamProcessor, StreamProcessorStateStore};

/// Delivers the events of a stream one at a time, in order.
///
/// A failed event is retried until it succeeds; nothing behind it is delivered in the meantime.
/// An event that fails without being retryable parks the processor until its position is set.
#[derive(Debug)]
pub struct UnpartitionedStreamProcessor {
    id: StreamProcessorId,
    source: Arc<dyn EventSource>,
    invoker: Arc<dyn ProcessingInvoker>,
    store: Arc<dyn StreamProcessorStateStore>,
    time_provider: Arc<dyn TimeProvider>,
}

impl UnpartitionedStreamProcessor {
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

    async fn load_state(&self) -> Result<UnpartitionedProcessorState> {
        match self.store.get(&self.id).await? {
            None => Ok(UnpartitionedProcessorState::new(StreamPosition::START)),
            Some(StreamProcessorState::Unpartitioned(state)) => Ok(state),
            Some(state) => Err(ProcessorError::KindMismatch {
                id: self.id,
                expected: ProcessorKind::Unpartitioned,
                found: state.kind(),
            }),
        }
    }

    async fn persist(&self, state: &UnpartitionedProcessorState) -> Result<()> {
        self.store
            .persist(&self.id, &StreamProcessorState::from(state.clone()))
            .await?;
        Ok(())
    }

    async fn apply_override(
        &self,
        command: PositionOverride,
        state: UnpartitionedProcessorState,
    ) -> UnpartitionedProcessorState {
        let reset = UnpartitionedProcessorState::new(command.position());
        if command
            .apply(self.store.as_ref(), &self.id, reset.clone().into())
            .await
        {
            reset
        } else {
            state
        }
    }
}

#[async_trait]
impl StreamProcessor for UnpartitionedStreamProcessor {
    fn id(&self) -> StreamProcessorId {
        self.id
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Unpartitioned
    }

    async fn start(&self, control: &mut ProcessorControl) -> Result<()> {
        let mut state = self.load_state().await?;
        let mut tail = self
            .source
            .watch_tail(self.id.scope, self.id.source_stream);
        info!(id = %self.id, position = %state.position, "starting unpartitioned stream processor");

        while !control.is_cancelled() {
            if let Some(command) = control.try_position_override() {
                state = self.apply_override(command, state).await;
                continue;
            }

            if state.is_waiting_for_retry(self.time_provider.now()) {
                let retry = wait_until(&self.time_provider, state.retry_time);
                match control.suspend(retry).await {
                    Wake::Cancelled => break,
                    Wake::PositionOverride(command) => {
                        state = self.apply_override(command, state).await
                    }
                    Wake::Ready => {}
                }
                continue;
            }

            tail.mark_unchanged();
            let next = self
                .source
                .fetch_next(self.id.scope, self.id.source_stream, state.position)
                .await?;
            let Some(event) = next else {
                match control.suspend(tail_changed(&mut tail)).await {
                    Wake::Cancelled => break,
                    Wake::PositionOverride(command) => {
                        state = self.apply_override(command, state).await
                    }
                    Wake::Ready => {}
                }
                continue;
            };

            let retry = state.retry_context();
            let result = self
                .invoker
                .invoke(&event, None, retry.as_ref(), control.cancellation())
                .await;
            if control.is_cancelled() {
                debug!(
                    id = %self.id,
                    position = %event.position,
                    "cancelled while processing, not recording outcome"
                );
                break;
            }

            state = match result {
                ProcessingResult::Success => state.processed(event.position),
                ProcessingResult::Failure(failure) => {
                    let retry_time = retry_time_for(self.time_provider.now(), &failure);
                    let state = state.failed(event.position, failure.reason, retry_time);
                    if state.is_parked() {
                        warn!(
                            id = %self.id,
                            position = %event.position,
                            reason = %state.failure_reason,
                            "event failed permanently, stream processor parked"
                        );
                    } else {
                        info!(
                            id = %self.id,
                            position = %event.position,
                            attempts = state.processing_attempts,
                            reason = %state.failure_reason,
                            "event failed, will retry"
                        );
                    }
                    state
                }
            };
            self.persist(&state).await?;
        }

        info!(id = %self.id, position = %state.position, "stopped unpartitioned stream processor");
        Ok(())
    }

    async fn current_state(&self) -> Result<StreamProcessorState> {
        Ok(self.load_state().await?.into())
    }
}
