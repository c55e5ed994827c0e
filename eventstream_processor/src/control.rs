//! The channel between a running processing loop and whoever hosts it.
//!
//! A loop is the only writer of its processor's state. Stopping it goes through a
//! [`CancellationToken`], and setting its position goes through a [`PositionOverride`] command
//! the loop applies between two events.

use std::future::Future;
use std::sync::Arc;

use eventstream_types::{StreamPosition, StreamProcessorId, StreamProcessorState, far_future};
use futures::FutureExt;
use futures::future::{self, BoxFuture};
use iox_time::{Time, TimeProvider};
use observability_deps::tracing::{info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::state_store::{StateStoreError, StreamProcessorStateStore};

const COMMAND_BUFFER_SIZE: usize = 8;

/// Request for a processing loop to move to a new position, healing every failure.
#[derive(Debug)]
pub struct PositionOverride {
    position: StreamPosition,
    ack: oneshot::Sender<Result<StreamProcessorState, StateStoreError>>,
}

impl PositionOverride {
    pub fn position(&self) -> StreamPosition {
        self.position
    }

    /// Persist `state` as the result of this override and let the requester know how that went.
    ///
    /// Returns whether the state was persisted; if not, the caller should carry on from the state
    /// it had.
    pub async fn apply(
        self,
        store: &dyn StreamProcessorStateStore,
        id: &StreamProcessorId,
        state: StreamProcessorState,
    ) -> bool {
        let result = store.persist(id, &state).await;
        let applied = result.is_ok();
        match &result {
            Ok(()) => info!(%id, position = %self.position, "set stream processor position"),
            Err(error) => warn!(
                %id,
                position = %self.position,
                %error,
                "failed to set stream processor position"
            ),
        }
        // the requester may have given up waiting
        let _ = self.ack.send(result.map(|()| state));
        applied
    }
}

/// Why [`ProcessorControl::suspend`] returned
#[derive(Debug)]
pub enum Wake {
    Cancelled,
    PositionOverride(PositionOverride),
    /// The future the loop was waiting on completed
    Ready,
}

/// The loop's end of the control channel
#[derive(Debug)]
pub struct ProcessorControl {
    cancel: CancellationToken,
    commands: mpsc::Receiver<PositionOverride>,
}

impl ProcessorControl {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The token handed to the consumer with every invocation
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Take a pending position override, if there is one
    pub fn try_position_override(&mut self) -> Option<PositionOverride> {
        self.commands.try_recv().ok()
    }

    /// Wait for `fut`, unless the loop is cancelled or asked to move first.
    pub async fn suspend<F>(&mut self, fut: F) -> Wake
    where
        F: Future<Output = ()> + Send,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Wake::Cancelled,
            Some(command) = self.commands.recv() => Wake::PositionOverride(command),
            _ = fut => Wake::Ready,
        }
    }
}

/// The host's end of the control channel
#[derive(Debug, Clone)]
pub struct ProcessorHandle {
    cancel: CancellationToken,
    commands: mpsc::Sender<PositionOverride>,
}

impl ProcessorHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ask the loop to move to `position` and wait for it to persist the new state.
    ///
    /// Returns `None` if nothing is serving the control channel any more, in which case the
    /// override was not applied.
    pub(crate) async fn override_position(
        &self,
        position: StreamPosition,
    ) -> Option<Result<StreamProcessorState, StateStoreError>> {
        let (ack, response) = oneshot::channel();
        self.commands
            .send(PositionOverride { position, ack })
            .await
            .ok()?;
        response.await.ok()
    }
}

/// Create both ends of the control channel of a processing loop. Cancelling `cancel` stops the
/// loop.
pub fn processor_control(cancel: CancellationToken) -> (ProcessorHandle, ProcessorControl) {
    let (sender, receiver) = mpsc::channel(COMMAND_BUFFER_SIZE);
    (
        ProcessorHandle {
            cancel: cancel.clone(),
            commands: sender,
        },
        ProcessorControl {
            cancel,
            commands: receiver,
        },
    )
}

/// Completes at `time`. Parked processors and partitions never come due on their own.
pub(crate) fn wait_until(
    time_provider: &Arc<dyn TimeProvider>,
    time: Time,
) -> BoxFuture<'static, ()> {
    if time == far_future() {
        future::pending().boxed()
    } else {
        time_provider.sleep_until(time)
    }
}

/// Completes once the tail of the stream has moved past what was last seen
pub(crate) async fn tail_changed(tail: &mut watch::Receiver<StreamPosition>) {
    if tail.changed().await.is_err() {
        // the stream is gone, nothing will ever be written to it again
        future::pending::<()>().await;
    }
}
