//! Stream processors deliver the events of a stream to a consumer and track how far it got.
//!
//! There are two engines, both implementing [`StreamProcessor`]:
//!
//! - [`UnpartitionedStreamProcessor`] reads its stream as one sequence. A failing event blocks
//!   the processor until it succeeds or the processor's position is set past it.
//! - [`PartitionedStreamProcessor`] keeps one read cursor for the stream and tracks failures per
//!   partition, so a failing partition never holds up the others.
//!
//! Every state transition is persisted to a [`StreamProcessorStateStore`] before the next event
//! is read, so a processor restarted after a crash resumes exactly where it left off.
//!
//! [`StreamProcessors`] hosts the processors of a tenant: it runs one loop per
//! [`StreamProcessorId`], restarts loops that fail on source or storage errors, and is the entry
//! point for setting a processor's position (replay).

use std::fmt::Debug;

use async_trait::async_trait;
use eventstream_source::EventSourceError;
use eventstream_types::{ProcessorKind, StreamProcessorId, StreamProcessorState};
use thiserror::Error;

pub mod control;
pub mod invoker;
mod partitioned;
mod processors;
mod replay;
pub mod retry;
pub mod state_store;
#[cfg(test)]
mod test_helpers;
mod unpartitioned;

pub use control::{ProcessorControl, ProcessorHandle, processor_control};
pub use invoker::ProcessingInvoker;
pub use partitioned::PartitionedStreamProcessor;
pub use processors::{
    ProcessorStatus, RegistrationError, StreamProcessors, StreamProcessorsConfig,
};
pub use replay::SetPositionError;
pub use state_store::{StateStoreError, StreamProcessorStateStore};
pub use unpartitioned::UnpartitionedStreamProcessor;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("event source error: {0}")]
    EventSource(#[from] EventSourceError),

    #[error("state store error: {0}")]
    StateStore(#[from] StateStoreError),

    #[error("stream processor {id} is {expected} but its stored state is {found}")]
    KindMismatch {
        id: StreamProcessorId,
        expected: ProcessorKind,
        found: ProcessorKind,
    },
}

pub type Result<T, E = ProcessorError> = std::result::Result<T, E>;

/// A processing loop for a single [`StreamProcessorId`]
#[async_trait]
pub trait StreamProcessor: Debug + Send + Sync + 'static {
    fn id(&self) -> StreamProcessorId;

    fn kind(&self) -> ProcessorKind;

    /// Run the processing loop until the control's cancellation token fires.
    ///
    /// Returns `Ok(())` once cancelled. Errors reading the stream or persisting state end the
    /// loop; everything up to the last persisted state has been processed, so the loop can
    /// simply be started again.
    async fn start(&self, control: &mut ProcessorControl) -> Result<()>;

    /// The last persisted state of this processor
    async fn current_state(&self) -> Result<StreamProcessorState>;
}
