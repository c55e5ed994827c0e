//! The source side of stream processing: reading the events of a stream in order.
//!
//! Stream processors only ever read through the [`EventSource`] trait. How events are committed
//! and stored is up to the implementation; [`InMemoryEventLog`] is a complete in-process
//! implementation used by tests and by hosts that embed the engine.

use std::fmt::Debug;

use async_trait::async_trait;
use eventstream_types::{PartitionId, ScopeId, StreamEvent, StreamId, StreamPosition};
use thiserror::Error;
use tokio::sync::watch;

mod memory;

pub use memory::{InMemoryEventLog, UncommittedEvent};

#[derive(Debug, Error)]
pub enum EventSourceError {
    #[error("event log unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T, E = EventSourceError> = std::result::Result<T, E>;

/// Read access to the streams of the event log.
///
/// Fetching returns `Ok(None)` when the requested event has not been written yet. Callers that
/// want to wait for it should use [`watch_tail`][EventSource::watch_tail] rather than polling.
#[async_trait]
pub trait EventSource: Debug + Send + Sync + 'static {
    /// Fetch the first event at or after `position` in a stream
    async fn fetch_next(
        &self,
        scope: ScopeId,
        stream: StreamId,
        position: StreamPosition,
    ) -> Result<Option<StreamEvent>>;

    /// Fetch the first event of `partition` at or after `position` in a stream
    async fn fetch_next_in_partition(
        &self,
        scope: ScopeId,
        stream: StreamId,
        partition: &PartitionId,
        position: StreamPosition,
    ) -> Result<Option<StreamEvent>>;

    /// Subscribe to the tail of a stream.
    ///
    /// The receiver holds the position the next event will be written at, and is notified every
    /// time that changes. Mark the current value as seen before fetching so that an event
    /// written between the fetch and the wait is not missed.
    fn watch_tail(&self, scope: ScopeId, stream: StreamId) -> watch::Receiver<StreamPosition>;
}
