use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use eventstream_types::{
    CommittedEvent, EventSourceId, PartitionId, ScopeId, StreamEvent, StreamId, StreamPosition,
};
use hashbrown::HashMap;
use iox_time::TimeProvider;
use observability_deps::tracing::debug;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::{EventSource, Result};

/// An event to append to an [`InMemoryEventLog`] stream
#[derive(Debug, Clone)]
pub struct UncommittedEvent {
    pub event_source_id: EventSourceId,
    pub partition: PartitionId,
    pub event_type: String,
    pub content: String,
    pub is_public: bool,
}

impl UncommittedEvent {
    /// Create an event that is partitioned by its event source
    pub fn new(
        event_source_id: impl Into<String>,
        event_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let event_source_id = event_source_id.into();
        Self {
            partition: PartitionId::new(event_source_id.clone()),
            event_source_id: EventSourceId::new(event_source_id),
            event_type: event_type.into(),
            content: content.into(),
            is_public: false,
        }
    }

    pub fn with_partition(mut self, partition: impl Into<PartitionId>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn public(mut self) -> Self {
        self.is_public = true;
        self
    }
}

#[derive(Debug, Default)]
struct StreamContents {
    events: Vec<StreamEvent>,
    /// Positions of the events in each partition, in order
    by_partition: HashMap<PartitionId, Vec<StreamPosition>>,
}

#[derive(Debug)]
struct StreamLog {
    contents: RwLock<StreamContents>,
    tail: watch::Sender<StreamPosition>,
}

impl StreamLog {
    fn new() -> Self {
        let (tail, _) = watch::channel(StreamPosition::START);
        Self {
            contents: Default::default(),
            tail,
        }
    }
}

/// An event log held in memory.
///
/// Streams are created on first use. Every append notifies the tail watchers of that stream, and
/// only of that stream.
#[derive(Debug)]
pub struct InMemoryEventLog {
    time_provider: Arc<dyn TimeProvider>,
    streams: RwLock<HashMap<(ScopeId, StreamId), Arc<StreamLog>>>,
    next_sequence_number: AtomicU64,
}

impl InMemoryEventLog {
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            time_provider,
            streams: Default::default(),
            next_sequence_number: AtomicU64::new(0),
        }
    }

    fn stream(&self, scope: ScopeId, stream: StreamId) -> Arc<StreamLog> {
        if let Some(log) = self.streams.read().get(&(scope, stream)) {
            return Arc::clone(log);
        }
        Arc::clone(
            self.streams
                .write()
                .entry((scope, stream))
                .or_insert_with(|| Arc::new(StreamLog::new())),
        )
    }

    /// Append an event to a stream, returning the position it was written at
    pub fn append(
        &self,
        scope: ScopeId,
        stream: StreamId,
        event: UncommittedEvent,
    ) -> StreamPosition {
        let log = self.stream(scope, stream);
        let position = {
            let mut contents = log.contents.write();
            let position = StreamPosition::new(contents.events.len() as u64);
            let committed = CommittedEvent {
                event_log_sequence_number: self.next_sequence_number.fetch_add(1, Ordering::SeqCst),
                occurred: self.time_provider.now(),
                event_type: event.event_type,
                content: event.content,
            };
            contents
                .by_partition
                .entry(event.partition.clone())
                .or_default()
                .push(position);
            contents.events.push(StreamEvent {
                event: committed,
                position,
                partition: event.partition,
                event_source_id: event.event_source_id,
                is_public: event.is_public,
            });
            // published under the lock so the tail never moves backwards
            log.tail.send_replace(position.next());
            position
        };
        debug!(%scope, %stream, %position, "appended event");
        position
    }

    /// Append events to a stream in order, returning the position of the last one
    pub fn append_all(
        &self,
        scope: ScopeId,
        stream: StreamId,
        events: impl IntoIterator<Item = UncommittedEvent>,
    ) -> Option<StreamPosition> {
        events
            .into_iter()
            .map(|event| self.append(scope, stream, event))
            .last()
    }

    /// The position the next event of a stream will be written at
    pub fn tail(&self, scope: ScopeId, stream: StreamId) -> StreamPosition {
        *self.stream(scope, stream).tail.borrow()
    }
}

#[async_trait]
impl EventSource for InMemoryEventLog {
    async fn fetch_next(
        &self,
        scope: ScopeId,
        stream: StreamId,
        position: StreamPosition,
    ) -> Result<Option<StreamEvent>> {
        let log = self.stream(scope, stream);
        let contents = log.contents.read();
        Ok(contents.events.get(position.as_u64() as usize).cloned())
    }

    async fn fetch_next_in_partition(
        &self,
        scope: ScopeId,
        stream: StreamId,
        partition: &PartitionId,
        position: StreamPosition,
    ) -> Result<Option<StreamEvent>> {
        let log = self.stream(scope, stream);
        let contents = log.contents.read();
        let Some(positions) = contents.by_partition.get(partition) else {
            return Ok(None);
        };
        let index = positions.partition_point(|p| *p < position);
        Ok(positions
            .get(index)
            .and_then(|p| contents.events.get(p.as_u64() as usize))
            .cloned())
    }

    fn watch_tail(&self, scope: ScopeId, stream: StreamId) -> watch::Receiver<StreamPosition> {
        self.stream(scope, stream).tail.subscribe()
    }
}
