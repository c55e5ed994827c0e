use iox_time::Time;
use serde::{Deserialize, Serialize};

use crate::{PartitionId, StreamPosition};

/// Identifies the source (typically an aggregate root) that produced an event
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Hash)]
pub struct EventSourceId(String);

impl EventSourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventSourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for EventSourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event as it was committed to the event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEvent {
    pub event_log_sequence_number: u64,
    #[serde(with = "crate::serialize::time_nanos")]
    pub occurred: Time,
    pub event_type: String,
    /// The JSON encoded content of the event
    pub content: String,
}

/// An event read from a stream, the unit delivered to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub event: CommittedEvent,
    pub position: StreamPosition,
    pub partition: PartitionId,
    pub event_source_id: EventSourceId,
    pub is_public: bool,
}
