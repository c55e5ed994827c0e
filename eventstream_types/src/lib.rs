//! Shared value types for the event-stream processing engine.
//!
//! Everything here is plain data: identifiers for the streams and the processors that consume
//! them, the [`StreamEvent`] handed to a consumer, the [`ProcessingResult`] it reports back, and
//! the persisted [`state`] of a processor together with the pure transitions the engines apply
//! to it.

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use uuid::Uuid;

mod event;
mod processing;
mod serialize;
pub mod state;

pub use event::{CommittedEvent, EventSourceId, StreamEvent};
pub use processing::{ProcessingFailure, ProcessingResult, RetryContext};
pub use state::{
    FailingPartitionState, PartitionedProcessorState, ProcessorKind, StreamProcessorState,
    UnpartitionedProcessorState, far_future,
};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash,
        )]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifies a tenant. Every tenant has its own state store and its own set of processors.
    TenantId
);
uuid_id!(
    /// An isolation boundary for streams, e.g. the events a tenant produced itself versus the
    /// public events received from other tenants.
    ScopeId
);
uuid_id!(
    /// Identifies a stream within a scope
    StreamId
);
uuid_id!(
    /// Identifies the consumer (event handler, projection or embedding) that a processor
    /// delivers events to
    ConsumerId
);

impl ScopeId {
    /// The scope of events committed by the tenant itself
    pub const DEFAULT: Self = Self(Uuid::nil());

    pub fn is_default(&self) -> bool {
        self.0.is_nil()
    }
}

/// The key a partitioned consumer groups events by
#[derive(Debug, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PartitionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PartitionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The position of the next event to read from a stream. Positions start at `0`.
#[derive(
    Debug, Default, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash,
)]
pub struct StreamPosition(u64);

impl StreamPosition {
    pub const START: Self = Self(0);

    pub fn new(position: u64) -> Self {
        Self(position)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The position directly after this one
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for StreamPosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for StreamPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a stream processor: the consumer reading a source stream within a scope.
///
/// This is the key processor state is stored under, and only one processing loop may run for a
/// given id at any time.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct StreamProcessorId {
    pub scope: ScopeId,
    pub source_stream: StreamId,
    pub consumer: ConsumerId,
}

impl StreamProcessorId {
    pub fn new(scope: ScopeId, source_stream: StreamId, consumer: ConsumerId) -> Self {
        Self {
            scope,
            source_stream,
            consumer,
        }
    }
}

impl Display for StreamProcessorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.scope, self.source_stream, self.consumer)
    }
}
