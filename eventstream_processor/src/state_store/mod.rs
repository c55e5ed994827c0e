//! Durable storage of stream processor state.

use std::fmt::Debug;

use async_trait::async_trait;
use eventstream_types::{StreamProcessorId, StreamProcessorState};
use thiserror::Error;

mod memory;
mod object_store;

pub use self::memory::InMemoryStateStore;
pub use self::object_store::ObjectStoreStateStore;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] ::object_store::Error),

    #[error("error serializing stream processor state: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stream processor state path: {0}")]
    InvalidPath(String),

    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T, E = StateStoreError> = std::result::Result<T, E>;

/// Stores the state of stream processors, keyed by [`StreamProcessorId`].
///
/// Each processor has a single writer at a time, so implementations only need to make each
/// `persist` atomic, not coordinate writers.
#[async_trait]
pub trait StreamProcessorStateStore: Debug + Send + Sync + 'static {
    /// Get the persisted state of a processor, `None` if it has never been persisted
    async fn get(&self, id: &StreamProcessorId) -> Result<Option<StreamProcessorState>>;

    /// Persist the state of a processor, replacing what was there
    async fn persist(&self, id: &StreamProcessorId, state: &StreamProcessorState) -> Result<()>;

    /// All persisted processor states
    async fn list(&self) -> Result<Vec<(StreamProcessorId, StreamProcessorState)>>;

    async fn has_state(&self, id: &StreamProcessorId) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }
}
