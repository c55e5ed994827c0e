use async_trait::async_trait;
use eventstream_types::{StreamProcessorId, StreamProcessorState};
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::{Result, StreamProcessorStateStore};

/// Keeps processor state in memory, for tests and for hosts that don't need state to survive a
/// restart.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: RwLock<HashMap<StreamProcessorId, StreamProcessorState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamProcessorStateStore for InMemoryStateStore {
    async fn get(&self, id: &StreamProcessorId) -> Result<Option<StreamProcessorState>> {
        Ok(self.states.read().get(id).cloned())
    }

    async fn persist(&self, id: &StreamProcessorId, state: &StreamProcessorState) -> Result<()> {
        self.states.write().insert(*id, state.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(StreamProcessorId, StreamProcessorState)>> {
        let mut states: Vec<_> = self
            .states
            .read()
            .iter()
            .map(|(id, state)| (*id, state.clone()))
            .collect();
        states.sort_by_key(|(id, _)| *id);
        Ok(states)
    }
}
