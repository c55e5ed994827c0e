use std::sync::Arc;

use async_trait::async_trait;
use eventstream_types::{ConsumerId, ScopeId, StreamId, StreamProcessorId, StreamProcessorState};
use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::path::Path;
use observability_deps::tracing::debug;
use uuid::Uuid;

use super::{Result, StateStoreError, StreamProcessorStateStore};

const STATE_PREFIX: &str = "stream_processors";
const STATE_FILE_EXTENSION: &str = "json";

/// Persists the state of each processor as a JSON document in object storage, at
/// `stream_processors/{scope}/{stream}/{consumer}.json`.
#[derive(Debug)]
pub struct ObjectStoreStateStore {
    object_store: Arc<dyn ObjectStore>,
}

impl ObjectStoreStateStore {
    pub fn new(object_store: Arc<dyn ObjectStore>) -> Self {
        Self { object_store }
    }

    fn path(id: &StreamProcessorId) -> Path {
        Path::from(format!(
            "{STATE_PREFIX}/{}/{}/{}.{STATE_FILE_EXTENSION}",
            id.scope, id.source_stream, id.consumer
        ))
    }

    fn parse_path(path: &Path) -> Result<StreamProcessorId> {
        let invalid = || StateStoreError::InvalidPath(path.to_string());
        let parts: Vec<_> = path.parts().collect();
        let [prefix, scope, stream, file] = parts.as_slice() else {
            return Err(invalid());
        };
        if prefix.as_ref() != STATE_PREFIX {
            return Err(invalid());
        }
        let consumer = file
            .as_ref()
            .strip_suffix(STATE_FILE_EXTENSION)
            .and_then(|name| name.strip_suffix('.'))
            .ok_or_else(invalid)?;
        let parse = |part: &str| Uuid::parse_str(part).map_err(|_| invalid());
        Ok(StreamProcessorId::new(
            ScopeId::from(parse(scope.as_ref())?),
            StreamId::from(parse(stream.as_ref())?),
            ConsumerId::from(parse(consumer)?),
        ))
    }

    async fn get_at(&self, path: &Path) -> Result<Option<StreamProcessorState>> {
        let bytes = match self.object_store.get(path).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[async_trait]
impl StreamProcessorStateStore for ObjectStoreStateStore {
    async fn get(&self, id: &StreamProcessorId) -> Result<Option<StreamProcessorState>> {
        self.get_at(&Self::path(id)).await
    }

    async fn persist(&self, id: &StreamProcessorId, state: &StreamProcessorState) -> Result<()> {
        let path = Self::path(id);
        let data = serde_json::to_vec(state)?;
        self.object_store.put(&path, data.into()).await?;
        debug!(%path, position = %state.position(), "persisted stream processor state");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(StreamProcessorId, StreamProcessorState)>> {
        let prefix = Path::from(STATE_PREFIX);
        let objects: Vec<_> = self
            .object_store
            .list(Some(&prefix))
            .try_collect()
            .await?;

        let mut states = Vec::with_capacity(objects.len());
        for object in objects {
            let id = Self::parse_path(&object.location)?;
            if let Some(state) = self.get_at(&object.location).await? {
                states.push((id, state));
            }
        }
        states.sort_by_key(|(id, _)| *id);
        Ok(states)
    }
}
