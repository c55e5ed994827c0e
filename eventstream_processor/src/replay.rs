use std::future::Future;

use dashmap::DashSet;
use eventstream_types::{StreamPosition, StreamProcessorId, StreamProcessorState, TenantId};
use observability_deps::tracing::{info, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::StreamProcessors;
use crate::state_store::StateStoreError;

#[derive(Debug, Error)]
pub enum SetPositionError {
    #[error("already setting a new position for stream processor {0}")]
    AlreadySettingNewStreamProcessorPosition(StreamProcessorId),

    #[error("stream processor {0} is not registered")]
    ProcessorNotRegistered(StreamProcessorId),

    #[error("precondition for setting the position of stream processor {id} failed: {source}")]
    PreconditionFailed {
        id: StreamProcessorId,
        source: anyhow::Error,
    },

    #[error("state store error: {0}")]
    StateStore(#[from] StateStoreError),
}

/// Marks a processor as having its position set, for as long as the guard lives
#[derive(Debug)]
struct ReplayGuard<'a> {
    replaying: &'a DashSet<StreamProcessorId>,
    id: StreamProcessorId,
}

impl<'a> ReplayGuard<'a> {
    fn acquire(replaying: &'a DashSet<StreamProcessorId>, id: StreamProcessorId) -> Option<Self> {
        replaying.insert(id).then_some(Self { replaying, id })
    }
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.replaying.remove(&self.id);
    }
}

impl StreamProcessors {
    /// Move a processor to `position`, healing all of its failures.
    ///
    /// `before` runs first, with the tenant and a token cancelled on shutdown; if it fails the
    /// processor's state is left untouched. Only one position change per processor may be in
    /// flight at a time.
    ///
    /// A running processor applies the change itself between two events, so nothing it is doing
    /// at the time overwrites the new position. Returns the state the processor was moved to.
    pub async fn set_position<F, Fut>(
        &self,
        id: StreamProcessorId,
        position: StreamPosition,
        before: F,
    ) -> Result<StreamProcessorState, SetPositionError>
    where
        F: FnOnce(TenantId, CancellationToken) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let _guard = ReplayGuard::acquire(&self.replaying, id)
            .ok_or(SetPositionError::AlreadySettingNewStreamProcessorPosition(id))?;
        let current = self
            .store
            .get(&id)
            .await?
            .ok_or(SetPositionError::ProcessorNotRegistered(id))?;

        if let Err(source) = before(self.tenant, self.shutdown.child_token()).await {
            warn!(
                tenant = %self.tenant,
                %id,
                %position,
                error = %source,
                "precondition for setting position failed"
            );
            return Err(SetPositionError::PreconditionFailed { id, source });
        }

        let overridden = match self.running_handle(&id) {
            Some(handle) => handle.override_position(position).await,
            None => None,
        };
        let state = match overridden {
            Some(result) => result?,
            None => {
                let state = current.reset_to(position);
                self.store.persist(&id, &state).await?;
                state
            }
        };

        info!(tenant = %self.tenant, %id, %position, "set stream processor position");
        Ok(state)
    }

    /// Move a processor back to the start of its stream, see
    /// [`set_position`][Self::set_position].
    pub async fn reprocess_all_events<F, Fut>(
        &self,
        id: StreamProcessorId,
        before: F,
    ) -> Result<StreamProcessorState, SetPositionError>
    where
        F: FnOnce(TenantId, CancellationToken) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        self.set_position(id, StreamPosition::START, before).await
    }
}
