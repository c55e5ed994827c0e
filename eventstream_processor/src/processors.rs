use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use eventstream_source::EventSource;
use eventstream_types::{ProcessorKind, StreamProcessorId, StreamProcessorState, TenantId};
use hashbrown::HashMap;
use iox_time::TimeProvider;
use observability_deps::tracing::{error, info, warn};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::control::{ProcessorControl, ProcessorHandle, Wake, processor_control};
use crate::{
    PartitionedStreamProcessor, ProcessingInvoker, ProcessorError, StreamProcessor,
    StreamProcessorStateStore, UnpartitionedStreamProcessor,
};

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("stream processor {0} is already running")]
    AlreadyRegistered(StreamProcessorId),

    #[error("the position of stream processor {0} is being set")]
    SettingPosition(StreamProcessorId),

    #[error("stream processors are shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

#[derive(Debug, Clone, Copy)]
pub struct StreamProcessorsConfig {
    /// How long to wait before restarting a processing loop that failed
    pub restart_delay: Duration,
}

impl Default for StreamProcessorsConfig {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// Snapshot of a registered processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorStatus {
    pub id: StreamProcessorId,
    pub kind: ProcessorKind,
    pub running: bool,
    pub state: StreamProcessorState,
}

#[derive(Debug)]
struct RegisteredProcessor {
    processor: Arc<dyn StreamProcessor>,
    handle: ProcessorHandle,
    task: Option<JoinHandle<()>>,
}

impl RegisteredProcessor {
    fn is_running(&self) -> bool {
        !self.handle.is_stopped() && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

/// Hosts the stream processors of a tenant.
///
/// Runs one processing loop per registered [`StreamProcessorId`], restarts loops that end with an
/// error, and is where a processor's position is set (see
/// [`set_position`][StreamProcessors::set_position]).
#[derive(Debug)]
pub struct StreamProcessors {
    pub(crate) tenant: TenantId,
    source: Arc<dyn EventSource>,
    pub(crate) store: Arc<dyn StreamProcessorStateStore>,
    time_provider: Arc<dyn TimeProvider>,
    config: StreamProcessorsConfig,
    processors: RwLock<HashMap<StreamProcessorId, RegisteredProcessor>>,
    /// Processors whose position is being set
    pub(crate) replaying: DashSet<StreamProcessorId>,
    pub(crate) shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl StreamProcessors {
    pub fn new(
        tenant: TenantId,
        source: Arc<dyn EventSource>,
        store: Arc<dyn StreamProcessorStateStore>,
        time_provider: Arc<dyn TimeProvider>,
        config: StreamProcessorsConfig,
    ) -> Self {
        Self {
            tenant,
            source,
            store,
            time_provider,
            config,
            processors: Default::default(),
            replaying: DashSet::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    /// Register a processor and start its processing loop.
    ///
    /// The processor starts from its persisted state, or from the start of the stream if it has
    /// none. A processor that was stopped can be registered again, but not while its position is
    /// being set.
    pub async fn register(
        &self,
        id: StreamProcessorId,
        kind: ProcessorKind,
        invoker: Arc<dyn ProcessingInvoker>,
    ) -> Result<(), RegistrationError> {
        if self.shutdown.is_cancelled() {
            return Err(RegistrationError::ShuttingDown);
        }
        if self.is_running(&id) {
            return Err(RegistrationError::AlreadyRegistered(id));
        }

        match self.store.get(&id).await.map_err(ProcessorError::from)? {
            Some(state) if state.kind() != kind => {
                return Err(ProcessorError::KindMismatch {
                    id,
                    expected: kind,
                    found: state.kind(),
                }
                .into());
            }
            Some(_) => {}
            None => self
                .store
                .persist(&id, &StreamProcessorState::initial(kind))
                .await
                .map_err(ProcessorError::from)?,
        }

        let processor: Arc<dyn StreamProcessor> = match kind {
            ProcessorKind::Unpartitioned => Arc::new(UnpartitionedStreamProcessor::new(
                id,
                Arc::clone(&self.source),
                invoker,
                Arc::clone(&self.store),
                Arc::clone(&self.time_provider),
            )),
            ProcessorKind::Partitioned => Arc::new(PartitionedStreamProcessor::new(
                id,
                Arc::clone(&self.source),
                invoker,
                Arc::clone(&self.store),
                Arc::clone(&self.time_provider),
            )),
        };

        // checked under the write lock so that `set_position` either sees the new loop or keeps
        // it from starting
        let mut processors = self.processors.write();
        if processors
            .get(&id)
            .is_some_and(|registered| registered.is_running())
        {
            return Err(RegistrationError::AlreadyRegistered(id));
        }
        if self.replaying.contains(&id) {
            return Err(RegistrationError::SettingPosition(id));
        }
        let (handle, control) = processor_control(self.shutdown.child_token());
        let task = self.tasks.spawn(run_processor(
            Arc::clone(&processor),
            control,
            Arc::clone(&self.store),
            Arc::clone(&self.time_provider),
            self.config.restart_delay,
        ));
        processors.insert(
            id,
            RegisteredProcessor {
                processor,
                handle,
                task: Some(task),
            },
        );
        info!(tenant = %self.tenant, %id, %kind, "registered stream processor");
        Ok(())
    }

    /// Stop a processor and wait for its loop to finish. Returns `false` if it isn't registered.
    pub async fn stop(&self, id: &StreamProcessorId) -> bool {
        let task = {
            let mut processors = self.processors.write();
            let Some(registered) = processors.get_mut(id) else {
                return false;
            };
            registered.handle.stop();
            registered.task.take()
        };
        if let Some(task) = task {
            if let Err(error) = task.await {
                error!(%id, %error, "stream processor task failed");
            }
        }
        info!(tenant = %self.tenant, %id, "stopped stream processor");
        true
    }

    pub fn is_running(&self, id: &StreamProcessorId) -> bool {
        self.processors
            .read()
            .get(id)
            .is_some_and(|registered| registered.is_running())
    }

    pub fn is_registered(&self, id: &StreamProcessorId) -> bool {
        self.processors.read().contains_key(id)
    }

    /// Ids of all registered processors, running or not
    pub fn registered(&self) -> Vec<StreamProcessorId> {
        let mut ids: Vec<_> = self.processors.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// The handle of a running processor
    pub(crate) fn running_handle(&self, id: &StreamProcessorId) -> Option<ProcessorHandle> {
        self.processors
            .read()
            .get(id)
            .filter(|registered| registered.is_running())
            .map(|registered| registered.handle.clone())
    }

    /// The last persisted state of a processor, registered or not
    pub async fn current_state(
        &self,
        id: &StreamProcessorId,
    ) -> Result<Option<StreamProcessorState>, ProcessorError> {
        Ok(self.store.get(id).await?)
    }

    /// Status of every registered processor
    pub async fn list(&self) -> Result<Vec<ProcessorStatus>, ProcessorError> {
        let registered: Vec<_> = self
            .processors
            .read()
            .values()
            .map(|registered| (Arc::clone(&registered.processor), registered.is_running()))
            .collect();

        let mut statuses = Vec::with_capacity(registered.len());
        for (processor, running) in registered {
            statuses.push(ProcessorStatus {
                id: processor.id(),
                kind: processor.kind(),
                running,
                state: processor.current_state().await?,
            });
        }
        statuses.sort_by_key(|status| status.id);
        Ok(statuses)
    }

    /// Stop every processor and wait for their loops to finish
    pub async fn shutdown(&self) {
        info!(tenant = %self.tenant, "shutting down stream processors");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Run a processing loop until it is cancelled, restarting it after errors.
///
/// While waiting to restart, position overrides are applied to the store directly since no loop
/// owns the state.
async fn run_processor(
    processor: Arc<dyn StreamProcessor>,
    mut control: ProcessorControl,
    store: Arc<dyn StreamProcessorStateStore>,
    time_provider: Arc<dyn TimeProvider>,
    restart_delay: Duration,
) {
    let id = processor.id();
    loop {
        match processor.start(&mut control).await {
            Ok(()) => break,
            Err(error @ ProcessorError::KindMismatch { .. }) => {
                error!(%id, %error, "stream processor cannot run on its stored state");
                break;
            }
            Err(error) => {
                error!(%id, %error, ?restart_delay, "stream processor failed, restarting");
            }
        }

        let mut restart = time_provider.sleep(restart_delay);
        loop {
            match control.suspend(&mut restart).await {
                Wake::Cancelled => return,
                Wake::Ready => break,
                Wake::PositionOverride(command) => {
                    let state = StreamProcessorState::initial(processor.kind())
                        .reset_to(command.position());
                    if !command.apply(store.as_ref(), &id, state).await {
                        warn!(%id, "position override not applied while waiting to restart");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use eventstream_types::{
        ConsumerId, PartitionedProcessorState, ScopeId, StreamId, StreamPosition,
        UnpartitionedProcessorState,
    };
    use iox_time::SystemProvider;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_helpers::{FlakyStateStore, TestSetup, wait_for_state};

    fn host(setup: &TestSetup) -> StreamProcessors {
        StreamProcessors::new(
            TenantId::new(),
            Arc::clone(&setup.log) as _,
            Arc::clone(&setup.store) as _,
            Arc::clone(&setup.time_provider) as _,
            StreamProcessorsConfig::default(),
        )
    }

    #[test_log::test(tokio::test)]
    async fn register_creates_initial_state_and_runs() {
        let setup = TestSetup::new();
        let host = host(&setup);
        host.register(setup.id, ProcessorKind::Partitioned, Arc::clone(&setup.invoker) as _)
            .await
            .unwrap();
        assert!(host.is_running(&setup.id));
        assert!(setup.store.has_state(&setup.id).await.unwrap());

        setup.append(&["a", "b", "a"]);
        setup
            .wait_for_state(|state| state.position() == StreamPosition::new(3))
            .await;

        let statuses = host.list().await.unwrap();
        assert_eq!(
            statuses,
            [ProcessorStatus {
                id: setup.id,
                kind: ProcessorKind::Partitioned,
                running: true,
                state: PartitionedProcessorState::new(StreamPosition::new(3)).into(),
            }]
        );
        host.shutdown().await;
        assert!(!host.is_running(&setup.id));
    }

    #[test_log::test(tokio::test)]
    async fn running_processor_cannot_be_registered_twice() {
        let setup = TestSetup::new();
        let host = host(&setup);
        host.register(setup.id, ProcessorKind::Unpartitioned, Arc::clone(&setup.invoker) as _)
            .await
            .unwrap();
        let error = host
            .register(setup.id, ProcessorKind::Unpartitioned, Arc::clone(&setup.invoker) as _)
            .await
            .unwrap_err();
        assert!(matches!(error, RegistrationError::AlreadyRegistered(id) if id == setup.id));

        // once stopped it may be registered again, and carries on from its persisted state
        setup.append(&["a"]);
        setup
            .wait_for_state(|state| state.position() == StreamPosition::new(1))
            .await;
        assert!(host.stop(&setup.id).await);
        assert!(!host.is_running(&setup.id));
        assert!(host.is_registered(&setup.id));
        setup.append(&["a"]);
        host.register(setup.id, ProcessorKind::Unpartitioned, Arc::clone(&setup.invoker) as _)
            .await
            .unwrap();
        setup
            .wait_for_state(|state| state.position() == StreamPosition::new(2))
            .await;
        assert_eq!(setup.invoker.invocations().len(), 2);
        host.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn registration_checks_stored_kind() {
        let setup = TestSetup::new();
        setup
            .store
            .persist(&setup.id, &UnpartitionedProcessorState::new(StreamPosition::new(4)).into())
            .await
            .unwrap();
        let host = host(&setup);
        let error = host
            .register(setup.id, ProcessorKind::Partitioned, Arc::clone(&setup.invoker) as _)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            RegistrationError::Processor(ProcessorError::KindMismatch { .. })
        ));
        assert!(!host.is_registered(&setup.id));
    }

    #[test_log::test(tokio::test)]
    async fn no_registration_after_shutdown() {
        let setup = TestSetup::new();
        let host = host(&setup);
        host.shutdown().await;
        assert!(matches!(
            host.register(setup.id, ProcessorKind::Partitioned, Arc::clone(&setup.invoker) as _)
                .await,
            Err(RegistrationError::ShuttingDown)
        ));
        assert!(!host.stop(&setup.id).await);
    }

    #[test_log::test(tokio::test)]
    async fn loop_is_restarted_after_store_errors() {
        let setup = TestSetup::new();
        let store = Arc::new(FlakyStateStore::new(0));
        let id = StreamProcessorId::new(ScopeId::DEFAULT, StreamId::new(), ConsumerId::new());
        let host = StreamProcessors::new(
            TenantId::new(),
            Arc::clone(&setup.log) as _,
            Arc::clone(&store) as _,
            Arc::new(SystemProvider::new()),
            StreamProcessorsConfig {
                restart_delay: Duration::from_millis(10),
            },
        );
        host.register(id, ProcessorKind::Unpartitioned, Arc::clone(&setup.invoker) as _)
            .await
            .unwrap();

        // the next two persists fail, each ending the loop after delivering the event
        store.fail_next(2);
        setup.log.append_all(
            id.scope,
            id.source_stream,
            ["a", "b"]
                .into_iter()
                .map(|p| eventstream_source::UncommittedEvent::new(p, "thing_happened", "{}")),
        );
        wait_for_state(store.as_ref(), &id, |state| {
            state.position() == StreamPosition::new(2)
        })
        .await;
        assert_eq!(store.remaining_failures(), 0);
        assert!(host.is_running(&id));

        // the event whose outcome was lost is delivered again
        let positions: Vec<_> = setup
            .invoker
            .invocations()
            .iter()
            .map(|invocation| invocation.position.as_u64())
            .collect();
        assert_eq!(positions, [0, 0, 0, 1]);
        host.shutdown().await;
    }
}
