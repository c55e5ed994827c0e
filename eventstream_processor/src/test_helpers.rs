use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eventstream_source::{InMemoryEventLog, UncommittedEvent};
use eventstream_types::{
    ConsumerId, PartitionId, ProcessingResult, RetryContext, ScopeId, StreamEvent, StreamId,
    StreamPosition, StreamProcessorId, StreamProcessorState,
};
use hashbrown::HashMap;
use iox_time::{MockProvider, Time, TimeProvider};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::ProcessingInvoker;
use crate::state_store::{
    InMemoryStateStore, Result as StateStoreResult, StateStoreError, StreamProcessorStateStore,
};

/// A delivery seen by a [`ScriptedInvoker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Invocation {
    pub(crate) position: StreamPosition,
    pub(crate) partition: Option<PartitionId>,
    pub(crate) retry: Option<RetryContext>,
}

/// Records every delivery and answers with scripted results, per event partition. Events of a
/// partition without scripted results succeed.
#[derive(Debug, Default)]
pub(crate) struct ScriptedInvoker {
    results: Mutex<HashMap<PartitionId, VecDeque<ProcessingResult>>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedInvoker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push(&self, partition: &str, result: ProcessingResult) {
        self.results
            .lock()
            .entry(PartitionId::from(partition))
            .or_default()
            .push_back(result);
    }

    pub(crate) fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    /// Positions delivered to `partition`, in delivery order
    pub(crate) fn positions_in(&self, partition: &str) -> Vec<u64> {
        let partition = PartitionId::from(partition);
        self.invocations
            .lock()
            .iter()
            .filter(|invocation| invocation.partition.as_ref() == Some(&partition))
            .map(|invocation| invocation.position.as_u64())
            .collect()
    }

    pub(crate) async fn wait_for_invocations(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.invocations.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for invocations");
    }
}

#[async_trait]
impl ProcessingInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        event: &StreamEvent,
        partition: Option<&PartitionId>,
        retry: Option<&RetryContext>,
        _cancellation: &CancellationToken,
    ) -> ProcessingResult {
        self.invocations.lock().push(Invocation {
            position: event.position,
            partition: partition.cloned(),
            retry: retry.cloned(),
        });
        self.results
            .lock()
            .get_mut(&event.partition)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ProcessingResult::Success)
    }
}

/// Holds on to every delivery until the processor is cancelled, then reports success
#[derive(Debug, Default)]
pub(crate) struct BlockingInvoker {
    delivered: Mutex<Vec<StreamPosition>>,
}

impl BlockingInvoker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn delivered(&self) -> Vec<StreamPosition> {
        self.delivered.lock().clone()
    }

    pub(crate) async fn wait_for_delivery(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.delivered.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for a delivery");
    }
}

#[async_trait]
impl ProcessingInvoker for BlockingInvoker {
    async fn invoke(
        &self,
        event: &StreamEvent,
        _partition: Option<&PartitionId>,
        _retry: Option<&RetryContext>,
        cancellation: &CancellationToken,
    ) -> ProcessingResult {
        self.delivered.lock().push(event.position);
        cancellation.cancelled().await;
        ProcessingResult::Success
    }
}

/// A state store whose first `failures` persists fail
#[derive(Debug)]
pub(crate) struct FlakyStateStore {
    inner: InMemoryStateStore,
    failures: AtomicUsize,
}

impl FlakyStateStore {
    pub(crate) fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryStateStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }

    /// Fail the next `failures` persists
    pub(crate) fn fail_next(&self, failures: usize) {
        self.failures.store(failures, Ordering::SeqCst);
    }

    pub(crate) fn remaining_failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamProcessorStateStore for FlakyStateStore {
    async fn get(&self, id: &StreamProcessorId) -> StateStoreResult<Option<StreamProcessorState>> {
        self.inner.get(id).await
    }

    async fn persist(
        &self,
        id: &StreamProcessorId,
        state: &StreamProcessorState,
    ) -> StateStoreResult<()> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StateStoreError::Unavailable("injected failure".to_string()));
        }
        self.inner.persist(id, state).await
    }

    async fn list(&self) -> StateStoreResult<Vec<(StreamProcessorId, StreamProcessorState)>> {
        self.inner.list().await
    }
}

/// Everything a processing loop under test needs
#[derive(Debug)]
pub(crate) struct TestSetup {
    pub(crate) id: StreamProcessorId,
    pub(crate) time_provider: Arc<MockProvider>,
    pub(crate) log: Arc<InMemoryEventLog>,
    pub(crate) store: Arc<InMemoryStateStore>,
    pub(crate) invoker: Arc<ScriptedInvoker>,
}

impl TestSetup {
    pub(crate) fn new() -> Self {
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        Self {
            id: StreamProcessorId::new(ScopeId::DEFAULT, StreamId::new(), ConsumerId::new()),
            log: Arc::new(InMemoryEventLog::new(
                Arc::clone(&time_provider) as Arc<dyn TimeProvider>
            )),
            time_provider,
            store: Arc::new(InMemoryStateStore::new()),
            invoker: ScriptedInvoker::new(),
        }
    }

    /// Append one event per entry of `partitions`, each in the named partition
    pub(crate) fn append(&self, partitions: &[&str]) {
        self.log.append_all(
            self.id.scope,
            self.id.source_stream,
            partitions
                .iter()
                .map(|partition| UncommittedEvent::new(*partition, "thing_happened", "{}")),
        );
    }

    pub(crate) async fn wait_for_state(
        &self,
        predicate: impl Fn(&StreamProcessorState) -> bool + Send,
    ) -> StreamProcessorState {
        wait_for_state(self.store.as_ref(), &self.id, predicate).await
    }
}

/// Poll `store` until the state of `id` matches `predicate`
pub(crate) async fn wait_for_state(
    store: &dyn StreamProcessorStateStore,
    id: &StreamProcessorId,
    predicate: impl Fn(&StreamProcessorState) -> bool + Send,
) -> StreamProcessorState {
    tokio::time::timeout(Duration::from_secs(5), async move {
        loop {
            if let Some(state) = store.get(id).await.unwrap() {
                if predicate(&state) {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for stream processor state")
}
