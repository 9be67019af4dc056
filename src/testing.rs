//! Test support: event builders, a scripted peer and a call-recording
//! transaction manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterInfo, ClusterMetadata};
use crate::error::{Error, Result};
use crate::fetcher::{AdminClient, ClientBean, GetRawHistoryRequest, HistoryPaginatedFetcher, RawHistoryPage};
use crate::history::{
    EventAttributes, EventBatch, EventId, HistoryEvent, UpdateMode, Version, VersionHistory,
    VersionHistoryItem,
};
use crate::id::RunKey;
use crate::lease::{LeaseManager, LeasePriority};
use crate::ndc::{Archetype, HistoryReplicator, TransactionManager, TransactionManagerImpl, Workflow};
use crate::persistence::InMemoryStore;
use crate::replication::ReplicationTask;

pub fn batch(events: Vec<HistoryEvent>) -> EventBatch {
    EventBatch::new(events).unwrap()
}

pub fn started(event_id: EventId, version: Version) -> HistoryEvent {
    HistoryEvent::new(
        event_id,
        version,
        EventAttributes::WorkflowExecutionStarted {
            workflow_type: "order-fulfillment".into(),
            task_queue: "orders".into(),
        },
    )
}

pub fn task_scheduled(event_id: EventId, version: Version) -> HistoryEvent {
    HistoryEvent::new(
        event_id,
        version,
        EventAttributes::WorkflowTaskScheduled {
            task_queue: "orders".into(),
            attempt: 1,
        },
    )
}

pub fn task_started(event_id: EventId, version: Version) -> HistoryEvent {
    HistoryEvent::new(
        event_id,
        version,
        EventAttributes::WorkflowTaskStarted {
            scheduled_event_id: event_id - 1,
            identity: "worker-1".into(),
        },
    )
}

pub fn task_completed(event_id: EventId, version: Version) -> HistoryEvent {
    HistoryEvent::new(
        event_id,
        version,
        EventAttributes::WorkflowTaskCompleted {
            scheduled_event_id: event_id - 2,
            started_event_id: event_id - 1,
        },
    )
}

pub fn timer_started(event_id: EventId, version: Version, timer_id: &str) -> HistoryEvent {
    HistoryEvent::new(
        event_id,
        version,
        EventAttributes::TimerStarted {
            timer_id: timer_id.into(),
            fire_after_secs: 60,
        },
    )
}

pub fn timer_fired(event_id: EventId, version: Version, timer_id: &str, started_event_id: EventId) -> HistoryEvent {
    HistoryEvent::new(
        event_id,
        version,
        EventAttributes::TimerFired {
            timer_id: timer_id.into(),
            started_event_id,
        },
    )
}

pub fn completed(event_id: EventId, version: Version) -> HistoryEvent {
    HistoryEvent::new(event_id, version, EventAttributes::WorkflowExecutionCompleted)
}

pub fn continued_as_new(event_id: EventId, version: Version, new_run_id: &str) -> HistoryEvent {
    HistoryEvent::new(
        event_id,
        version,
        EventAttributes::WorkflowExecutionContinuedAsNew {
            new_run_id: new_run_id.into(),
        },
    )
}

/// A short run written entirely under `version`, closing at event 5
pub fn run_batches(version: Version) -> Vec<EventBatch> {
    vec![
        batch(vec![started(1, version), task_scheduled(2, version)]),
        batch(vec![task_started(3, version)]),
        batch(vec![task_completed(4, version), completed(5, version)]),
    ]
}

/// A run written by cluster-a (v1), then cluster-b (v2), then cluster-a
/// again (v11). Event 10 starts a timer that is still pending at 12.
pub fn migration_back_forth_batches() -> (Vec<EventBatch>, Vec<VersionHistoryItem>) {
    let batches = vec![
        batch(vec![started(1, 1)]),
        batch(vec![task_scheduled(2, 1)]),
        batch(vec![task_started(3, 1)]),
        batch(vec![task_completed(4, 1), task_scheduled(5, 1)]),
        batch(vec![task_started(6, 2), task_completed(7, 2)]),
        batch(vec![timer_started(8, 2, "timer-0")]),
        batch(vec![timer_fired(9, 2, "timer-0", 8), timer_started(10, 2, "timer-1")]),
        batch(vec![task_scheduled(11, 11), task_started(12, 11)]),
    ];
    let lineage = vec![
        VersionHistoryItem::new(5, 1),
        VersionHistoryItem::new(10, 2),
        VersionHistoryItem::new(12, 11),
    ];
    (batches, lineage)
}

/// cluster-a owns versions ≡ 1, cluster-b (local) owns versions ≡ 2, mod 10
pub fn cluster_metadata() -> ClusterMetadata {
    ClusterMetadata::new(
        "cluster-b",
        10,
        vec![
            ClusterInfo {
                name: "cluster-a".into(),
                address: "127.0.0.1:7701".into(),
                initial_failover_version: 1,
            },
            ClusterInfo {
                name: "cluster-b".into(),
                address: "127.0.0.1:7702".into(),
                initial_failover_version: 2,
            },
        ],
    )
    .unwrap()
}

struct RemoteRun {
    batches: Vec<EventBatch>,
    lineage: Vec<VersionHistoryItem>,
}

/// Scripted peer serving raw history from memory
#[derive(Default)]
pub struct FakeAdminClient {
    runs: Mutex<HashMap<RunKey, RemoteRun>>,
    truncate_after: Mutex<Option<EventId>>,
    failures: Mutex<u32>,
    requests: Mutex<Vec<GetRawHistoryRequest>>,
}

impl FakeAdminClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: RunKey, batches: Vec<EventBatch>, lineage: Vec<VersionHistoryItem>) {
        self.runs
            .lock()
            .unwrap()
            .insert(key, RemoteRun { batches, lineage });
    }

    /// Pretend nothing after `event_id` exists
    pub fn truncate_after(&self, event_id: EventId) {
        *self.truncate_after.lock().unwrap() = Some(event_id);
    }

    /// Fail the next `count` requests as unavailable
    pub fn fail_next(&self, count: u32) {
        *self.failures.lock().unwrap() = count;
    }

    pub fn requests(&self) -> Vec<GetRawHistoryRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AdminClient for FakeAdminClient {
    async fn get_raw_history(&self, request: GetRawHistoryRequest) -> Result<RawHistoryPage> {
        self.requests.lock().unwrap().push(request.clone());
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Unavailable("scripted failure".into()));
            }
        }

        let limit = self
            .truncate_after
            .lock()
            .unwrap()
            .unwrap_or(EventId::MAX)
            .min(request.end_event_id);
        let runs = self.runs.lock().unwrap();
        let run = runs
            .get(&request.run_key)
            .ok_or_else(|| Error::NotFound(request.run_key.to_string()))?;

        let in_range: Vec<EventBatch> = run
            .batches
            .iter()
            .filter(|b| b.first_event_id() > request.start_event_id && b.last_event_id() <= limit)
            .cloned()
            .collect();
        let offset = match &request.next_page_token {
            Some(token) => bincode::deserialize::<usize>(token)?,
            None => 0,
        };
        let end = (offset + request.page_size).min(in_range.len());
        let next_page_token = if end < in_range.len() {
            Some(bincode::serialize(&end)?)
        } else {
            None
        };

        Ok(RawHistoryPage {
            batches: in_range[offset.min(end)..end].to_vec(),
            version_history: VersionHistory::new(Vec::new(), run.lineage.clone())?,
            next_page_token,
        })
    }
}

/// Delegating transaction manager that records which operations ran and
/// can report scripted errors
pub struct RecordingTransactionManager {
    inner: Arc<dyn TransactionManager>,
    calls: Mutex<Vec<String>>,
    scripted: Mutex<HashMap<&'static str, Error>>,
}

impl RecordingTransactionManager {
    pub fn new(inner: Arc<dyn TransactionManager>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            scripted: Mutex::new(HashMap::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    /// Let the next `call` go through, then report `error` instead of its
    /// result, as if another writer got there first
    pub fn fail_after_next(&self, call: &'static str, error: Error) {
        self.scripted.lock().unwrap().insert(call, error);
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn scripted(&self, call: &str, result: Result<()>) -> Result<()> {
        match self.scripted.lock().unwrap().remove(call) {
            Some(error) => Err(error),
            None => result,
        }
    }
}

#[async_trait]
impl TransactionManager for RecordingTransactionManager {
    async fn check_workflow_exists(&self, ctx: &CancellationToken, key: &RunKey) -> Result<bool> {
        self.record("check_workflow_exists");
        self.inner.check_workflow_exists(ctx, key).await
    }

    async fn get_current_workflow_run_id(
        &self,
        ctx: &CancellationToken,
        namespace_id: &str,
        workflow_id: &str,
    ) -> Result<Option<String>> {
        self.record("get_current_workflow_run_id");
        self.inner
            .get_current_workflow_run_id(ctx, namespace_id, workflow_id)
            .await
    }

    async fn load_workflow(
        &self,
        ctx: &CancellationToken,
        key: &RunKey,
        archetype: Archetype,
        priority: LeasePriority,
    ) -> Result<Workflow> {
        self.record("load_workflow");
        self.inner.load_workflow(ctx, key, archetype, priority).await
    }

    async fn create_workflow(&self, ctx: &CancellationToken, target: &mut Workflow) -> Result<()> {
        self.record("create_workflow");
        let result = self.inner.create_workflow(ctx, target).await;
        self.scripted("create_workflow", result)
    }

    async fn update_workflow(
        &self,
        ctx: &CancellationToken,
        mode: UpdateMode,
        target: &mut Workflow,
        new_workflow: Option<&mut Workflow>,
    ) -> Result<()> {
        self.record("update_workflow");
        let result = self.inner.update_workflow(ctx, mode, target, new_workflow).await;
        self.scripted("update_workflow", result)
    }

    async fn backfill_workflow(
        &self,
        ctx: &CancellationToken,
        target: &Workflow,
        branch_token: &[u8],
        batches: &[EventBatch],
    ) -> Result<()> {
        self.record("backfill_workflow");
        self.inner
            .backfill_workflow(ctx, target, branch_token, batches)
            .await
    }

    async fn fork_history(
        &self,
        ctx: &CancellationToken,
        target: &Workflow,
        fork_point: VersionHistoryItem,
    ) -> Result<Vec<u8>> {
        self.record("fork_history");
        self.inner.fork_history(ctx, target, fork_point).await
    }

    async fn rebuild_workflow(
        &self,
        ctx: &CancellationToken,
        target: &mut Workflow,
        branch_token: &[u8],
    ) -> Result<()> {
        self.record("rebuild_workflow");
        self.inner.rebuild_workflow(ctx, target, branch_token).await
    }

    async fn read_history(
        &self,
        ctx: &CancellationToken,
        target: &Workflow,
        min_event_id: EventId,
        max_event_id: EventId,
    ) -> Result<Vec<EventBatch>> {
        self.record("read_history");
        self.inner
            .read_history(ctx, target, min_event_id, max_event_id)
            .await
    }
}

/// A local cluster-b node wired to a scripted cluster-a peer
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub leases: LeaseManager,
    pub tm: Arc<RecordingTransactionManager>,
    pub admin: Arc<FakeAdminClient>,
    pub replicator: Arc<HistoryReplicator>,
    next_task_id: AtomicI64,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let leases = LeaseManager::new();
        let inner = Arc::new(TransactionManagerImpl::new(store.clone(), leases.clone()));
        let tm = Arc::new(RecordingTransactionManager::new(inner));

        let admin = Arc::new(FakeAdminClient::new());
        let clients = ClientBean::new();
        clients.register("cluster-a", admin.clone());
        let fetcher = HistoryPaginatedFetcher::new(Arc::new(clients), 3);

        let replicator = Arc::new(HistoryReplicator::new(
            "cluster-b",
            tm.clone(),
            fetcher,
            Arc::new(cluster_metadata()),
        ));

        Self {
            store,
            leases,
            tm,
            admin,
            replicator,
            next_task_id: AtomicI64::new(1),
        }
    }

    pub fn task(
        &self,
        run_key: RunKey,
        events: EventBatch,
        version_history_items: Vec<VersionHistoryItem>,
    ) -> ReplicationTask {
        ReplicationTask {
            task_id: self.next_task_id.fetch_add(1, Ordering::Relaxed),
            source_cluster: "cluster-a".into(),
            run_key,
            events,
            new_run_events: None,
            version_history_items,
        }
    }
}
