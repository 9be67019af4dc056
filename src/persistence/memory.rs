//! In-memory execution store

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    batches_to_append, slice_batches, ExecutionRecord, ExecutionStore, ExecutionWrite,
    UpdateExecution,
};
use crate::error::{Error, Result};
use crate::history::{EventBatch, EventId};
use crate::id::{new_branch_token, RunKey};

type BranchKey = (RunKey, Vec<u8>);

struct CurrentRun {
    run_id: String,
    start_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    executions: HashMap<RunKey, ExecutionRecord>,
    current_runs: HashMap<(String, String), CurrentRun>,
    /// Batches keyed by first event ID
    branches: HashMap<BranchKey, BTreeMap<EventId, EventBatch>>,
}

impl Inner {
    /// Batches of `write` that are not yet on its branch
    fn pending_batches<'a>(&self, write: &'a ExecutionWrite) -> Result<Vec<&'a EventBatch>> {
        let token = write.state.current_branch_token();
        let branch = self.branches.get(&(write.key().clone(), token.to_vec()));
        let last = branch
            .and_then(|b| b.values().next_back())
            .map(|b| b.last_event_id())
            .unwrap_or(0);
        batches_to_append(token, last, &write.new_batches, |first| {
            Ok(branch.and_then(|b| b.get(&first)).cloned())
        })
    }

    fn write_batches(&mut self, key: &RunKey, token: &[u8], batches: Vec<&EventBatch>) {
        let branch = self.branches.entry((key.clone(), token.to_vec())).or_default();
        for batch in batches {
            branch.insert(batch.first_event_id(), batch.clone());
        }
    }

    fn insert_record(&mut self, write: &ExecutionWrite) {
        let key = write.key().clone();
        let start_time = write.state.start_time;
        let newer = match self
            .current_runs
            .get(&(key.namespace_id.clone(), key.workflow_id.clone()))
        {
            Some(current) => start_time >= current.start_time,
            None => true,
        };
        if newer {
            self.current_runs.insert(
                (key.namespace_id.clone(), key.workflow_id.clone()),
                CurrentRun {
                    run_id: key.run_id.clone(),
                    start_time,
                },
            );
        }
        self.executions.insert(
            key,
            ExecutionRecord {
                state: write.state.clone(),
                db_version: 1,
                rebuild_count: 0,
            },
        );
    }
}

/// Execution store held entirely in memory
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted runs
    pub async fn execution_count(&self) -> usize {
        self.inner.read().await.executions.len()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn get_execution(&self, key: &RunKey) -> Result<Option<ExecutionRecord>> {
        Ok(self.inner.read().await.executions.get(key).cloned())
    }

    async fn get_current_run_id(
        &self,
        namespace_id: &str,
        workflow_id: &str,
    ) -> Result<Option<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .current_runs
            .get(&(namespace_id.to_string(), workflow_id.to_string()))
            .map(|c| c.run_id.clone()))
    }

    async fn create_execution(&self, write: ExecutionWrite) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.executions.contains_key(write.key()) {
            return Err(Error::AlreadyExists(write.key().to_string()));
        }
        let pending = inner.pending_batches(&write)?;
        inner.write_batches(write.key(), write.state.current_branch_token(), pending);
        inner.insert_record(&write);
        Ok(())
    }

    async fn update_execution(&self, update: UpdateExecution) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = update.write.key().clone();

        let record = inner
            .executions
            .get(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if record.db_version != update.expected_db_version {
            return Err(Error::ConditionFailed(format!(
                "{} is at db version {}, expected {}",
                key, record.db_version, update.expected_db_version
            )));
        }
        let db_version = record.db_version;
        let rebuild_count = record.rebuild_count;

        let pending = inner.pending_batches(&update.write)?;
        let new_run_pending = match &update.new_run {
            Some(new_run) => {
                if inner.executions.contains_key(new_run.key()) {
                    return Err(Error::AlreadyExists(new_run.key().to_string()));
                }
                Some(inner.pending_batches(new_run)?)
            }
            None => None,
        };

        inner.write_batches(&key, update.write.state.current_branch_token(), pending);
        inner.executions.insert(
            key,
            ExecutionRecord {
                state: update.write.state.clone(),
                db_version: db_version + 1,
                rebuild_count: rebuild_count + u64::from(update.mode.is_rebuilt()),
            },
        );

        if let (Some(new_run), Some(pending)) = (&update.new_run, new_run_pending) {
            inner.write_batches(new_run.key(), new_run.state.current_branch_token(), pending);
            inner.insert_record(new_run);
        }
        Ok(())
    }

    async fn append_history(
        &self,
        key: &RunKey,
        branch_token: &[u8],
        batches: &[EventBatch],
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let branch = inner.branches.get(&(key.clone(), branch_token.to_vec()));
        let last = branch
            .and_then(|b| b.values().next_back())
            .map(|b| b.last_event_id())
            .unwrap_or(0);
        let pending = batches_to_append(branch_token, last, batches, |first| {
            Ok(branch.and_then(|b| b.get(&first)).cloned())
        })?;
        inner.write_batches(key, branch_token, pending);
        Ok(())
    }

    async fn read_history(
        &self,
        key: &RunKey,
        branch_token: &[u8],
        min_event_id: EventId,
        max_event_id: EventId,
    ) -> Result<Vec<EventBatch>> {
        let inner = self.inner.read().await;
        let batches = inner
            .branches
            .get(&(key.clone(), branch_token.to_vec()))
            .map(|b| b.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(slice_batches(batches, min_event_id, max_event_id))
    }

    async fn fork_branch(
        &self,
        key: &RunKey,
        base_branch: &[u8],
        fork_event_id: EventId,
    ) -> Result<Vec<u8>> {
        let mut inner = self.inner.write().await;
        let base = inner
            .branches
            .get(&(key.clone(), base_branch.to_vec()))
            .ok_or_else(|| Error::NotFound(format!("history branch of {}", key)))?;

        let copied = slice_batches(base.values().cloned(), 1, fork_event_id);
        if copied.last().map(|b| b.last_event_id()) != Some(fork_event_id) {
            return Err(Error::InvalidSequence(format!(
                "branch of {} does not reach fork point {}",
                key, fork_event_id
            )));
        }

        let token = new_branch_token();
        let forked = copied.into_iter().map(|b| (b.first_event_id(), b)).collect();
        inner.branches.insert((key.clone(), token.clone()), forked);
        Ok(token)
    }
}
