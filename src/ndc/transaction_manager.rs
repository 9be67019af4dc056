//! Transaction Manager
//!
//! Facade over the execution store and the lease manager. Loads return a
//! leased [`Workflow`]; commits write its state and pending batches
//! conditionally on the db_version it was loaded at.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::workflow::Workflow;
use crate::context::cancellable;
use crate::error::{Error, Result};
use crate::history::{EventBatch, EventId, UpdateMode, VersionHistories, VersionHistoryItem};
use crate::id::{new_branch_token, RunKey};
use crate::lease::{LeaseManager, LeasePriority};
use crate::persistence::{ExecutionStore, ExecutionWrite, UpdateExecution};
use crate::state::MutableState;

/// Kind of execution a load is for. Passed through to logging and the
/// lease request, not interpreted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Archetype {
    Workflow,
    Any,
}

impl std::fmt::Display for Archetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Archetype::Workflow => write!(f, "workflow"),
            Archetype::Any => write!(f, "any"),
        }
    }
}

/// Run-level persistence operations used by the replicator
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Whether a record exists for the run
    async fn check_workflow_exists(&self, ctx: &CancellationToken, key: &RunKey) -> Result<bool>;

    /// Run ID of the workflow's current run
    async fn get_current_workflow_run_id(
        &self,
        ctx: &CancellationToken,
        namespace_id: &str,
        workflow_id: &str,
    ) -> Result<Option<String>>;

    /// Acquire the run's lease, then load it. A run without a record
    /// loads as empty, unpersisted state.
    async fn load_workflow(
        &self,
        ctx: &CancellationToken,
        key: &RunKey,
        archetype: Archetype,
        priority: LeasePriority,
    ) -> Result<Workflow>;

    /// Persist a new run
    async fn create_workflow(&self, ctx: &CancellationToken, target: &mut Workflow) -> Result<()>;

    /// Commit a loaded run and, atomically, create the run it continued as
    async fn update_workflow(
        &self,
        ctx: &CancellationToken,
        mode: UpdateMode,
        target: &mut Workflow,
        new_workflow: Option<&mut Workflow>,
    ) -> Result<()>;

    /// Write fetched batches to one of the run's branches
    async fn backfill_workflow(
        &self,
        ctx: &CancellationToken,
        target: &Workflow,
        branch_token: &[u8],
        batches: &[EventBatch],
    ) -> Result<()>;

    /// Create a branch sharing the current lineage up to `fork_point`
    async fn fork_history(
        &self,
        ctx: &CancellationToken,
        target: &Workflow,
        fork_point: VersionHistoryItem,
    ) -> Result<Vec<u8>>;

    /// Replace the run's state by replaying `branch_token` from genesis,
    /// making that branch current
    async fn rebuild_workflow(
        &self,
        ctx: &CancellationToken,
        target: &mut Workflow,
        branch_token: &[u8],
    ) -> Result<()>;

    /// Persisted events of the current branch in `[min_event_id, max_event_id]`
    async fn read_history(
        &self,
        ctx: &CancellationToken,
        target: &Workflow,
        min_event_id: EventId,
        max_event_id: EventId,
    ) -> Result<Vec<EventBatch>>;
}

/// Transaction manager over an [`ExecutionStore`]
pub struct TransactionManagerImpl {
    store: Arc<dyn ExecutionStore>,
    leases: LeaseManager,
}

impl TransactionManagerImpl {
    pub fn new(store: Arc<dyn ExecutionStore>, leases: LeaseManager) -> Self {
        Self { store, leases }
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }
}

fn pending_write(workflow: &Workflow) -> ExecutionWrite {
    ExecutionWrite {
        state: workflow.mutable_state().clone(),
        new_batches: workflow.new_batches().to_vec(),
    }
}

#[async_trait]
impl TransactionManager for TransactionManagerImpl {
    async fn check_workflow_exists(&self, ctx: &CancellationToken, key: &RunKey) -> Result<bool> {
        let record = cancellable(ctx, self.store.get_execution(key)).await?;
        Ok(record.is_some())
    }

    async fn get_current_workflow_run_id(
        &self,
        ctx: &CancellationToken,
        namespace_id: &str,
        workflow_id: &str,
    ) -> Result<Option<String>> {
        cancellable(ctx, self.store.get_current_run_id(namespace_id, workflow_id)).await
    }

    async fn load_workflow(
        &self,
        ctx: &CancellationToken,
        key: &RunKey,
        archetype: Archetype,
        priority: LeasePriority,
    ) -> Result<Workflow> {
        let lease = self.leases.acquire(ctx, key, priority).await?;

        match cancellable(ctx, self.store.get_execution(key)).await {
            Ok(Some(record)) => {
                tracing::debug!(
                    "Loaded {} {} at db version {}",
                    archetype,
                    key,
                    record.db_version
                );
                Ok(Workflow::new(record.state, Some(record.db_version), lease))
            }
            Ok(None) => {
                tracing::debug!("No record for {} {}, starting empty", archetype, key);
                let state = MutableState::new(key.clone(), new_branch_token());
                Ok(Workflow::new(state, None, lease))
            }
            Err(e) => {
                lease.release(Some(&e));
                Err(e)
            }
        }
    }

    async fn create_workflow(&self, ctx: &CancellationToken, target: &mut Workflow) -> Result<()> {
        if target.is_persisted() {
            return Err(Error::AlreadyExists(target.run_key().to_string()));
        }

        cancellable(ctx, self.store.create_execution(pending_write(target))).await?;
        target.committed(1);
        tracing::info!(
            "Created {} with {} events",
            target.run_key(),
            target.mutable_state().history_length()
        );
        Ok(())
    }

    async fn update_workflow(
        &self,
        ctx: &CancellationToken,
        mode: UpdateMode,
        target: &mut Workflow,
        new_workflow: Option<&mut Workflow>,
    ) -> Result<()> {
        let expected_db_version = target.db_version().ok_or_else(|| {
            Error::Internal(format!("cannot update unpersisted run {}", target.run_key()))
        })?;

        let new_run = match &new_workflow {
            Some(new_workflow) if new_workflow.is_persisted() => {
                return Err(Error::AlreadyExists(new_workflow.run_key().to_string()))
            }
            Some(new_workflow) => Some(pending_write(new_workflow)),
            None => None,
        };

        let update = UpdateExecution {
            write: pending_write(target),
            expected_db_version,
            mode,
            new_run,
        };
        cancellable(ctx, self.store.update_execution(update)).await?;

        target.committed(expected_db_version + 1);
        if let Some(new_workflow) = new_workflow {
            new_workflow.committed(1);
            tracing::info!("Created {} continued from {}", new_workflow.run_key(), target.run_key());
        }

        match mode {
            UpdateMode::Rebuilt { lca } => tracing::info!(
                "Committed rebuilt state of {} (fork point {})",
                target.run_key(),
                lca
            ),
            UpdateMode::Incremental => tracing::debug!(
                "Committed {} through event {}",
                target.run_key(),
                target.mutable_state().next_event_id - 1
            ),
        }
        Ok(())
    }

    async fn backfill_workflow(
        &self,
        ctx: &CancellationToken,
        target: &Workflow,
        branch_token: &[u8],
        batches: &[EventBatch],
    ) -> Result<()> {
        if batches.is_empty() {
            return Ok(());
        }
        cancellable(
            ctx,
            self.store.append_history(target.run_key(), branch_token, batches),
        )
        .await
    }

    async fn fork_history(
        &self,
        ctx: &CancellationToken,
        target: &Workflow,
        fork_point: VersionHistoryItem,
    ) -> Result<Vec<u8>> {
        let state = target.mutable_state();
        if !state.version_histories.current().contains_item(fork_point) {
            return Err(Error::InvalidSequence(format!(
                "fork point {} is not on the current lineage of {}",
                fork_point,
                target.run_key()
            )));
        }
        cancellable(
            ctx,
            self.store.fork_branch(
                target.run_key(),
                state.current_branch_token(),
                fork_point.event_id,
            ),
        )
        .await
    }

    async fn rebuild_workflow(
        &self,
        ctx: &CancellationToken,
        target: &mut Workflow,
        branch_token: &[u8],
    ) -> Result<()> {
        let key = target.run_key().clone();
        let batches = cancellable(
            ctx,
            self.store.read_history(&key, branch_token, 1, EventId::MAX),
        )
        .await?;
        let mut rebuilt = MutableState::replay(key, branch_token.to_vec(), batches)?;

        let mut histories = VersionHistories::new(rebuilt.version_histories.current().clone());
        for history in target.mutable_state().version_histories.histories() {
            if !history.is_empty() && history.branch_token != branch_token {
                histories.add_history(history.clone());
            }
        }
        rebuilt.version_histories = histories;

        tracing::info!(
            "Rebuilt {} from {} events",
            target.run_key(),
            rebuilt.history_length()
        );
        target.replace_state(rebuilt);
        Ok(())
    }

    async fn read_history(
        &self,
        ctx: &CancellationToken,
        target: &Workflow,
        min_event_id: EventId,
        max_event_id: EventId,
    ) -> Result<Vec<EventBatch>> {
        let state = target.mutable_state();
        cancellable(
            ctx,
            self.store.read_history(
                target.run_key(),
                state.current_branch_token(),
                min_event_id,
                max_event_id,
            ),
        )
        .await
    }
}
