//! History Replicator
//!
//! Applies one replicated batch to the local copy of its run:
//!
//! 1. Load the run under a high-priority lease.
//! 2. Classify the batch against the run's lineages.
//! 3. Fetch and backfill whatever is missing from a peer.
//! 4. Apply the batch, rebuilding state first if the lineage switched.
//! 5. Commit, together with the run it continued as, if any.
//!
//! The lease is released on every path with the outcome of the attempt.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::backfill::BackfillPlan;
use super::transaction_manager::{Archetype, TransactionManager};
use super::workflow::Workflow;
use crate::cluster::ClusterResolver;
use crate::error::{Error, Result};
use crate::fetcher::HistoryPaginatedFetcher;
use crate::history::{
    Classification, EventBatch, UpdateMode, VersionHistoryItem, EMPTY_EVENT_ID, EMPTY_VERSION,
};
use crate::lease::LeasePriority;
use crate::replication::ReplicationTask;

/// Result of applying one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The run was persisted for the first time
    Created,
    /// The run was committed
    Updated(UpdateMode),
    /// Everything in the task was already present
    Duplicate,
    /// The incoming lineage lost to the current one and was stored beside it
    NonCurrentBranch,
}

/// Applies replication tasks to local runs
pub struct HistoryReplicator {
    local_cluster: String,
    transaction_manager: Arc<dyn TransactionManager>,
    fetcher: HistoryPaginatedFetcher,
    resolver: Arc<dyn ClusterResolver>,
}

impl HistoryReplicator {
    pub fn new(
        local_cluster: impl Into<String>,
        transaction_manager: Arc<dyn TransactionManager>,
        fetcher: HistoryPaginatedFetcher,
        resolver: Arc<dyn ClusterResolver>,
    ) -> Self {
        Self {
            local_cluster: local_cluster.into(),
            transaction_manager,
            fetcher,
            resolver,
        }
    }

    /// Apply a task. A concurrent creation of the run (or of the run it
    /// continued as) is resolved by reloading and classifying once more.
    pub async fn apply(&self, ctx: &CancellationToken, task: &ReplicationTask) -> Result<ApplyOutcome> {
        task.validate()?;
        let plan = BackfillPlan::new(task, &self.local_cluster, self.resolver.as_ref())?;

        match self.apply_once(ctx, task, &plan).await {
            Err(Error::AlreadyExists(what)) => {
                tracing::debug!("{} was created concurrently, reloading", what);
                self.apply_once(ctx, task, &plan).await
            }
            result => result,
        }
    }

    async fn apply_once(
        &self,
        ctx: &CancellationToken,
        task: &ReplicationTask,
        plan: &BackfillPlan,
    ) -> Result<ApplyOutcome> {
        let mut workflow = self
            .transaction_manager
            .load_workflow(ctx, &task.run_key, Archetype::Workflow, LeasePriority::High)
            .await?;

        let result = self.apply_loaded(ctx, task, plan, &mut workflow).await;
        workflow.release(result.as_ref().err());
        result
    }

    async fn apply_loaded(
        &self,
        ctx: &CancellationToken,
        task: &ReplicationTask,
        plan: &BackfillPlan,
        workflow: &mut Workflow,
    ) -> Result<ApplyOutcome> {
        let classification = workflow.mutable_state().version_histories.classify(
            &plan.incoming,
            task.events.first_event_id(),
            task.events.last_item(),
        )?;
        tracing::debug!(
            "Task {} for {} events [{}, {}] classified as {:?}",
            task.task_id,
            task.run_key,
            task.events.first_event_id(),
            task.events.last_event_id(),
            classification
        );

        match classification {
            Classification::NewHistory => self.apply_new_history(ctx, task, plan, workflow).await,
            Classification::Duplicate => {
                self.ensure_new_run(ctx, task).await?;
                Ok(ApplyOutcome::Duplicate)
            }
            Classification::Continuation | Classification::Gap { .. } => {
                self.apply_incremental(ctx, task, plan, workflow).await
            }
            Classification::Fork { lca } => self.apply_fork(ctx, task, plan, workflow, lca).await,
        }
    }

    async fn apply_new_history(
        &self,
        ctx: &CancellationToken,
        task: &ReplicationTask,
        plan: &BackfillPlan,
        workflow: &mut Workflow,
    ) -> Result<ApplyOutcome> {
        let genesis = VersionHistoryItem::new(EMPTY_EVENT_ID, EMPTY_VERSION);
        if let Some(end) = plan.range_after(genesis) {
            self.backfill_current(ctx, task, plan, workflow, genesis, end).await?;
        }
        if !plan.covers_batch {
            workflow.apply_batch(task.events.clone())?;
        }

        if workflow.is_persisted() {
            self.commit(ctx, task, workflow, UpdateMode::Incremental).await
        } else {
            self.create(ctx, task, workflow).await
        }
    }

    async fn apply_incremental(
        &self,
        ctx: &CancellationToken,
        task: &ReplicationTask,
        plan: &BackfillPlan,
        workflow: &mut Workflow,
    ) -> Result<ApplyOutcome> {
        let tail = workflow
            .mutable_state()
            .version_histories
            .current()
            .last_item()
            .ok_or_else(|| Error::Internal(format!("{} lost its history tail", task.run_key)))?;

        if let Some(end) = plan.range_after(tail) {
            self.backfill_current(ctx, task, plan, workflow, tail, end).await?;
        }
        if !plan.covers_batch {
            workflow.apply_batch(task.events.clone())?;
        }
        self.commit(ctx, task, workflow, UpdateMode::Incremental).await
    }

    async fn apply_fork(
        &self,
        ctx: &CancellationToken,
        task: &ReplicationTask,
        plan: &BackfillPlan,
        workflow: &mut Workflow,
        lca: VersionHistoryItem,
    ) -> Result<ApplyOutcome> {
        // An incoming lineage that extends a stored non-current branch
        // continues on that branch instead of forking the current one again
        let histories = &workflow.mutable_state().version_histories;
        let (index, deepest) = histories.find_lca_index(&plan.incoming)?;
        let stored = if index != histories.current_index()
            && histories.get(index)?.last_item() == Some(deepest)
        {
            Some((index, histories.get(index)?.branch_token.clone()))
        } else {
            None
        };
        let base = if stored.is_some() { deepest } else { lca };

        if !plan.covers_batch && task.events.first_event_id() <= base.event_id {
            return Err(Error::InvalidSequence(format!(
                "batch at {} starts before fork point {} of {}",
                task.events.first_event_id(),
                base,
                task.run_key
            )));
        }

        let local_tail = workflow
            .mutable_state()
            .version_histories
            .current()
            .last_item()
            .ok_or_else(|| Error::Internal(format!("{} lost its history tail", task.run_key)))?;
        let incoming_tail = plan
            .incoming
            .last_item()
            .ok_or_else(|| Error::InvalidSequence("incoming lineage is empty".into()))?;

        tracing::info!(
            "{} forked at {}: local tail {}, incoming tail {}",
            task.run_key,
            lca,
            local_tail,
            incoming_tail
        );

        let branch = match &stored {
            Some((index, token)) => {
                tracing::debug!("{} extends stored branch {} at {}", task.run_key, index, base);
                token.clone()
            }
            None => self.transaction_manager.fork_history(ctx, workflow, lca).await?,
        };
        if let Some(end) = plan.range_after(base) {
            let batches = self.fetch(ctx, task, plan, base, end).await?;
            self.transaction_manager
                .backfill_workflow(ctx, workflow, &branch, &batches)
                .await?;
        }

        if incoming_tail.version > local_tail.version {
            self.transaction_manager
                .rebuild_workflow(ctx, workflow, &branch)
                .await?;
            if !plan.covers_batch {
                workflow.apply_batch(task.events.clone())?;
            }
            return self.commit(ctx, task, workflow, UpdateMode::Rebuilt { lca }).await;
        }

        if !plan.covers_batch {
            self.transaction_manager
                .backfill_workflow(ctx, workflow, &branch, std::slice::from_ref(&task.events))
                .await?;
        }
        let mut lineage = plan.incoming.clone();
        lineage.branch_token = branch;
        let histories = &mut workflow.mutable_state_mut().version_histories;
        match stored {
            Some((index, _)) => *histories.get_mut(index)? = lineage,
            None => {
                histories.add_history(lineage);
            }
        }

        self.transaction_manager
            .update_workflow(ctx, UpdateMode::Incremental, workflow, None)
            .await?;
        tracing::info!(
            "Stored losing lineage of {} ending at {} as a non-current branch",
            task.run_key,
            incoming_tail
        );
        Ok(ApplyOutcome::NonCurrentBranch)
    }

    /// Fetch `(start, end]`, write it to the current branch and advance
    /// state through it
    async fn backfill_current(
        &self,
        ctx: &CancellationToken,
        task: &ReplicationTask,
        plan: &BackfillPlan,
        workflow: &mut Workflow,
        start: VersionHistoryItem,
        end: VersionHistoryItem,
    ) -> Result<()> {
        let batches = self.fetch(ctx, task, plan, start, end).await?;
        let branch = workflow.mutable_state().current_branch_token().to_vec();
        self.transaction_manager
            .backfill_workflow(ctx, workflow, &branch, &batches)
            .await?;
        for batch in &batches {
            workflow.apply_backfilled(batch)?;
        }
        Ok(())
    }

    async fn fetch(
        &self,
        ctx: &CancellationToken,
        task: &ReplicationTask,
        plan: &BackfillPlan,
        start: VersionHistoryItem,
        end: VersionHistoryItem,
    ) -> Result<Vec<EventBatch>> {
        tracing::info!(
            "Backfilling {} ({}, {}] from {} for task {}",
            task.run_key,
            start,
            end,
            plan.source_cluster,
            task.task_id
        );

        let mut iter = self.fetcher.fetch_range_inclusive(
            ctx,
            &plan.source_cluster,
            &task.run_key,
            start.event_id,
            start.version,
            end.event_id,
            end.version,
        );
        let mut batches = Vec::new();
        while let Some(batch) = iter.next().await {
            batches.push(batch?);
        }
        Ok(batches)
    }

    async fn create(
        &self,
        ctx: &CancellationToken,
        task: &ReplicationTask,
        workflow: &mut Workflow,
    ) -> Result<ApplyOutcome> {
        self.transaction_manager.create_workflow(ctx, workflow).await?;
        self.ensure_new_run(ctx, task).await?;
        Ok(ApplyOutcome::Created)
    }

    async fn commit(
        &self,
        ctx: &CancellationToken,
        task: &ReplicationTask,
        workflow: &mut Workflow,
        mode: UpdateMode,
    ) -> Result<ApplyOutcome> {
        let mut new_run = self.prepare_new_run(ctx, task).await?;
        let result = self
            .transaction_manager
            .update_workflow(ctx, mode, workflow, new_run.as_mut())
            .await;
        if let Some(new_run) = new_run {
            new_run.release(result.as_ref().err());
        }
        result.map(|_| ApplyOutcome::Updated(mode))
    }

    /// Create the run this one continued as, unless it already exists
    async fn ensure_new_run(&self, ctx: &CancellationToken, task: &ReplicationTask) -> Result<()> {
        let Some(mut new_run) = self.prepare_new_run(ctx, task).await? else {
            return Ok(());
        };
        let result = match self.transaction_manager.create_workflow(ctx, &mut new_run).await {
            Err(Error::AlreadyExists(_)) => Ok(()),
            other => other,
        };
        new_run.release(result.as_ref().err());
        result
    }

    /// Load the run this one continued as, with its first batch applied.
    /// `None` when the task has no new run or it is already persisted.
    async fn prepare_new_run(
        &self,
        ctx: &CancellationToken,
        task: &ReplicationTask,
    ) -> Result<Option<Workflow>> {
        let (Some(events), Some(new_run_id)) = (&task.new_run_events, task.new_run_id()) else {
            return Ok(None);
        };
        let key = task.run_key.sibling(new_run_id);
        if self.transaction_manager.check_workflow_exists(ctx, &key).await? {
            return Ok(None);
        }

        let mut new_run = self
            .transaction_manager
            .load_workflow(ctx, &key, Archetype::Workflow, LeasePriority::High)
            .await?;
        if new_run.is_persisted() {
            new_run.release(None);
            return Ok(None);
        }
        if let Err(e) = new_run.apply_batch(events.clone()) {
            new_run.release(Some(&e));
            return Err(e);
        }
        Ok(Some(new_run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{EventId, Version};
    use crate::id::RunKey;
    use crate::persistence::ExecutionStore;
    use crate::state::ExecutionStatus;
    use crate::testing::{
        batch, completed, continued_as_new, migration_back_forth_batches, run_batches, started,
        task_completed, task_scheduled, task_started, Harness,
    };

    fn items(pairs: &[(EventId, Version)]) -> Vec<VersionHistoryItem> {
        pairs.iter().map(|&(e, v)| VersionHistoryItem::new(e, v)).collect()
    }

    fn key() -> RunKey {
        RunKey::new("ns", "wf", "run-1")
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let h = Harness::new();
        let ctx = CancellationToken::new();
        let task = h.task(key(), batch(vec![started(1, 1), task_scheduled(2, 1)]), items(&[(2, 1)]));

        assert_eq!(h.replicator.apply(&ctx, &task).await.unwrap(), ApplyOutcome::Created);
        let first = h.store.get_execution(&key()).await.unwrap().unwrap();

        assert_eq!(h.replicator.apply(&ctx, &task).await.unwrap(), ApplyOutcome::Duplicate);
        let second = h.store.get_execution(&key()).await.unwrap().unwrap();
        assert_eq!(first.db_version, second.db_version);
        assert_eq!(first.state, second.state);
        assert!(!h.tm.calls().contains(&"update_workflow".to_string()));
    }

    #[tokio::test]
    async fn test_continuation_appends() {
        let h = Harness::new();
        let ctx = CancellationToken::new();
        let lineage = items(&[(4, 1)]);
        let first = h.task(key(), batch(vec![started(1, 1), task_scheduled(2, 1)]), lineage.clone());
        let second = h.task(key(), batch(vec![task_started(3, 1), task_completed(4, 1)]), lineage);

        h.replicator.apply(&ctx, &first).await.unwrap();
        assert_eq!(
            h.replicator.apply(&ctx, &second).await.unwrap(),
            ApplyOutcome::Updated(UpdateMode::Incremental)
        );
        let record = h.store.get_execution(&key()).await.unwrap().unwrap();
        assert_eq!(record.state.next_event_id, 5);
        assert_eq!(record.db_version, 2);
    }

    #[tokio::test]
    async fn test_gap_is_backfilled() {
        let h = Harness::new();
        let ctx = CancellationToken::new();
        let remote = run_batches(1);
        h.admin.insert(key(), remote.clone(), items(&[(5, 1)]));

        let first = h.task(key(), remote[0].clone(), items(&[(5, 1)]));
        h.replicator.apply(&ctx, &first).await.unwrap();

        let last = h.task(key(), remote[2].clone(), items(&[(5, 1)]));
        h.replicator.apply(&ctx, &last).await.unwrap();

        let record = h.store.get_execution(&key()).await.unwrap().unwrap();
        assert_eq!(record.state.status, ExecutionStatus::Completed);
        assert_eq!(record.state.version_histories.current().items(), items(&[(5, 1)]).as_slice());
        assert_eq!(h.admin.requests().len(), 1);
        assert_eq!(h.admin.requests()[0].start_event_id, 2);
        assert_eq!(h.admin.requests()[0].end_event_id, 3);
    }

    #[tokio::test]
    async fn test_gap_beyond_peer_history() {
        let h = Harness::new();
        let ctx = CancellationToken::new();
        let (batches, lineage) = migration_back_forth_batches();
        h.admin.insert(key(), batches.clone(), lineage.clone());
        h.admin.truncate_after(8);

        let mut first = Vec::new();
        for b in &batches[..4] {
            first.extend(b.events.clone());
        }
        let seed = h.task(key(), batch(first), lineage.clone());
        h.replicator.apply(&ctx, &seed).await.unwrap();

        let task = h.task(key(), batches[7].clone(), lineage);
        let err = h.replicator.apply(&ctx, &task).await.unwrap_err();
        match err {
            Error::HistoryGap { expected, reached } => {
                assert_eq!(expected, VersionHistoryItem::new(10, 2));
                assert_eq!(reached, Some(VersionHistoryItem::new(8, 2)));
            }
            other => panic!("expected history gap, got {:?}", other),
        }

        let record = h.store.get_execution(&key()).await.unwrap().unwrap();
        assert_eq!(record.state.next_event_id, 6);
        assert!(!h.leases.is_held(&key()));
    }

    #[tokio::test]
    async fn test_fork_switches_to_higher_version() {
        let h = Harness::new();
        let ctx = CancellationToken::new();

        let local = h.task(
            key(),
            batch(vec![
                started(1, 1),
                task_scheduled(2, 1),
                task_started(3, 1),
                task_completed(4, 1),
                task_scheduled(5, 1),
                task_started(6, 1),
                task_completed(7, 1),
            ]),
            items(&[(7, 1)]),
        );
        h.replicator.apply(&ctx, &local).await.unwrap();

        let remote = vec![
            batch(vec![started(1, 1), task_scheduled(2, 1)]),
            batch(vec![task_started(3, 1), task_completed(4, 1), task_scheduled(5, 1)]),
            batch(vec![task_started(6, 11), task_completed(7, 11), task_scheduled(8, 11)]),
            batch(vec![task_started(9, 11), task_completed(10, 11)]),
        ];
        let lineage = items(&[(5, 1), (10, 11)]);
        h.admin.insert(key(), remote.clone(), lineage.clone());

        let task = h.task(key(), remote[3].clone(), lineage);
        assert_eq!(
            h.replicator.apply(&ctx, &task).await.unwrap(),
            ApplyOutcome::Updated(UpdateMode::Rebuilt {
                lca: VersionHistoryItem::new(5, 1)
            })
        );

        let record = h.store.get_execution(&key()).await.unwrap().unwrap();
        let histories = &record.state.version_histories;
        assert_eq!(histories.current().items(), items(&[(5, 1), (10, 11)]).as_slice());
        assert_eq!(histories.histories().len(), 2);
        assert!(histories.contains_item(VersionHistoryItem::new(7, 1)));
        assert_eq!(record.rebuild_count, 1);
        assert_eq!(record.state.next_event_id, 11);
        assert_eq!(record.state.last_write_version, 11);

        let stored = h
            .store
            .read_history(&key(), record.state.current_branch_token(), 1, 100)
            .await
            .unwrap();
        let ids: Vec<EventId> = stored.iter().flat_map(|b| b.events.iter().map(|e| e.event_id)).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_fork_to_local_version_rebuilds() {
        let h = Harness::new();
        let ctx = CancellationToken::new();

        let local = h.task(
            key(),
            batch(vec![
                started(1, 1),
                task_scheduled(2, 1),
                task_started(3, 1),
                task_completed(4, 1),
                task_scheduled(5, 1),
                task_started(6, 1),
                task_completed(7, 1),
            ]),
            items(&[(5, 1), (7, 1)]),
        );
        h.replicator.apply(&ctx, &local).await.unwrap();

        let remote = vec![
            batch(vec![started(1, 1), task_scheduled(2, 1)]),
            batch(vec![task_started(3, 1), task_completed(4, 1), task_scheduled(5, 1)]),
            batch(vec![task_started(6, 2), task_completed(7, 2), task_scheduled(8, 2)]),
            batch(vec![task_started(9, 2), task_completed(10, 2)]),
        ];
        let lineage = items(&[(5, 1), (10, 2)]);
        h.admin.insert(key(), remote.clone(), lineage.clone());

        let task = h.task(key(), remote[3].clone(), lineage.clone());
        assert_eq!(
            h.replicator.apply(&ctx, &task).await.unwrap(),
            ApplyOutcome::Updated(UpdateMode::Rebuilt {
                lca: VersionHistoryItem::new(5, 1)
            })
        );

        let record = h.store.get_execution(&key()).await.unwrap().unwrap();
        let histories = &record.state.version_histories;
        assert_eq!(histories.current().items(), lineage.as_slice());
        assert_eq!(histories.histories().len(), 2);
        assert!(histories.contains_item(VersionHistoryItem::new(7, 1)));
        assert_eq!(record.state.next_event_id, 11);
        assert_eq!(record.state.last_write_version, 2);

        // Version 2 belongs to this cluster, so the range comes from the sender
        let requests = h.admin.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!((requests[0].start_event_id, requests[0].start_version), (5, 1));
        assert_eq!((requests[0].end_event_id, requests[0].end_version), (10, 2));

        assert_eq!(h.replicator.apply(&ctx, &task).await.unwrap(), ApplyOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_fork_with_lower_version_is_kept_aside() {
        let h = Harness::new();
        let ctx = CancellationToken::new();

        let local_batches = vec![
            batch(vec![started(1, 1), task_scheduled(2, 1), task_started(3, 1), task_completed(4, 1), task_scheduled(5, 1)]),
            batch(vec![task_started(6, 11), task_completed(7, 11)]),
        ];
        let local_lineage = items(&[(5, 1), (7, 11)]);
        for b in &local_batches {
            let task = h.task(key(), b.clone(), local_lineage.clone());
            h.replicator.apply(&ctx, &task).await.unwrap();
        }

        let remote = vec![
            local_batches[0].clone(),
            batch(vec![task_started(6, 1), task_completed(7, 1), task_scheduled(8, 1)]),
            batch(vec![task_started(9, 1), task_completed(10, 1)]),
        ];
        let lineage = items(&[(10, 1)]);
        h.admin.insert(key(), remote.clone(), lineage.clone());

        let task = h.task(key(), remote[2].clone(), lineage);
        assert_eq!(
            h.replicator.apply(&ctx, &task).await.unwrap(),
            ApplyOutcome::NonCurrentBranch
        );

        let record = h.store.get_execution(&key()).await.unwrap().unwrap();
        assert_eq!(record.state.version_histories.current().items(), local_lineage.as_slice());
        assert_eq!(record.state.version_histories.histories().len(), 2);
        assert_eq!(record.rebuild_count, 0);

        assert_eq!(h.replicator.apply(&ctx, &task).await.unwrap(), ApplyOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_losing_lineage_extends_stored_branch() {
        let h = Harness::new();
        let ctx = CancellationToken::new();

        let local_batches = vec![
            batch(vec![started(1, 1), task_scheduled(2, 1), task_started(3, 1), task_completed(4, 1), task_scheduled(5, 1)]),
            batch(vec![task_started(6, 11), task_completed(7, 11)]),
        ];
        let local_lineage = items(&[(5, 1), (7, 11)]);
        for b in &local_batches {
            let task = h.task(key(), b.clone(), local_lineage.clone());
            h.replicator.apply(&ctx, &task).await.unwrap();
        }

        let mut remote = vec![
            local_batches[0].clone(),
            batch(vec![task_started(6, 1), task_completed(7, 1), task_scheduled(8, 1)]),
            batch(vec![task_started(9, 1), task_completed(10, 1)]),
        ];
        h.admin.insert(key(), remote.clone(), items(&[(10, 1)]));
        let task = h.task(key(), remote[2].clone(), items(&[(10, 1)]));
        assert_eq!(h.replicator.apply(&ctx, &task).await.unwrap(), ApplyOutcome::NonCurrentBranch);

        remote.push(batch(vec![task_scheduled(11, 1), task_started(12, 1)]));
        h.admin.insert(key(), remote.clone(), items(&[(12, 1)]));
        let task = h.task(key(), remote[3].clone(), items(&[(12, 1)]));
        assert_eq!(h.replicator.apply(&ctx, &task).await.unwrap(), ApplyOutcome::NonCurrentBranch);

        // Appended to the stored branch: no second fork, nothing refetched
        assert_eq!(h.tm.count("fork_history"), 1);
        assert_eq!(h.admin.requests().len(), 1);

        let record = h.store.get_execution(&key()).await.unwrap().unwrap();
        let histories = &record.state.version_histories;
        assert_eq!(histories.current().items(), local_lineage.as_slice());
        assert_eq!(histories.histories().len(), 2);
        let stored = &histories.histories()[1];
        assert_eq!(stored.items(), items(&[(12, 1)]).as_slice());

        let events = h
            .store
            .read_history(&key(), &stored.branch_token, 1, 100)
            .await
            .unwrap();
        let ids: Vec<EventId> = events.iter().flat_map(|b| b.events.iter().map(|e| e.event_id)).collect();
        assert_eq!(ids, (1..=12).collect::<Vec<_>>());

        assert_eq!(h.replicator.apply(&ctx, &task).await.unwrap(), ApplyOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_long_running_migration_back() {
        let h = Harness::new();
        let ctx = CancellationToken::new();
        let (batches, lineage) = migration_back_forth_batches();
        h.admin.insert(key(), batches.clone(), lineage.clone());

        let task = h.task(key(), batches[7].clone(), lineage.clone());
        assert_eq!(h.replicator.apply(&ctx, &task).await.unwrap(), ApplyOutcome::Created);

        let record = h.store.get_execution(&key()).await.unwrap().unwrap();
        assert_eq!(record.state.version_histories.current().items(), lineage.as_slice());
        assert_eq!(record.state.next_event_id, 13);

        let requests = h.admin.requests();
        assert_eq!(requests[0].start_event_id, 0);
        assert_eq!(requests[0].end_event_id, 10);
        assert_eq!(requests[0].end_version, 2);

        let calls = h.tm.calls();
        let backfill = calls.iter().position(|c| c == "backfill_workflow").unwrap();
        let create = calls.iter().position(|c| c == "create_workflow").unwrap();
        assert!(backfill < create);
    }

    #[tokio::test]
    async fn test_local_events_are_imported() {
        let h = Harness::new();
        let ctx = CancellationToken::new();
        let (batches, lineage) = migration_back_forth_batches();
        h.admin.insert(key(), batches.clone(), lineage.clone());

        let task = h.task(key(), batches[6].clone(), lineage);
        h.replicator.apply(&ctx, &task).await.unwrap();

        let record = h.store.get_execution(&key()).await.unwrap().unwrap();
        assert_eq!(
            record.state.version_histories.current().items(),
            items(&[(5, 1), (10, 2)]).as_slice()
        );
        assert_eq!(record.state.pending_timers.len(), 1);
        assert_eq!(record.state.next_event_id, 11);
    }

    #[tokio::test]
    async fn test_multiple_runs_migration_back() {
        let h = Harness::new();
        let ctx = CancellationToken::new();
        let keys = [key(), RunKey::new("ns", "wf", "run-2")];

        // Each task carries only the first batch, written locally before
        // the runs moved away
        for run_key in &keys {
            let run = run_batches(2);
            h.admin.insert(run_key.clone(), run.clone(), items(&[(5, 2)]));
            let task = h.task(run_key.clone(), run[0].clone(), items(&[(5, 2)]));
            assert_eq!(h.replicator.apply(&ctx, &task).await.unwrap(), ApplyOutcome::Created);
        }

        let requests = h.admin.requests();
        assert_eq!(requests.len(), 2);
        for (request, run_key) in requests.iter().zip(&keys) {
            assert_eq!(&request.run_key, run_key);
            assert_eq!((request.start_event_id, request.start_version), (0, 0));
            assert_eq!((request.end_event_id, request.end_version), (5, 2));
        }

        for run_key in &keys {
            let record = h.store.get_execution(run_key).await.unwrap().unwrap();
            assert_eq!(record.state.status, ExecutionStatus::Completed);
            assert_eq!(record.state.version_histories.current().items(), items(&[(5, 2)]).as_slice());
        }
        assert_eq!(
            h.store.get_current_run_id("ns", "wf").await.unwrap().as_deref(),
            Some("run-2")
        );
    }

    #[tokio::test]
    async fn test_continue_as_new_creates_new_run() {
        let h = Harness::new();
        let ctx = CancellationToken::new();
        let lineage = items(&[(3, 1)]);
        let first = h.task(key(), batch(vec![started(1, 1), task_scheduled(2, 1)]), lineage.clone());
        h.replicator.apply(&ctx, &first).await.unwrap();

        let mut last = h.task(key(), batch(vec![continued_as_new(3, 1, "run-2")]), lineage);
        last.new_run_events = Some(batch(vec![started(1, 1), task_scheduled(2, 1)]));
        h.replicator.apply(&ctx, &last).await.unwrap();

        let old = h.store.get_execution(&key()).await.unwrap().unwrap();
        assert_eq!(old.state.status, ExecutionStatus::ContinuedAsNew);
        let new = h
            .store
            .get_execution(&key().sibling("run-2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(new.state.next_event_id, 3);
        assert!(!h.leases.is_held(&key().sibling("run-2")));

        assert_eq!(h.replicator.apply(&ctx, &last).await.unwrap(), ApplyOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_concurrent_create_is_reclassified() {
        let h = Harness::new();
        let ctx = CancellationToken::new();
        h.tm.fail_after_next("create_workflow", Error::AlreadyExists(key().to_string()));
        let task = h.task(key(), batch(vec![started(1, 1), task_scheduled(2, 1)]), items(&[(2, 1)]));

        assert_eq!(h.replicator.apply(&ctx, &task).await.unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(h.tm.count("load_workflow"), 2);
        assert_eq!(h.tm.count("create_workflow"), 1);

        let record = h.store.get_execution(&key()).await.unwrap().unwrap();
        assert_eq!(record.state.next_event_id, 3);

        assert!(!h.leases.is_held(&key()));
        let stats = h.leases.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released_err, 1);
        assert_eq!(stats.released_ok, 1);
    }

    #[tokio::test]
    async fn test_concurrent_new_run_is_reclassified() {
        let h = Harness::new();
        let ctx = CancellationToken::new();
        let lineage = items(&[(3, 1)]);
        let first = h.task(key(), batch(vec![started(1, 1), task_scheduled(2, 1)]), lineage.clone());
        h.replicator.apply(&ctx, &first).await.unwrap();

        let new_run = key().sibling("run-2");
        h.tm.fail_after_next("update_workflow", Error::AlreadyExists(new_run.to_string()));
        let mut last = h.task(key(), batch(vec![continued_as_new(3, 1, "run-2")]), lineage);
        last.new_run_events = Some(batch(vec![started(1, 1), task_scheduled(2, 1)]));

        assert_eq!(h.replicator.apply(&ctx, &last).await.unwrap(), ApplyOutcome::Duplicate);
        // first apply, target and new run, then the reload
        assert_eq!(h.tm.count("load_workflow"), 4);
        assert_eq!(h.tm.count("update_workflow"), 1);

        let old = h.store.get_execution(&key()).await.unwrap().unwrap();
        assert_eq!(old.state.status, ExecutionStatus::ContinuedAsNew);
        assert!(h.store.get_execution(&new_run).await.unwrap().is_some());
        assert!(!h.leases.is_held(&key()));
        assert!(!h.leases.is_held(&new_run));
        assert_eq!(h.leases.stats().released_err, 2);
    }

    #[tokio::test]
    async fn test_concurrent_tasks_converge() {
        let h = Arc::new(Harness::new());
        let run = vec![
            batch(vec![started(1, 1)]),
            batch(vec![task_scheduled(2, 1)]),
            batch(vec![task_started(3, 1)]),
            batch(vec![task_completed(4, 1)]),
            batch(vec![task_scheduled(5, 1)]),
            batch(vec![task_started(6, 1)]),
            batch(vec![task_completed(7, 1)]),
            batch(vec![completed(8, 1)]),
        ];
        let lineage = items(&[(8, 1)]);
        h.admin.insert(key(), run.clone(), lineage.clone());

        let mut handles = Vec::new();
        for b in run.iter().rev() {
            let h = h.clone();
            let task = h.task(key(), b.clone(), lineage.clone());
            handles.push(tokio::spawn(async move {
                let ctx = CancellationToken::new();
                h.replicator.apply(&ctx, &task).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let record = h.store.get_execution(&key()).await.unwrap().unwrap();
        assert_eq!(record.state.next_event_id, 9);
        assert_eq!(record.state.status, ExecutionStatus::Completed);
        assert_eq!(h.leases.stats().held_keys, 0);
    }

    #[tokio::test]
    async fn test_cancelled_apply_releases_lease() {
        let h = Harness::new();
        let ctx = CancellationToken::new();
        ctx.cancel();
        let task = h.task(key(), batch(vec![started(1, 1)]), items(&[(1, 1)]));
        let result = h.replicator.apply(&ctx, &task).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!h.leases.is_held(&key()));
    }
}
