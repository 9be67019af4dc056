//! Replication Task Generation
//!
//! Builds the task carrying a run's last batch together with its current
//! lineage. Sent to another cluster, the task makes that cluster pull the
//! whole run through backfill, which is how runs are migrated.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::task::ReplicationTask;
use crate::error::{Error, Result};
use crate::history::FIRST_EVENT_ID;
use crate::id::RunKey;
use crate::lease::LeasePriority;
use crate::ndc::{Archetype, TransactionManager, Workflow};

/// Generates replication tasks from local runs
pub struct TaskGenerator {
    local_cluster: String,
    transaction_manager: Arc<dyn TransactionManager>,
}

impl TaskGenerator {
    pub fn new(local_cluster: impl Into<String>, transaction_manager: Arc<dyn TransactionManager>) -> Self {
        Self {
            local_cluster: local_cluster.into(),
            transaction_manager,
        }
    }

    /// Task for the last batch of `run_key`, and the run's history length.
    /// An empty run ID selects the workflow's current run.
    pub async fn generate_last_history_task(
        &self,
        ctx: &CancellationToken,
        run_key: &RunKey,
    ) -> Result<(ReplicationTask, i64)> {
        let run_key = self.resolve_run(ctx, run_key).await?;
        if !self.transaction_manager.check_workflow_exists(ctx, &run_key).await? {
            return Err(Error::NotFound(run_key.to_string()));
        }

        let workflow = self
            .transaction_manager
            .load_workflow(ctx, &run_key, Archetype::Any, LeasePriority::High)
            .await?;
        let result = self.last_history_task(ctx, &workflow).await;
        workflow.release(result.as_ref().err());

        if let Ok((task, history_length)) = &result {
            tracing::info!(
                "Generated task {} for {} ({} events)",
                task.task_id,
                task.run_key,
                history_length
            );
        }
        result
    }

    async fn resolve_run(&self, ctx: &CancellationToken, run_key: &RunKey) -> Result<RunKey> {
        if !run_key.run_id.is_empty() {
            return Ok(run_key.clone());
        }
        let run_id = self
            .transaction_manager
            .get_current_workflow_run_id(ctx, &run_key.namespace_id, &run_key.workflow_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("{}/{}", run_key.namespace_id, run_key.workflow_id))
            })?;
        Ok(run_key.sibling(run_id))
    }

    async fn last_history_task(
        &self,
        ctx: &CancellationToken,
        workflow: &Workflow,
    ) -> Result<(ReplicationTask, i64)> {
        let state = workflow.mutable_state();
        let lineage = state.version_histories.current();
        let items = lineage.items();
        let last = lineage
            .last_item()
            .ok_or_else(|| Error::NotFound(format!("{} has no history", workflow.run_key())))?;

        // Read only the last version segment
        let segment_start = items
            .len()
            .checked_sub(2)
            .map(|i| items[i].event_id + 1)
            .unwrap_or(FIRST_EVENT_ID);
        let mut batches = self
            .transaction_manager
            .read_history(ctx, workflow, segment_start, last.event_id)
            .await?;
        let events = batches.pop().ok_or_else(|| {
            Error::Storage(format!(
                "{} has no stored events through {}",
                workflow.run_key(),
                last
            ))
        })?;
        if events.last_item() != last {
            return Err(Error::Storage(format!(
                "{} history ends at {} but its lineage ends at {}",
                workflow.run_key(),
                events.last_item(),
                last
            )));
        }

        let task = ReplicationTask {
            task_id: chrono::Utc::now().timestamp_micros(),
            source_cluster: self.local_cluster.clone(),
            run_key: workflow.run_key().clone(),
            events,
            new_run_events: None,
            version_history_items: items.to_vec(),
        };
        Ok((task, state.history_length()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::VersionHistoryItem;
    use crate::testing::{migration_back_forth_batches, Harness};

    fn key() -> RunKey {
        RunKey::new("ns", "wf", "run-1")
    }

    #[tokio::test]
    async fn test_generate_last_history_task() {
        let h = Harness::new();
        let ctx = CancellationToken::new();
        let (batches, lineage) = migration_back_forth_batches();
        h.admin.insert(key(), batches.clone(), lineage.clone());
        let task = h.task(key(), batches[7].clone(), lineage.clone());
        h.replicator.apply(&ctx, &task).await.unwrap();

        let generator = TaskGenerator::new("cluster-b", h.tm.clone());
        let (generated, history_length) = generator
            .generate_last_history_task(&ctx, &RunKey::new("ns", "wf", ""))
            .await
            .unwrap();

        assert_eq!(history_length, 12);
        assert_eq!(generated.run_key, key());
        assert_eq!(generated.source_cluster, "cluster-b");
        assert_eq!(generated.events, batches[7]);
        assert_eq!(generated.version_history_items, lineage);
        assert_eq!(generated.events.last_item(), VersionHistoryItem::new(12, 11));
        generated.validate().unwrap();
        assert!(!h.leases.is_held(&key()));
    }

    #[tokio::test]
    async fn test_generate_for_missing_run() {
        let h = Harness::new();
        let ctx = CancellationToken::new();
        let generator = TaskGenerator::new("cluster-b", h.tm.clone());

        let result = generator.generate_last_history_task(&ctx, &key()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        let result = generator
            .generate_last_history_task(&ctx, &RunKey::new("ns", "wf", ""))
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(!h.tm.calls().contains(&"load_workflow".to_string()));
    }
}
