//! Replication Tasks
//!
//! The unit of inbound replication: one event batch of one run, tagged
//! with the sender's lineage for that run.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::history::{EventAttributes, EventBatch, VersionHistory, VersionHistoryItem, FIRST_EVENT_ID};
use crate::id::RunKey;

/// A replicated batch of history events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTask {
    /// Sender-assigned task ID, for logs and dead letters
    pub task_id: i64,
    /// Cluster that sent the task
    pub source_cluster: String,
    pub run_key: RunKey,
    pub events: EventBatch,
    /// First batch of the run this one continued as, if any
    pub new_run_events: Option<EventBatch>,
    /// Sender's lineage for the run, through at least the batch
    pub version_history_items: Vec<VersionHistoryItem>,
}

impl ReplicationTask {
    /// Check the task is internally consistent
    pub fn validate(&self) -> Result<()> {
        self.events.validate()?;
        if let Some(new_run_events) = &self.new_run_events {
            new_run_events.validate()?;
            if new_run_events.first_event_id() != FIRST_EVENT_ID {
                return Err(Error::InvalidSequence(format!(
                    "new run batch of task {} starts at {}",
                    self.task_id,
                    new_run_events.first_event_id()
                )));
            }
            if self.new_run_id().is_none() {
                return Err(Error::InvalidSequence(format!(
                    "task {} carries new run events without continue-as-new",
                    self.task_id
                )));
            }
        }

        let lineage = self.lineage()?;
        if !lineage.contains_item(self.events.last_item()) {
            return Err(Error::InvalidSequence(format!(
                "batch ending at {} is not on the lineage of task {}",
                self.events.last_item(),
                self.task_id
            )));
        }
        Ok(())
    }

    /// The sender's lineage as a version history
    pub fn lineage(&self) -> Result<VersionHistory> {
        if self.version_history_items.is_empty() {
            return Err(Error::InvalidSequence(format!(
                "task {} has an empty lineage",
                self.task_id
            )));
        }
        VersionHistory::new(Vec::new(), self.version_history_items.clone())
    }

    /// Run ID this run continued as, read from the batch
    pub fn new_run_id(&self) -> Option<&str> {
        self.events.events.iter().find_map(|e| match &e.attributes {
            EventAttributes::WorkflowExecutionContinuedAsNew { new_run_id } => {
                Some(new_run_id.as_str())
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{batch, continued_as_new, started, task_scheduled};

    fn task(events: EventBatch, items: Vec<VersionHistoryItem>) -> ReplicationTask {
        ReplicationTask {
            task_id: 1,
            source_cluster: "cluster-a".into(),
            run_key: RunKey::new("ns", "wf", "run"),
            events,
            new_run_events: None,
            version_history_items: items,
        }
    }

    #[test]
    fn test_validate_batch_on_lineage() {
        let t = task(
            batch(vec![started(1, 1), task_scheduled(2, 1)]),
            vec![VersionHistoryItem::new(5, 1)],
        );
        assert!(t.validate().is_ok());

        let off_lineage = task(batch(vec![started(1, 2)]), vec![VersionHistoryItem::new(5, 1)]);
        assert!(matches!(off_lineage.validate(), Err(Error::InvalidSequence(_))));

        let empty = task(batch(vec![started(1, 1)]), vec![]);
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_new_run_requires_continue_as_new() {
        let mut t = task(batch(vec![started(1, 1)]), vec![VersionHistoryItem::new(1, 1)]);
        t.new_run_events = Some(batch(vec![started(1, 1)]));
        assert!(t.validate().is_err());

        let mut t = task(
            batch(vec![started(1, 1), continued_as_new(2, 1, "run-2")]),
            vec![VersionHistoryItem::new(2, 1)],
        );
        t.new_run_events = Some(batch(vec![started(1, 1)]));
        assert!(t.validate().is_ok());
        assert_eq!(t.new_run_id(), Some("run-2"));
    }
}
