//! Mutable State
//!
//! In-memory execution state of one run, derived by applying its history
//! events in order. Rebuilding after a fork is a replay of the winning
//! lineage from genesis.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::history::{
    EventAttributes, EventBatch, EventId, HistoryEvent, Version, VersionHistories, VersionHistory,
    EMPTY_VERSION, FIRST_EVENT_ID,
};
use crate::id::RunKey;

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// No started event applied yet
    Created,
    Running,
    Completed,
    Failed,
    Terminated,
    ContinuedAsNew,
}

impl ExecutionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, ExecutionStatus::Created | ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Created => write!(f, "CREATED"),
            ExecutionStatus::Running => write!(f, "RUNNING"),
            ExecutionStatus::Completed => write!(f, "COMPLETED"),
            ExecutionStatus::Failed => write!(f, "FAILED"),
            ExecutionStatus::Terminated => write!(f, "TERMINATED"),
            ExecutionStatus::ContinuedAsNew => write!(f, "CONTINUED_AS_NEW"),
        }
    }
}

/// Execution state of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutableState {
    pub run_key: RunKey,
    pub version_histories: VersionHistories,
    pub status: ExecutionStatus,
    pub next_event_id: EventId,
    pub last_write_version: Version,
    pub workflow_type: Option<String>,
    pub task_queue: Option<String>,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Scheduled event ID of the outstanding workflow task
    pub pending_workflow_task: Option<EventId>,
    /// Timer ID -> started event ID
    pub pending_timers: BTreeMap<String, EventId>,
    /// Scheduled event ID -> activity ID
    pub pending_activities: BTreeMap<EventId, String>,
    pub continued_as_new_run_id: Option<String>,
}

impl MutableState {
    /// Empty state for a run whose history lives on `branch_token`
    pub fn new(run_key: RunKey, branch_token: Vec<u8>) -> Self {
        Self {
            run_key,
            version_histories: VersionHistories::new(VersionHistory::empty(branch_token)),
            status: ExecutionStatus::Created,
            next_event_id: FIRST_EVENT_ID,
            last_write_version: EMPTY_VERSION,
            workflow_type: None,
            task_queue: None,
            start_time: None,
            pending_workflow_task: None,
            pending_timers: BTreeMap::new(),
            pending_activities: BTreeMap::new(),
            continued_as_new_run_id: None,
        }
    }

    /// Rebuild state by replaying a lineage from genesis
    pub fn replay<I>(run_key: RunKey, branch_token: Vec<u8>, batches: I) -> Result<Self>
    where
        I: IntoIterator<Item = EventBatch>,
    {
        let mut state = Self::new(run_key, branch_token);
        for batch in batches {
            state.apply_batch(&batch)?;
        }
        if state.next_event_id == FIRST_EVENT_ID {
            return Err(Error::InvalidSequence(format!(
                "no history to rebuild {} from",
                state.run_key
            )));
        }
        Ok(state)
    }

    /// Number of events applied so far
    pub fn history_length(&self) -> i64 {
        self.next_event_id - FIRST_EVENT_ID
    }

    /// Branch token of the current lineage
    pub fn current_branch_token(&self) -> &[u8] {
        &self.version_histories.current().branch_token
    }

    /// Apply a batch that directly follows the applied events
    pub fn apply_batch(&mut self, batch: &EventBatch) -> Result<()> {
        batch.validate()?;
        if batch.first_event_id() != self.next_event_id {
            return Err(Error::InvalidSequence(format!(
                "batch starts at {} but {} expects event {}",
                batch.first_event_id(),
                self.run_key,
                self.next_event_id
            )));
        }

        for event in &batch.events {
            self.apply_event(event)?;
        }
        Ok(())
    }

    fn apply_event(&mut self, event: &HistoryEvent) -> Result<()> {
        if !self.status.is_open() {
            return Err(Error::InvalidSequence(format!(
                "event {} arrived after {} closed as {}",
                event.event_id, self.run_key, self.status
            )));
        }

        self.version_histories.current_mut().append_item(event.item())?;

        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted { workflow_type, task_queue } => {
                if event.event_id != FIRST_EVENT_ID {
                    return Err(Error::InvalidSequence(format!(
                        "started event at position {}",
                        event.event_id
                    )));
                }
                self.status = ExecutionStatus::Running;
                self.workflow_type = Some(workflow_type.clone());
                self.task_queue = Some(task_queue.clone());
                self.start_time = Some(event.timestamp);
            }
            EventAttributes::WorkflowTaskScheduled { .. } => {
                self.pending_workflow_task = Some(event.event_id);
            }
            EventAttributes::WorkflowTaskStarted { .. } => {}
            EventAttributes::WorkflowTaskCompleted { .. } => {
                self.pending_workflow_task = None;
            }
            EventAttributes::TimerStarted { timer_id, .. } => {
                self.pending_timers.insert(timer_id.clone(), event.event_id);
            }
            EventAttributes::TimerFired { timer_id, .. }
            | EventAttributes::TimerCanceled { timer_id, .. } => {
                self.pending_timers.remove(timer_id);
            }
            EventAttributes::ActivityTaskScheduled { activity_id, .. } => {
                self.pending_activities.insert(event.event_id, activity_id.clone());
            }
            EventAttributes::ActivityTaskCompleted { scheduled_event_id } => {
                self.pending_activities.remove(scheduled_event_id);
            }
            EventAttributes::WorkflowExecutionCompleted => {
                self.status = ExecutionStatus::Completed;
            }
            EventAttributes::WorkflowExecutionFailed { .. } => {
                self.status = ExecutionStatus::Failed;
            }
            EventAttributes::WorkflowExecutionTerminated { .. } => {
                self.status = ExecutionStatus::Terminated;
            }
            EventAttributes::WorkflowExecutionContinuedAsNew { new_run_id } => {
                self.status = ExecutionStatus::ContinuedAsNew;
                self.continued_as_new_run_id = Some(new_run_id.clone());
            }
        }

        if event.attributes.is_terminal() {
            self.pending_workflow_task = None;
        }

        self.next_event_id = event.event_id + 1;
        self.last_write_version = event.version;
        Ok(())
    }
}
