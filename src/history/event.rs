//! History Event Types
//!
//! Defines the events that make up a run's history and the batches
//! they are persisted and replicated in.

use serde::{Deserialize, Serialize};

use super::version::VersionHistoryItem;
use crate::error::{Error, Result};

/// Event identifier - position of an event in a run's history (starts at 1)
pub type EventId = i64;

/// Failover version identifying the cluster/epoch that wrote an event
pub type Version = i64;

/// Sentinel for "no event" (exclusive start bound meaning "from genesis")
pub const EMPTY_EVENT_ID: EventId = 0;

/// Sentinel for "no version"
pub const EMPTY_VERSION: Version = 0;

/// First event ID of every run
pub const FIRST_EVENT_ID: EventId = 1;

/// Event-specific attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        workflow_type: String,
        task_queue: String,
    },
    WorkflowTaskScheduled {
        task_queue: String,
        attempt: u32,
    },
    WorkflowTaskStarted {
        scheduled_event_id: EventId,
        identity: String,
    },
    WorkflowTaskCompleted {
        scheduled_event_id: EventId,
        started_event_id: EventId,
    },
    TimerStarted {
        timer_id: String,
        fire_after_secs: u64,
    },
    TimerFired {
        timer_id: String,
        started_event_id: EventId,
    },
    TimerCanceled {
        timer_id: String,
        started_event_id: EventId,
    },
    ActivityTaskScheduled {
        activity_id: String,
        activity_type: String,
    },
    ActivityTaskCompleted {
        scheduled_event_id: EventId,
    },
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed {
        reason: String,
    },
    WorkflowExecutionTerminated {
        reason: String,
    },
    WorkflowExecutionContinuedAsNew {
        new_run_id: String,
    },
}

impl EventAttributes {
    /// Get the event type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            EventAttributes::WorkflowExecutionStarted { .. } => "WorkflowExecutionStarted",
            EventAttributes::WorkflowTaskScheduled { .. } => "WorkflowTaskScheduled",
            EventAttributes::WorkflowTaskStarted { .. } => "WorkflowTaskStarted",
            EventAttributes::WorkflowTaskCompleted { .. } => "WorkflowTaskCompleted",
            EventAttributes::TimerStarted { .. } => "TimerStarted",
            EventAttributes::TimerFired { .. } => "TimerFired",
            EventAttributes::TimerCanceled { .. } => "TimerCanceled",
            EventAttributes::ActivityTaskScheduled { .. } => "ActivityTaskScheduled",
            EventAttributes::ActivityTaskCompleted { .. } => "ActivityTaskCompleted",
            EventAttributes::WorkflowExecutionCompleted => "WorkflowExecutionCompleted",
            EventAttributes::WorkflowExecutionFailed { .. } => "WorkflowExecutionFailed",
            EventAttributes::WorkflowExecutionTerminated { .. } => "WorkflowExecutionTerminated",
            EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
                "WorkflowExecutionContinuedAsNew"
            }
        }
    }

    /// Whether this event closes the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventAttributes::WorkflowExecutionCompleted
                | EventAttributes::WorkflowExecutionFailed { .. }
                | EventAttributes::WorkflowExecutionTerminated { .. }
                | EventAttributes::WorkflowExecutionContinuedAsNew { .. }
        )
    }
}

/// A single history event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: EventId,
    pub version: Version,
    pub task_id: i64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// Create a new event stamped with the current time
    pub fn new(event_id: EventId, version: Version, attributes: EventAttributes) -> Self {
        Self {
            event_id,
            version,
            task_id: 0,
            timestamp: chrono::Utc::now(),
            attributes,
        }
    }

    /// The (event_id, version) checkpoint of this event
    pub fn item(&self) -> VersionHistoryItem {
        VersionHistoryItem::new(self.event_id, self.version)
    }
}

/// Ordered events sharing one persisted write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<HistoryEvent>,
}

impl EventBatch {
    /// Create a batch, validating its shape
    pub fn new(events: Vec<HistoryEvent>) -> Result<Self> {
        let batch = Self { events };
        batch.validate()?;
        Ok(batch)
    }

    /// Check the batch is non-empty, contiguous and never lowers the version
    pub fn validate(&self) -> Result<()> {
        let first = self
            .events
            .first()
            .ok_or_else(|| Error::InvalidSequence("empty event batch".into()))?;

        if first.event_id < FIRST_EVENT_ID {
            return Err(Error::InvalidSequence(format!(
                "event id {} is below the first event id",
                first.event_id
            )));
        }

        for pair in self.events.windows(2) {
            if pair[1].event_id != pair[0].event_id + 1 {
                return Err(Error::InvalidSequence(format!(
                    "event {} follows event {} in one batch",
                    pair[1].event_id, pair[0].event_id
                )));
            }
            if pair[1].version < pair[0].version {
                return Err(Error::InvalidSequence(format!(
                    "event {} lowers version from {} to {}",
                    pair[1].event_id, pair[0].version, pair[1].version
                )));
            }
        }

        Ok(())
    }

    /// First event ID in the batch
    pub fn first_event_id(&self) -> EventId {
        self.events.first().map(|e| e.event_id).unwrap_or(EMPTY_EVENT_ID)
    }

    /// Last event ID in the batch
    pub fn last_event_id(&self) -> EventId {
        self.events.last().map(|e| e.event_id).unwrap_or(EMPTY_EVENT_ID)
    }

    /// Version of the last event in the batch
    pub fn last_version(&self) -> Version {
        self.events.last().map(|e| e.version).unwrap_or(EMPTY_VERSION)
    }

    /// The (event_id, version) tag of the batch's last event
    pub fn last_item(&self) -> VersionHistoryItem {
        VersionHistoryItem::new(self.last_event_id(), self.last_version())
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the batch carries no events
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
