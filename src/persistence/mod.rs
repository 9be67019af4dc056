//! Execution Persistence
//!
//! Storage contract for run records and their history branches, with an
//! in-memory backend for tests and single-process use and a SQLite
//! backend for durable nodes.
//!
//! Every write to a run record is conditional on the `db_version` read
//! at load time. History events live on branches addressed by opaque
//! tokens and may be written before the record that references them.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::history::{EventBatch, EventId, UpdateMode};
use crate::id::RunKey;
use crate::state::MutableState;

/// A persisted run
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub state: MutableState,
    /// Incremented by every successful write
    pub db_version: i64,
    /// Number of commits that replaced state after a lineage switch
    pub rebuild_count: u64,
}

/// State plus the batches to append to its current branch
#[derive(Debug, Clone)]
pub struct ExecutionWrite {
    pub state: MutableState,
    pub new_batches: Vec<EventBatch>,
}

impl ExecutionWrite {
    pub fn key(&self) -> &RunKey {
        &self.state.run_key
    }
}

/// Conditional update of an existing run, optionally creating the run it
/// continued as
#[derive(Debug, Clone)]
pub struct UpdateExecution {
    pub write: ExecutionWrite,
    pub expected_db_version: i64,
    pub mode: UpdateMode,
    pub new_run: Option<ExecutionWrite>,
}

/// Storage backend for runs and history branches
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Load a run record
    async fn get_execution(&self, key: &RunKey) -> Result<Option<ExecutionRecord>>;

    /// Run ID of the most recently started run of a workflow
    async fn get_current_run_id(&self, namespace_id: &str, workflow_id: &str)
        -> Result<Option<String>>;

    /// Create a run record at db_version 1. Fails with `AlreadyExists`
    /// if the run was created concurrently.
    async fn create_execution(&self, write: ExecutionWrite) -> Result<()>;

    /// Atomically update a run and create its successor. Fails with
    /// `ConditionFailed` if the stored db_version moved.
    async fn update_execution(&self, update: UpdateExecution) -> Result<()>;

    /// Append batches to a branch. Batches already present with identical
    /// content are skipped.
    async fn append_history(&self, key: &RunKey, branch_token: &[u8], batches: &[EventBatch])
        -> Result<()>;

    /// Events of a branch in `[min_event_id, max_event_id]`, in batches
    async fn read_history(
        &self,
        key: &RunKey,
        branch_token: &[u8],
        min_event_id: EventId,
        max_event_id: EventId,
    ) -> Result<Vec<EventBatch>>;

    /// Copy a branch's events up to and including `fork_event_id` onto a
    /// fresh branch, returning its token
    async fn fork_branch(&self, key: &RunKey, base_branch: &[u8], fork_event_id: EventId)
        -> Result<Vec<u8>>;
}

/// Restrict batches to events in `[min_event_id, max_event_id]`
pub(crate) fn slice_batches(
    batches: impl IntoIterator<Item = EventBatch>,
    min_event_id: EventId,
    max_event_id: EventId,
) -> Vec<EventBatch> {
    batches
        .into_iter()
        .filter(|b| b.last_event_id() >= min_event_id && b.first_event_id() <= max_event_id)
        .map(|mut b| {
            b.events
                .retain(|e| e.event_id >= min_event_id && e.event_id <= max_event_id);
            b
        })
        .collect()
}

/// Decide which of `incoming` still need writing to a branch whose last
/// stored event is `last_event_id`. `existing` looks up a stored batch by
/// its first event ID.
pub(crate) fn batches_to_append<'a, F>(
    branch_token: &[u8],
    mut last_event_id: EventId,
    incoming: &'a [EventBatch],
    mut existing: F,
) -> Result<Vec<&'a EventBatch>>
where
    F: FnMut(EventId) -> Result<Option<EventBatch>>,
{
    let mut out = Vec::new();
    for batch in incoming {
        batch.validate()?;
        if batch.first_event_id() <= last_event_id {
            match existing(batch.first_event_id())? {
                Some(stored) if stored == *batch => continue,
                _ => {
                    return Err(Error::ConditionFailed(format!(
                        "batch at {} conflicts with branch {} ending at {}",
                        batch.first_event_id(),
                        hex_token(branch_token),
                        last_event_id
                    )))
                }
            }
        }
        if batch.first_event_id() != last_event_id + 1 {
            return Err(Error::InvalidSequence(format!(
                "batch at {} leaves a hole after event {} on branch {}",
                batch.first_event_id(),
                last_event_id,
                hex_token(branch_token)
            )));
        }
        last_event_id = batch.last_event_id();
        out.push(batch);
    }
    Ok(out)
}

/// Short printable form of a branch token
pub(crate) fn hex_token(token: &[u8]) -> String {
    token.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}
