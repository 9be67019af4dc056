//! Leased workflow handle

use crate::error::{Error, Result};
use crate::history::EventBatch;
use crate::id::RunKey;
use crate::lease::Lease;
use crate::state::MutableState;

/// A run loaded under its lease.
///
/// Holds the mutable state, the persistence token it was read at, and the
/// batches applied since load that the next commit must write. Dropping a
/// handle without calling [`Workflow::release`] still frees the lease but
/// is recorded as abandoned.
pub struct Workflow {
    state: MutableState,
    /// None until the run has a persisted record
    db_version: Option<i64>,
    new_batches: Vec<EventBatch>,
    lease: Option<Lease>,
}

impl Workflow {
    pub fn new(state: MutableState, db_version: Option<i64>, lease: Lease) -> Self {
        Self {
            state,
            db_version,
            new_batches: Vec::new(),
            lease: Some(lease),
        }
    }

    pub fn run_key(&self) -> &RunKey {
        &self.state.run_key
    }

    pub fn mutable_state(&self) -> &MutableState {
        &self.state
    }

    pub fn mutable_state_mut(&mut self) -> &mut MutableState {
        &mut self.state
    }

    /// Whether the run already has a persisted record
    pub fn is_persisted(&self) -> bool {
        self.db_version.is_some()
    }

    pub fn db_version(&self) -> Option<i64> {
        self.db_version
    }

    /// Apply a batch and queue it for the next commit
    pub fn apply_batch(&mut self, batch: EventBatch) -> Result<()> {
        self.state.apply_batch(&batch)?;
        self.new_batches.push(batch);
        Ok(())
    }

    /// Apply a batch that was already written to the current branch
    pub fn apply_backfilled(&mut self, batch: &EventBatch) -> Result<()> {
        self.state.apply_batch(batch)
    }

    /// Swap in state rebuilt from a different lineage. Pending batches
    /// belonged to the old lineage and are dropped.
    pub fn replace_state(&mut self, state: MutableState) {
        self.state = state;
        self.new_batches.clear();
    }

    pub fn new_batches(&self) -> &[EventBatch] {
        &self.new_batches
    }

    /// Record a successful commit at `db_version`
    pub(crate) fn committed(&mut self, db_version: i64) {
        self.db_version = Some(db_version);
        self.new_batches.clear();
    }

    /// Release the lease, reporting the outcome of the work done under it
    pub fn release(mut self, err: Option<&Error>) {
        if let Some(lease) = self.lease.take() {
            lease.release(err);
        }
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("run_key", &self.state.run_key)
            .field("db_version", &self.db_version)
            .field("next_event_id", &self.state.next_event_id)
            .field("pending_batches", &self.new_batches.len())
            .finish()
    }
}
