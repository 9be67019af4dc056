//! NDC Reconciler - Cross-Cluster Workflow History Reconciliation
//!
//! Keeps the history of long-running workflow executions consistent when
//! several clusters may each have written part of it. Replicated event
//! batches from peer clusters are classified against the local lineages
//! of their run, missing ranges are pulled from the authoritative peer,
//! and conflicting lineages are reconciled before the batch is committed.
//!
//! # Architecture
//!
//! Every run carries one or more version histories: ordered checkpoints
//! of the last event written under each failover version. A batch either
//! continues the current lineage, skips ahead of it, diverges from it, or
//! repeats what is already there. All work on a run happens under that
//! run's lease, so concurrent tasks for the same run serialize while
//! different runs proceed in parallel.
//!
//! # Features
//!
//! - Version history model with lowest-common-ancestor fork detection
//! - Run-scoped leases with priority queueing and cancellation
//! - Paginated, gap-checked history fetch from peer clusters
//! - Backfill and migration-back of runs that moved between clusters
//! - Lineage switch with state rebuild when a newer branch wins
//! - In-memory and SQLite execution stores
//! - Framed TCP transport with CRC32-checked bincode messages

pub mod config;
pub mod error;
pub mod id;
pub mod cluster;
pub mod history;
pub mod lease;
pub mod state;
pub mod persistence;
pub mod context;
pub mod fetcher;
pub mod ndc;
pub mod replication;
pub mod network;
pub mod api;

#[cfg(test)]
mod testing;

pub use config::ReconcilerConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ReconcilerConfig;
    pub use crate::error::{Error, Result};
    pub use crate::history::{EventBatch, HistoryEvent, VersionHistory, VersionHistoryItem};
    pub use crate::id::RunKey;
    pub use crate::lease::{LeaseManager, LeasePriority};
    pub use crate::ndc::{ApplyOutcome, HistoryReplicator, TransactionManager};
    pub use crate::replication::{Message, ReplicationTask};
}
