//! NDC Reconciliation
//!
//! Applies replicated history from peer clusters to local runs, including
//! backfilling missing ranges and switching lineages after a conflict.

mod backfill;
mod replicator;
mod transaction_manager;
mod workflow;

pub use backfill::BackfillPlan;
pub use replicator::{ApplyOutcome, HistoryReplicator};
pub use transaction_manager::{Archetype, TransactionManager, TransactionManagerImpl};
pub use workflow::Workflow;
