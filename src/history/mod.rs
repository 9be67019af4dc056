//! Version History Module
//!
//! Pure data model for a run's branching event lineage: events and
//! batches, version histories, and the classification of replicated
//! batches against local state. No I/O happens here.

pub mod event;
mod version;
mod histories;

pub use event::{
    EventAttributes, EventBatch, EventId, HistoryEvent, Version, EMPTY_EVENT_ID, EMPTY_VERSION,
    FIRST_EVENT_ID,
};
pub use version::{VersionHistory, VersionHistoryItem};
pub use histories::{Classification, UpdateMode, VersionHistories};
