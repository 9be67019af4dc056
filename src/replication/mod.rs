//! Replication Module
//!
//! Replication tasks, the wire protocol that carries them between
//! clusters, the worker pool that applies them, and generation of tasks
//! from local runs.

pub mod protocol;
mod task;
mod ingest;
mod generate;

pub use protocol::{ErrorCode, FrameHeader, Message};
pub use task::ReplicationTask;
pub use ingest::{DeadLetter, DeadLetterQueue, IngestSettings, TaskProcessor};
pub use generate::TaskGenerator;
