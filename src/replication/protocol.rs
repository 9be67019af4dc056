//! Replication Protocol
//!
//! Defines the wire protocol between reconciler nodes of different
//! clusters.

use serde::{Deserialize, Serialize};

use super::task::ReplicationTask;
use crate::error::Error;
use crate::fetcher::{GetRawHistoryRequest, RawHistoryPage};
use crate::id::RunKey;
use crate::lease::LeaseStats;

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== History Fetch ==========
    /// Request a page of raw history
    GetRawHistory(GetRawHistoryRequest),

    /// One page of raw history
    RawHistory(RawHistoryPage),

    // ========== Replication ==========
    /// Push replication tasks to a node
    ReplicateTasks {
        source_cluster: String,
        tasks: Vec<ReplicationTask>,
    },

    /// Tasks accepted onto the ingest queue
    ReplicateTasksResponse {
        accepted: usize,
    },

    /// Ask a node for the task carrying a run's last batch. An empty
    /// run ID means the workflow's current run.
    GenerateReplicationTasks {
        run_key: RunKey,
    },

    /// The generated task
    GenerateReplicationTasksResponse {
        history_length: i64,
        task: ReplicationTask,
    },

    // ========== Status ==========
    /// Status request
    StatusRequest,

    /// Status response
    StatusResponse {
        cluster_name: String,
        leases: LeaseStats,
        dead_letters: usize,
    },

    // ========== Error ==========
    /// Error response
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Run or history not found
    NotFound,
    /// Malformed or inconsistent request
    InvalidRequest,
    /// Node cannot serve right now
    Unavailable,
    /// Node is shutting down
    ShuttingDown,
    /// Internal error
    Internal,
}

impl ErrorCode {
    /// Code reported to a peer for a local error
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::InvalidSequence(_) | Error::HistoryGap { .. } | Error::NoCommonAncestor => {
                ErrorCode::InvalidRequest
            }
            Error::ShuttingDown => ErrorCode::ShuttingDown,
            e if e.is_retryable() => ErrorCode::Unavailable,
            _ => ErrorCode::Internal,
        }
    }

    /// Local error for a peer's error response
    pub fn into_error(self, message: String) -> Error {
        match self {
            ErrorCode::NotFound => Error::NotFound(message),
            ErrorCode::InvalidRequest => Error::InvalidSequence(message),
            ErrorCode::Unavailable | ErrorCode::ShuttingDown => Error::Unavailable(message),
            ErrorCode::Internal => Error::Internal(message),
        }
    }
}

impl Message {
    /// Error response for a local error
    pub fn error(error: &Error) -> Self {
        Message::Error {
            code: ErrorCode::from_error(error),
            message: error.to_string(),
        }
    }

    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::GetRawHistory(_) => "GetRawHistory",
            Message::RawHistory(_) => "RawHistory",
            Message::ReplicateTasks { .. } => "ReplicateTasks",
            Message::ReplicateTasksResponse { .. } => "ReplicateTasksResponse",
            Message::GenerateReplicationTasks { .. } => "GenerateReplicationTasks",
            Message::GenerateReplicationTasksResponse { .. } => "GenerateReplicationTasksResponse",
            Message::StatusRequest => "StatusRequest",
            Message::StatusResponse { .. } => "StatusResponse",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest accepted message body
    pub const MAX_LENGTH: u32 = 64 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
