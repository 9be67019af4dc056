//! Reconciler Configuration
//!
//! This module provides configuration structures for a reconciler node:
//! its own cluster identity, the peer clusters it replicates with, and
//! the tuning of the replication worker pool.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Failover version increment shared by all clusters
    #[serde(default = "default_failover_version_increment")]
    pub failover_version_increment: i64,

    /// All participating clusters, including this one
    #[serde(default)]
    pub clusters: Vec<ClusterEntry>,

    /// Replication worker configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Execution store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name of the cluster this node belongs to
    pub cluster_name: String,

    /// Address to bind for peer communication
    pub bind_address: String,

    /// Data directory for the execution store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// One participating cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEntry {
    /// Cluster name
    pub name: String,

    /// Admin address of the cluster (host:port)
    pub address: String,

    /// Initial failover version; versions congruent to it modulo the
    /// increment were written by this cluster
    pub initial_failover_version: i64,
}

/// Replication worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Number of parallel apply workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the inbound task queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Page size for remote history fetches
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Attempts per task before dead-lettering a retryable failure
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry backoff in milliseconds (doubles per attempt)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Maximum retry backoff in milliseconds
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,

    /// Deadline for one apply attempt in milliseconds
    #[serde(default = "default_reconcile_timeout_ms")]
    pub reconcile_timeout_ms: u64,

    /// Peer connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Peer request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Execution store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

/// Execution store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend to use
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_failover_version_increment() -> i64 {
    10
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_page_size() -> usize {
    100
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_max_retry_backoff_ms() -> u64 {
    10_000
}

fn default_reconcile_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/ndc-reconciler")
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            page_size: default_page_size(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            reconcile_timeout_ms: default_reconcile_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ReconcilerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ReconcilerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.cluster_name.is_empty() {
            return Err(crate::Error::Config("node.cluster_name cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if !self.clusters.iter().any(|c| c.name == self.node.cluster_name) {
            return Err(crate::Error::Config(format!(
                "cluster {} must be listed in [[clusters]]",
                self.node.cluster_name
            )));
        }

        if self.replication.workers == 0 {
            return Err(crate::Error::Config("replication.workers must be at least 1".into()));
        }

        if self.replication.page_size == 0 {
            return Err(crate::Error::Config("replication.page_size must be at least 1".into()));
        }

        if self.replication.max_attempts == 0 {
            return Err(crate::Error::Config("replication.max_attempts must be at least 1".into()));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Path of the SQLite execution store
    pub fn store_path(&self) -> PathBuf {
        self.node.data_dir.join("executions.db")
    }

    /// Deadline for one apply attempt
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.reconcile_timeout_ms)
    }

    /// Peer connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.connect_timeout_ms)
    }

    /// Peer request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.request_timeout_ms)
    }
}
