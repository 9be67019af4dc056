//! Peer admin client over the framed TCP transport

use std::sync::Arc;

use async_trait::async_trait;

use super::NetworkClient;
use crate::error::{Error, Result};
use crate::fetcher::{AdminClient, GetRawHistoryRequest, RawHistoryPage};
use crate::id::RunKey;
use crate::lease::LeaseStats;
use crate::replication::{Message, ReplicationTask};

/// Admin surface of one peer node
pub struct PeerAdminClient {
    address: String,
    client: Arc<NetworkClient>,
}

impl PeerAdminClient {
    pub fn new(address: impl Into<String>, client: Arc<NetworkClient>) -> Self {
        Self {
            address: address.into(),
            client,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn request(&self, message: Message) -> Result<Message> {
        match self.client.send(&self.address, message).await? {
            Message::Error { code, message } => Err(code.into_error(message)),
            response => Ok(response),
        }
    }

    fn unexpected(&self, response: Message) -> Error {
        Error::Network(format!(
            "unexpected {} from {}",
            response.type_name(),
            self.address
        ))
    }

    /// Push tasks onto the peer's ingest queue; returns how many it accepted
    pub async fn replicate_tasks(
        &self,
        source_cluster: &str,
        tasks: Vec<ReplicationTask>,
    ) -> Result<usize> {
        let message = Message::ReplicateTasks {
            source_cluster: source_cluster.to_string(),
            tasks,
        };
        match self.request(message).await? {
            Message::ReplicateTasksResponse { accepted } => Ok(accepted),
            other => Err(self.unexpected(other)),
        }
    }

    /// Task carrying the last batch of a run, and the run's history length
    pub async fn generate_replication_task(
        &self,
        run_key: RunKey,
    ) -> Result<(ReplicationTask, i64)> {
        match self.request(Message::GenerateReplicationTasks { run_key }).await? {
            Message::GenerateReplicationTasksResponse {
                history_length,
                task,
            } => Ok((task, history_length)),
            other => Err(self.unexpected(other)),
        }
    }

    /// Cluster name, lease counters and dead-letter count of the peer
    pub async fn status(&self) -> Result<(String, LeaseStats, usize)> {
        match self.request(Message::StatusRequest).await? {
            Message::StatusResponse {
                cluster_name,
                leases,
                dead_letters,
            } => Ok((cluster_name, leases, dead_letters)),
            other => Err(self.unexpected(other)),
        }
    }
}

#[async_trait]
impl AdminClient for PeerAdminClient {
    async fn get_raw_history(&self, request: GetRawHistoryRequest) -> Result<RawHistoryPage> {
        match self.request(Message::GetRawHistory(request)).await? {
            Message::RawHistory(page) => Ok(page),
            other => Err(self.unexpected(other)),
        }
    }
}
