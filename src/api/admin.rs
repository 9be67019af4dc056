//! Admin Service
//!
//! Answers requests from peer nodes. Raw history is read straight from
//! the store without taking the run's lease.

use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fetcher::{GetRawHistoryRequest, RawHistoryPage};
use crate::history::VersionHistoryItem;
use crate::lease::LeaseManager;
use crate::network::MessageHandler;
use crate::persistence::ExecutionStore;
use crate::replication::{DeadLetterQueue, Message, ReplicationTask, TaskGenerator};

/// Shared service state
pub struct AdminState {
    /// Name of the local cluster
    pub cluster_name: String,
    /// Store raw history is served from
    pub store: Arc<dyn ExecutionStore>,
    /// Lease counters for status
    pub leases: LeaseManager,
    /// Generates migration tasks
    pub generator: TaskGenerator,
    /// Inbound task queue
    pub tasks: mpsc::Sender<ReplicationTask>,
    /// Tasks that were given up on
    pub dead_letters: Arc<DeadLetterQueue>,
    /// Cancelled on node shutdown
    pub shutdown: CancellationToken,
}

/// Request dispatcher for the admin surface
#[derive(Clone)]
pub struct AdminService {
    state: Arc<AdminState>,
}

impl AdminService {
    pub fn new(state: AdminState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Adapt into a network server handler
    pub fn into_handler(self) -> MessageHandler {
        Arc::new(move |peer: String, message: Message| {
            let service = self.clone();
            async move { service.handle(&peer, message).await }.boxed()
        })
    }

    /// Answer one request
    pub async fn handle(&self, peer: &str, message: Message) -> Option<Message> {
        let response = match message {
            Message::GetRawHistory(request) => self
                .get_raw_history(request)
                .await
                .map(Message::RawHistory),
            Message::ReplicateTasks {
                source_cluster,
                tasks,
            } => self
                .replicate_tasks(&source_cluster, tasks)
                .map(|accepted| Message::ReplicateTasksResponse { accepted }),
            Message::GenerateReplicationTasks { run_key } => {
                let ctx = self.state.shutdown.child_token();
                self.state
                    .generator
                    .generate_last_history_task(&ctx, &run_key)
                    .await
                    .map(|(task, history_length)| Message::GenerateReplicationTasksResponse {
                        history_length,
                        task,
                    })
            }
            Message::StatusRequest => Ok(Message::StatusResponse {
                cluster_name: self.state.cluster_name.clone(),
                leases: self.state.leases.stats(),
                dead_letters: self.state.dead_letters.len(),
            }),
            other => Err(Error::InvalidSequence(format!(
                "{} is not a request",
                other.type_name()
            ))),
        };

        Some(response.unwrap_or_else(|e| {
            tracing::debug!("Request from {} failed: {}", peer, e);
            Message::error(&e)
        }))
    }

    async fn get_raw_history(&self, request: GetRawHistoryRequest) -> Result<RawHistoryPage> {
        let start = VersionHistoryItem::new(request.start_event_id, request.start_version);
        let end = VersionHistoryItem::new(request.end_event_id, request.end_version);
        if end.event_id <= start.event_id || request.page_size == 0 {
            return Err(Error::InvalidSequence(format!(
                "bad raw history range ({}, {}] with page size {}",
                start, end, request.page_size
            )));
        }

        let record = self
            .state
            .store
            .get_execution(&request.run_key)
            .await?
            .ok_or_else(|| Error::NotFound(request.run_key.to_string()))?;

        // Serve from whichever lineage holds the requested end
        let history = record
            .state
            .version_histories
            .histories()
            .iter()
            .find(|h| h.contains_item(end))
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("{} has no lineage through {}", request.run_key, end))
            })?;
        if start.event_id > 0 && !history.contains_item(start) {
            return Err(Error::InvalidSequence(format!(
                "{} is not on the lineage of {} through {}",
                start, request.run_key, end
            )));
        }

        let batches = self
            .state
            .store
            .read_history(
                &request.run_key,
                &history.branch_token,
                start.event_id + 1,
                end.event_id,
            )
            .await?;

        let offset = match &request.next_page_token {
            Some(token) => bincode::deserialize::<usize>(token)?,
            None => 0,
        };
        let page_end = offset.saturating_add(request.page_size).min(batches.len());
        let next_page_token = if page_end < batches.len() {
            Some(bincode::serialize(&page_end)?)
        } else {
            None
        };

        Ok(RawHistoryPage {
            batches: batches[offset.min(page_end)..page_end].to_vec(),
            version_history: history,
            next_page_token,
        })
    }

    /// Queue tasks without waiting; stops at the first one that does not fit
    fn replicate_tasks(&self, source_cluster: &str, tasks: Vec<ReplicationTask>) -> Result<usize> {
        let total = tasks.len();
        let mut accepted = 0;
        for task in tasks {
            match self.state.tasks.try_send(task) {
                Ok(()) => accepted += 1,
                Err(mpsc::error::TrySendError::Full(_)) => break,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    if accepted == 0 {
                        return Err(Error::ShuttingDown);
                    }
                    break;
                }
            }
        }

        if accepted < total {
            tracing::warn!(
                "Accepted {} of {} tasks from {}, queue is full",
                accepted,
                total,
                source_cluster
            );
        } else {
            tracing::debug!("Accepted {} tasks from {}", accepted, source_cluster);
        }
        Ok(accepted)
    }
}
