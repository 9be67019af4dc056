//! Remote History Fetcher
//!
//! Pulls a range of a run's history from a peer cluster, one page at a
//! time, and hands it out batch by batch. The range is exclusive at the
//! start and inclusive at the end; a start of `(0, 0)` means genesis.
//!
//! The iterator checks what it yields: batches must be contiguous, stay
//! inside the range, and the last one must end exactly on the requested
//! end item. A peer that runs dry early produces a [`Error::HistoryGap`].

mod client_bean;

pub use client_bean::ClientBean;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::context::cancellable;
use crate::error::{Error, Result};
use crate::history::{EventBatch, EventId, Version, VersionHistory, VersionHistoryItem};
use crate::id::RunKey;

/// Request for one page of raw history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRawHistoryRequest {
    pub run_key: RunKey,
    /// Exclusive start
    pub start_event_id: EventId,
    pub start_version: Version,
    /// Inclusive end
    pub end_event_id: EventId,
    pub end_version: Version,
    pub page_size: usize,
    pub next_page_token: Option<Vec<u8>>,
}

/// One page of raw history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawHistoryPage {
    pub batches: Vec<EventBatch>,
    /// The peer's lineage that the page was read from
    pub version_history: VersionHistory,
    /// Absent on the last page
    pub next_page_token: Option<Vec<u8>>,
}

/// Admin surface of a peer cluster
#[async_trait]
pub trait AdminClient: Send + Sync {
    async fn get_raw_history(&self, request: GetRawHistoryRequest) -> Result<RawHistoryPage>;
}

/// Fetches history ranges from peers
#[derive(Clone)]
pub struct HistoryPaginatedFetcher {
    clients: Arc<ClientBean>,
    page_size: usize,
}

impl HistoryPaginatedFetcher {
    pub fn new(clients: Arc<ClientBean>, page_size: usize) -> Self {
        Self {
            clients,
            page_size: page_size.max(1),
        }
    }

    /// Iterate the events of `run_key` after `(start_event_id,
    /// start_version)` through `(end_event_id, end_version)` as stored on
    /// `cluster`. Nothing is fetched until the first call to `next`.
    #[allow(clippy::too_many_arguments)]
    pub fn fetch_range_inclusive(
        &self,
        ctx: &CancellationToken,
        cluster: &str,
        run_key: &RunKey,
        start_event_id: EventId,
        start_version: Version,
        end_event_id: EventId,
        end_version: Version,
    ) -> HistoryBatchIterator {
        let request = GetRawHistoryRequest {
            run_key: run_key.clone(),
            start_event_id,
            start_version,
            end_event_id,
            end_version,
            page_size: self.page_size,
            next_page_token: None,
        };
        HistoryBatchIterator {
            ctx: ctx.clone(),
            cluster: cluster.to_string(),
            clients: self.clients.clone(),
            request,
            buffered: VecDeque::new(),
            last_item: None,
            exhausted: false,
            finished: false,
        }
    }
}

/// Single-pass iterator over a fetched history range
pub struct HistoryBatchIterator {
    ctx: CancellationToken,
    cluster: String,
    clients: Arc<ClientBean>,
    /// Carries the next page token between pages
    request: GetRawHistoryRequest,
    buffered: VecDeque<EventBatch>,
    /// Last item yielded so far
    last_item: Option<VersionHistoryItem>,
    /// No more pages to request
    exhausted: bool,
    /// Terminal result already returned
    finished: bool,
}

impl HistoryBatchIterator {
    /// Next batch in the range, `None` once the range is complete
    pub async fn next(&mut self) -> Option<Result<EventBatch>> {
        if self.finished {
            return None;
        }

        let result = self.advance().await;
        match &result {
            Some(Ok(_)) => {}
            Some(Err(_)) | None => self.finished = true,
        }
        result
    }

    /// Adapt into a `Stream`
    pub fn into_stream(self) -> impl Stream<Item = Result<EventBatch>> {
        stream::unfold(self, |mut iter| async move {
            iter.next().await.map(|item| (item, iter))
        })
    }

    fn end(&self) -> VersionHistoryItem {
        VersionHistoryItem::new(self.request.end_event_id, self.request.end_version)
    }

    async fn advance(&mut self) -> Option<Result<EventBatch>> {
        if self.request.end_event_id <= self.request.start_event_id {
            return Some(Err(Error::InvalidSequence(format!(
                "empty fetch range ({}, {}]",
                self.request.start_event_id, self.request.end_event_id
            ))));
        }

        loop {
            if let Some(batch) = self.buffered.pop_front() {
                return Some(self.check(batch));
            }

            if self.exhausted {
                if self.last_item == Some(self.end()) {
                    return None;
                }
                return Some(Err(Error::HistoryGap {
                    expected: self.end(),
                    reached: self.last_item,
                }));
            }

            if let Err(e) = self.fetch_page().await {
                return Some(Err(e));
            }
        }
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let client = self.clients.remote_admin_client(&self.cluster)?;
        let previous_token = self.request.next_page_token.clone();
        let page = cancellable(&self.ctx, client.get_raw_history(self.request.clone())).await?;

        if previous_token.is_none() && !page.version_history.is_empty() {
            let end = self.end();
            if !page.version_history.contains_item(end) {
                return Err(Error::InvalidSequence(format!(
                    "{} does not have {} on its lineage of {}",
                    self.cluster, end, self.request.run_key
                )));
            }
        }

        if page.next_page_token.is_some() && page.next_page_token == previous_token {
            return Err(Error::Network(format!(
                "{} returned the same page token twice",
                self.cluster
            )));
        }

        tracing::debug!(
            "Fetched {} batches of {} from {}",
            page.batches.len(),
            self.request.run_key,
            self.cluster
        );
        self.buffered.extend(page.batches);
        self.exhausted = page.next_page_token.is_none();
        self.request.next_page_token = page.next_page_token;
        Ok(())
    }

    fn check(&mut self, batch: EventBatch) -> Result<EventBatch> {
        batch.validate()?;

        let expected_first = self
            .last_item
            .map(|item| item.event_id)
            .unwrap_or(self.request.start_event_id)
            + 1;
        if batch.first_event_id() != expected_first {
            return Err(Error::HistoryGap {
                expected: self.end(),
                reached: self.last_item,
            });
        }
        if batch.last_event_id() > self.request.end_event_id {
            return Err(Error::InvalidSequence(format!(
                "batch ending at {} runs past requested end {}",
                batch.last_event_id(),
                self.end()
            )));
        }

        self.last_item = Some(batch.last_item());
        Ok(batch)
    }
}
