//! Version Histories
//!
//! All lineages known for a run, one of which is current. Incoming
//! replicated lineages are classified against the current one.

use serde::{Deserialize, Serialize};

use super::event::EventId;
use super::version::{VersionHistory, VersionHistoryItem};
use crate::error::{Error, Result};

/// How an incoming batch relates to local history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The run has no local history yet
    NewHistory,
    /// The batch is already part of a local lineage
    Duplicate,
    /// The batch appends directly to the current lineage tail
    Continuation,
    /// The incoming lineage extends the current tail, but the batch starts
    /// after a range that is missing locally
    Gap { tail: VersionHistoryItem },
    /// The incoming lineage diverged from the current one at `lca`
    Fork { lca: VersionHistoryItem },
}

impl Classification {
    /// Commit mode implied by this classification, if it leads to a commit
    pub fn update_mode(&self) -> Option<UpdateMode> {
        match self {
            Classification::Duplicate => None,
            Classification::NewHistory
            | Classification::Continuation
            | Classification::Gap { .. } => Some(UpdateMode::Incremental),
            Classification::Fork { lca } => Some(UpdateMode::Rebuilt { lca: *lca }),
        }
    }
}

/// How a commit changes persisted mutable state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// State was advanced by applying new events
    Incremental,
    /// State was rebuilt from genesis after switching to a forked lineage;
    /// consumers must replace rather than merge
    Rebuilt { lca: VersionHistoryItem },
}

impl UpdateMode {
    pub fn is_rebuilt(&self) -> bool {
        matches!(self, UpdateMode::Rebuilt { .. })
    }
}

/// The set of lineages of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistories {
    current_index: usize,
    histories: Vec<VersionHistory>,
}

impl VersionHistories {
    /// Start with a single, current lineage
    pub fn new(initial: VersionHistory) -> Self {
        Self {
            current_index: 0,
            histories: vec![initial],
        }
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn histories(&self) -> &[VersionHistory] {
        &self.histories
    }

    pub fn current(&self) -> &VersionHistory {
        &self.histories[self.current_index]
    }

    pub fn current_mut(&mut self) -> &mut VersionHistory {
        &mut self.histories[self.current_index]
    }

    pub fn get(&self, index: usize) -> Result<&VersionHistory> {
        self.histories
            .get(index)
            .ok_or_else(|| Error::Internal(format!("no version history at index {}", index)))
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut VersionHistory> {
        self.histories
            .get_mut(index)
            .ok_or_else(|| Error::Internal(format!("no version history at index {}", index)))
    }

    /// Add a lineage, returning its index. An identical lineage is not
    /// stored twice.
    pub fn add_history(&mut self, history: VersionHistory) -> usize {
        if let Some(index) = self.histories.iter().position(|h| h == &history) {
            return index;
        }
        self.histories.push(history);
        self.histories.len() - 1
    }

    /// Make the lineage at `index` current
    pub fn set_current(&mut self, index: usize) -> Result<()> {
        if index >= self.histories.len() {
            return Err(Error::Internal(format!(
                "cannot make index {} current, only {} histories",
                index,
                self.histories.len()
            )));
        }
        self.current_index = index;
        Ok(())
    }

    /// Whether any lineage already holds `item`
    pub fn contains_item(&self, item: VersionHistoryItem) -> bool {
        self.histories.iter().any(|h| h.contains_item(item))
    }

    /// Lineage sharing the deepest common ancestor with `incoming`.
    /// Ties prefer the current lineage.
    pub fn find_lca_index(&self, incoming: &VersionHistory) -> Result<(usize, VersionHistoryItem)> {
        let mut best: Option<(usize, VersionHistoryItem)> = None;

        for (index, history) in self.histories.iter().enumerate() {
            let lca = match history.find_lca(incoming) {
                Ok(lca) => lca,
                Err(Error::NoCommonAncestor) => continue,
                Err(e) => return Err(e),
            };
            let better = match best {
                None => true,
                Some((best_index, best_lca)) => {
                    lca.event_id > best_lca.event_id
                        || (lca.event_id == best_lca.event_id
                            && index == self.current_index
                            && best_index != self.current_index)
                }
            };
            if better {
                best = Some((index, lca));
            }
        }

        best.ok_or(Error::NoCommonAncestor)
    }

    /// Classify a replicated batch.
    ///
    /// `incoming` is the sender's lineage cut at the last event the batch
    /// (or its backfill) brings in. `first_event_id` and `batch_tail` are
    /// the first event and last item of the batch itself.
    pub fn classify(
        &self,
        incoming: &VersionHistory,
        first_event_id: EventId,
        batch_tail: VersionHistoryItem,
    ) -> Result<Classification> {
        if incoming.is_empty() {
            return Err(Error::InvalidSequence("incoming lineage is empty".into()));
        }

        let current = self.current();
        let local_tail = match current.last_item() {
            Some(tail) => tail,
            None => return Ok(Classification::NewHistory),
        };

        if self.contains_item(batch_tail) {
            return Ok(Classification::Duplicate);
        }

        let lca = current.find_lca(incoming)?;
        if lca != local_tail {
            return Ok(Classification::Fork { lca });
        }

        if current.is_continuation(incoming, first_event_id) {
            Ok(Classification::Continuation)
        } else if first_event_id > local_tail.event_id + 1 {
            Ok(Classification::Gap { tail: local_tail })
        } else {
            Err(Error::InvalidSequence(format!(
                "batch starting at {} overlaps local tail {}",
                first_event_id, local_tail
            )))
        }
    }
}
