//! Version History
//!
//! A version history is one candidate lineage of a run: an ordered list of
//! `(event_id, version)` checkpoints, each marking the last event written
//! under that version, plus the token of the storage branch holding the
//! events.

use serde::{Deserialize, Serialize};

use super::event::{EventId, Version};
use crate::error::{Error, Result};

/// Last event written under one version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    pub event_id: EventId,
    pub version: Version,
}

impl VersionHistoryItem {
    pub fn new(event_id: EventId, version: Version) -> Self {
        Self { event_id, version }
    }
}

impl std::fmt::Display for VersionHistoryItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.event_id, self.version)
    }
}

/// One lineage of a run's history
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionHistory {
    pub branch_token: Vec<u8>,
    items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    /// Create a history, validating the item sequence
    pub fn new(branch_token: Vec<u8>, items: Vec<VersionHistoryItem>) -> Result<Self> {
        validate_items(&items)?;
        Ok(Self { branch_token, items })
    }

    /// Create an empty history on the given branch
    pub fn empty(branch_token: Vec<u8>) -> Self {
        Self {
            branch_token,
            items: Vec::new(),
        }
    }

    pub fn items(&self) -> &[VersionHistoryItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn last_item(&self) -> Option<VersionHistoryItem> {
        self.items.last().copied()
    }

    /// Last event ID covered by this history (0 when empty)
    pub fn last_event_id(&self) -> EventId {
        self.items.last().map(|i| i.event_id).unwrap_or(0)
    }

    /// Append a checkpoint.
    ///
    /// An item with the same version as the tail advances the tail in place,
    /// so each version segment keeps a single item.
    pub fn append_item(&mut self, item: VersionHistoryItem) -> Result<()> {
        if let Some(last) = self.items.last_mut() {
            if item.event_id <= last.event_id {
                return Err(Error::InvalidSequence(format!(
                    "event id {} does not advance past {}",
                    item.event_id, last
                )));
            }
            if item.version < last.version {
                return Err(Error::InvalidSequence(format!(
                    "version {} is lower than {}",
                    item.version, last
                )));
            }
            if item.version == last.version {
                last.event_id = item.event_id;
                return Ok(());
            }
        } else if item.event_id < 1 {
            return Err(Error::InvalidSequence(format!(
                "event id {} is below the first event id",
                item.event_id
            )));
        }

        self.items.push(item);
        Ok(())
    }

    /// Whether `item` lies on this lineage
    pub fn contains_item(&self, item: VersionHistoryItem) -> bool {
        let mut prev_event_id = 0;
        for current in &self.items {
            if item.version == current.version
                && item.event_id > prev_event_id
                && item.event_id <= current.event_id
            {
                return true;
            }
            prev_event_id = current.event_id;
        }
        false
    }

    /// Version that wrote `event_id` on this lineage
    pub fn version_at(&self, event_id: EventId) -> Result<Version> {
        self.item_containing(event_id).map(|i| i.version)
    }

    /// The checkpoint closing the version segment that covers `event_id`
    pub fn item_containing(&self, event_id: EventId) -> Result<VersionHistoryItem> {
        if event_id < 1 {
            return Err(Error::InvalidSequence(format!(
                "event id {} is not on any lineage",
                event_id
            )));
        }
        self.items
            .iter()
            .find(|i| event_id <= i.event_id)
            .copied()
            .ok_or_else(|| {
                Error::InvalidSequence(format!(
                    "event id {} is beyond lineage tail {}",
                    event_id,
                    self.last_event_id()
                ))
            })
    }

    /// Copy of this lineage cut right after `item`, which must lie on it
    pub fn truncate_through(&self, item: VersionHistoryItem) -> Result<VersionHistory> {
        if !self.contains_item(item) {
            return Err(Error::InvalidSequence(format!(
                "{} is not on the lineage",
                item
            )));
        }

        let mut items: Vec<VersionHistoryItem> = self
            .items
            .iter()
            .take_while(|i| i.event_id < item.event_id)
            .copied()
            .collect();
        items.push(item);

        Ok(VersionHistory {
            branch_token: self.branch_token.clone(),
            items,
        })
    }

    /// Lowest common ancestor of two lineages.
    ///
    /// Walks both tails backwards until the versions match; the shared
    /// point is the smaller event ID of that segment.
    pub fn find_lca(&self, other: &VersionHistory) -> Result<VersionHistoryItem> {
        let mut i = self.items.len();
        let mut j = other.items.len();

        while i > 0 && j > 0 {
            let a = self.items[i - 1];
            let b = other.items[j - 1];
            if a.version == b.version {
                return Ok(VersionHistoryItem::new(a.event_id.min(b.event_id), a.version));
            } else if a.version > b.version {
                i -= 1;
            } else {
                j -= 1;
            }
        }

        Err(Error::NoCommonAncestor)
    }

    /// Whether `other` extends this lineage without forking
    pub fn is_prefix_of(&self, other: &VersionHistory) -> bool {
        match self.last_item() {
            None => true,
            Some(last) => other.contains_item(last),
        }
    }

    /// Whether a batch starting at `first_event_id` with lineage `incoming`
    /// continues this history directly
    pub fn is_continuation(&self, incoming: &VersionHistory, first_event_id: EventId) -> bool {
        !self.is_empty()
            && self.is_prefix_of(incoming)
            && first_event_id == self.last_event_id() + 1
    }
}

fn validate_items(items: &[VersionHistoryItem]) -> Result<()> {
    if let Some(first) = items.first() {
        if first.event_id < 1 {
            return Err(Error::InvalidSequence(format!(
                "first item {} is below the first event id",
                first
            )));
        }
    }
    for pair in items.windows(2) {
        if pair[1].event_id <= pair[0].event_id {
            return Err(Error::InvalidSequence(format!(
                "item {} does not advance past {}",
                pair[1], pair[0]
            )));
        }
        if pair[1].version < pair[0].version {
            return Err(Error::InvalidSequence(format!(
                "item {} lowers the version of {}",
                pair[1], pair[0]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(event_id: EventId, version: Version) -> VersionHistoryItem {
        VersionHistoryItem::new(event_id, version)
    }

    fn history(items: &[(EventId, Version)]) -> VersionHistory {
        VersionHistory::new(
            b"branch".to_vec(),
            items.iter().map(|&(e, v)| item(e, v)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_append_item_monotonic() {
        let mut h = VersionHistory::empty(b"b".to_vec());
        h.append_item(item(5, 1)).unwrap();
        h.append_item(item(7, 1)).unwrap();
        h.append_item(item(10, 2)).unwrap();
        assert_eq!(h.items(), &[item(7, 1), item(10, 2)]);

        assert!(matches!(h.append_item(item(10, 3)), Err(Error::InvalidSequence(_))));
        assert!(matches!(h.append_item(item(12, 1)), Err(Error::InvalidSequence(_))));
        assert_eq!(h.last_item(), Some(item(10, 2)));
    }

    #[test]
    fn test_new_rejects_invalid_sequences() {
        assert!(VersionHistory::new(vec![], vec![item(5, 2), item(5, 3)]).is_err());
        assert!(VersionHistory::new(vec![], vec![item(5, 2), item(6, 1)]).is_err());
        assert!(VersionHistory::new(vec![], vec![item(5, 1), item(7, 1)]).is_ok());
    }

    #[test]
    fn test_contains_and_version_at() {
        let h = history(&[(5, 1), (10, 2), (12, 11)]);
        assert!(h.contains_item(item(3, 1)));
        assert!(h.contains_item(item(10, 2)));
        assert!(!h.contains_item(item(5, 2)));
        assert!(!h.contains_item(item(13, 11)));

        assert_eq!(h.version_at(6).unwrap(), 2);
        assert_eq!(h.item_containing(9).unwrap(), item(10, 2));
        assert!(h.version_at(13).is_err());
    }

    #[test]
    fn test_truncate_through() {
        let h = history(&[(5, 1), (10, 2), (12, 11), (15, 12)]);
        let cut = h.truncate_through(item(8, 2)).unwrap();
        assert_eq!(cut.items(), &[item(5, 1), item(8, 2)]);
        assert!(h.truncate_through(item(8, 1)).is_err());
    }

    #[test]
    fn test_find_lca() {
        let local = history(&[(5, 1), (7, 1)]);
        let incoming = history(&[(5, 1), (10, 2)]);
        assert_eq!(local.find_lca(&incoming).unwrap(), item(5, 1));
        assert_eq!(incoming.find_lca(&local).unwrap(), item(5, 1));

        let a = history(&[(3, 1), (6, 4)]);
        let b = history(&[(4, 2)]);
        assert!(matches!(a.find_lca(&b), Err(Error::NoCommonAncestor)));
    }

    #[test]
    fn test_is_continuation() {
        let local = history(&[(5, 1)]);
        let incoming = history(&[(5, 1), (10, 2)]);
        assert!(local.is_continuation(&incoming, 6));
        assert!(!local.is_continuation(&incoming, 8));

        let forked = history(&[(4, 1), (10, 2)]);
        assert!(!local.is_continuation(&forked, 6));
    }
}
