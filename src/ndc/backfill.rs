//! Backfill planning
//!
//! Decides, for one replicated batch, how far the local copy of the run
//! must reach and where missing events come from.
//!
//! Events written under a remote cluster's version are applied from the
//! batch itself once everything before it is present. Events written
//! under the local cluster's version are ones this cluster lost (it was
//! migrated away and back), so the whole local segment containing the
//! batch is pulled from the peer instead.

use crate::cluster::ClusterResolver;
use crate::error::Result;
use crate::history::{VersionHistory, VersionHistoryItem};
use crate::replication::ReplicationTask;

/// What one apply must fetch and apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillPlan {
    /// Sender's lineage cut at the last event this apply brings in
    pub incoming: VersionHistory,
    /// Inclusive end of any range to fetch
    pub fetch_end: VersionHistoryItem,
    /// The fetched range includes the task's own batch
    pub covers_batch: bool,
    /// Cluster to fetch from
    pub source_cluster: String,
}

impl BackfillPlan {
    pub fn new(
        task: &ReplicationTask,
        local_cluster: &str,
        resolver: &dyn ClusterResolver,
    ) -> Result<Self> {
        let lineage = task.lineage()?;
        let batch_tail = task.events.last_item();
        let locally_authored =
            resolver.cluster_for_version(batch_tail.version).as_deref() == Some(local_cluster);

        let (fetch_end, covers_batch) = if locally_authored {
            (lineage.item_containing(batch_tail.event_id)?, true)
        } else {
            let before = task.events.first_event_id() - 1;
            let version = if before > 0 { lineage.version_at(before)? } else { 0 };
            (VersionHistoryItem::new(before, version), false)
        };

        let incoming_end = if covers_batch { fetch_end } else { batch_tail };
        let incoming = lineage.truncate_through(incoming_end)?;

        let source_cluster = resolver
            .cluster_for_version(fetch_end.version)
            .filter(|cluster| cluster != local_cluster)
            .unwrap_or_else(|| task.source_cluster.clone());

        Ok(Self {
            incoming,
            fetch_end,
            covers_batch,
            source_cluster,
        })
    }

    /// End of the range to fetch after `start`, if anything is missing
    pub fn range_after(&self, start: VersionHistoryItem) -> Option<VersionHistoryItem> {
        (self.fetch_end.event_id > start.event_id).then_some(self.fetch_end)
    }
}
