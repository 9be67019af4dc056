//! Cluster Metadata
//!
//! Knows the participating clusters and which one authored a given
//! failover version.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{ClusterEntry, ReconcilerConfig};
use crate::error::{Error, Result};
use crate::history::Version;

/// Resolves the cluster that authored events written under a version.
///
/// Injectable so deployments with unusual version schemes can supply
/// their own rule.
pub trait ClusterResolver: Send + Sync {
    /// Name of the cluster authoritative for `version`, if known
    fn cluster_for_version(&self, version: Version) -> Option<String>;
}

impl<F> ClusterResolver for F
where
    F: Fn(Version) -> Option<String> + Send + Sync,
{
    fn cluster_for_version(&self, version: Version) -> Option<String> {
        self(version)
    }
}

/// Information about one participating cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: String,
    pub address: String,
    pub initial_failover_version: Version,
}

/// Static view of all clusters
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    current_cluster: String,
    failover_version_increment: Version,
    clusters: HashMap<String, ClusterInfo>,
}

impl ClusterMetadata {
    /// Build metadata, checking that every cluster owns a distinct residue
    pub fn new(
        current_cluster: impl Into<String>,
        failover_version_increment: Version,
        clusters: Vec<ClusterInfo>,
    ) -> Result<Self> {
        let current_cluster = current_cluster.into();
        if failover_version_increment <= 0 {
            return Err(Error::Config(
                "failover_version_increment must be positive".into(),
            ));
        }

        let mut by_name = HashMap::new();
        for info in clusters {
            if info.initial_failover_version <= 0
                || info.initial_failover_version >= failover_version_increment
            {
                return Err(Error::Config(format!(
                    "cluster {} has initial failover version {} outside 1..{}",
                    info.name, info.initial_failover_version, failover_version_increment
                )));
            }
            if by_name
                .values()
                .any(|c: &ClusterInfo| c.initial_failover_version == info.initial_failover_version)
            {
                return Err(Error::Config(format!(
                    "initial failover version {} is used twice",
                    info.initial_failover_version
                )));
            }
            by_name.insert(info.name.clone(), info);
        }

        if !by_name.contains_key(&current_cluster) {
            return Err(Error::Config(format!(
                "current cluster {} is not in the cluster list",
                current_cluster
            )));
        }

        Ok(Self {
            current_cluster,
            failover_version_increment,
            clusters: by_name,
        })
    }

    /// Build metadata from the node configuration
    pub fn from_config(config: &ReconcilerConfig) -> Result<Self> {
        let clusters = config
            .clusters
            .iter()
            .map(|ClusterEntry { name, address, initial_failover_version }| ClusterInfo {
                name: name.clone(),
                address: address.clone(),
                initial_failover_version: *initial_failover_version,
            })
            .collect();
        Self::new(
            config.node.cluster_name.clone(),
            config.failover_version_increment,
            clusters,
        )
    }

    pub fn current_cluster(&self) -> &str {
        &self.current_cluster
    }

    pub fn is_local(&self, cluster: &str) -> bool {
        self.current_cluster == cluster
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterInfo> {
        self.clusters.get(name)
    }

    /// Remote clusters, sorted by name
    pub fn peers(&self) -> Vec<&ClusterInfo> {
        let mut peers: Vec<&ClusterInfo> = self
            .clusters
            .values()
            .filter(|c| c.name != self.current_cluster)
            .collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }
}

impl ClusterResolver for ClusterMetadata {
    fn cluster_for_version(&self, version: Version) -> Option<String> {
        if version <= 0 {
            return None;
        }
        let residue = version % self.failover_version_increment;
        self.clusters
            .values()
            .find(|c| c.initial_failover_version == residue)
            .map(|c| c.name.clone())
    }
}
