//! Peer admin client registry

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::AdminClient;
use crate::error::{Error, Result};

/// Admin clients of the known peer clusters, by cluster name
#[derive(Default)]
pub struct ClientBean {
    clients: RwLock<HashMap<String, Arc<dyn AdminClient>>>,
}

impl ClientBean {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the client for a cluster
    pub fn register(&self, cluster: impl Into<String>, client: Arc<dyn AdminClient>) {
        let mut clients = self.clients.write().unwrap_or_else(|p| p.into_inner());
        clients.insert(cluster.into(), client);
    }

    /// Client for `cluster`, or `Unavailable` when none is registered
    pub fn remote_admin_client(&self, cluster: &str) -> Result<Arc<dyn AdminClient>> {
        let clients = self.clients.read().unwrap_or_else(|p| p.into_inner());
        clients
            .get(cluster)
            .cloned()
            .ok_or_else(|| Error::Unavailable(format!("no admin client for cluster {}", cluster)))
    }

    /// Registered cluster names
    pub fn clusters(&self) -> Vec<String> {
        let clients = self.clients.read().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = clients.keys().cloned().collect();
        names.sort();
        names
    }
}
