//! Run Identity
//!
//! Identifiers for workflow runs and history branches.
//!
//! A workflow ID may own many runs over its lifetime (reruns,
//! continue-as-new, resets); each attempt is identified by a [`RunKey`].

use serde::{Deserialize, Serialize};

/// Identity of one workflow execution attempt
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub namespace_id: String,
    pub workflow_id: String,
    pub run_id: String,
}

impl RunKey {
    /// Create a run key
    pub fn new(
        namespace_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }

    /// Run key for another run of the same workflow
    pub fn sibling(&self, run_id: impl Into<String>) -> Self {
        Self {
            namespace_id: self.namespace_id.clone(),
            workflow_id: self.workflow_id.clone(),
            run_id: run_id.into(),
        }
    }
}

impl std::fmt::Display for RunKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace_id, self.workflow_id, self.run_id)
    }
}

/// Generate a fresh run ID
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a fresh, opaque branch token for a run's event storage
pub fn new_branch_token() -> Vec<u8> {
    uuid::Uuid::new_v4().as_bytes().to_vec()
}
