//! Engine configuration
//!
//! All sections default sensibly, so a JSON document only needs the fields it
//! overrides:
//!
//! ```json
//! { "access": { "shared_lease_ttl_secs": 30 }, "snapshot": { "compress": true } }
//! ```

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const GRAPH_ID_PLACEHOLDER: &str = "{graph_id}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Object path of a graph's snapshot; `{graph_id}` is substituted
    pub path_template: String,
    /// Lifetime of a shared-mode lease (in seconds)
    pub shared_lease_ttl_secs: u64,
    /// Break foreign leases up front instead of only after a failed acquire
    pub force_exclusive: bool,
}

impl Default for AccessConfig {
    fn default() -> Self {
        AccessConfig {
            path_template: format!("graphs/{}.json", GRAPH_ID_PLACEHOLDER),
            shared_lease_ttl_secs: 60,
            force_exclusive: false,
        }
    }
}

impl AccessConfig {
    pub fn shared_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.shared_lease_ttl_secs)
    }

    pub fn object_path(&self, graph_id: &str) -> String {
        self.path_template.replace(GRAPH_ID_PLACEHOLDER, graph_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub compress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Pending queries buffered per graph worker
    pub queue_depth: usize,
    pub save_after_mutation: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            queue_depth: 64,
            save_after_mutation: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub access: AccessConfig,
    pub snapshot: SnapshotConfig,
    pub host: HostConfig,
}

impl GraphConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: GraphConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.access.path_template.contains(GRAPH_ID_PLACEHOLDER) {
            return Err(GraphError::BadRequest(format!(
                "path_template must contain {}",
                GRAPH_ID_PLACEHOLDER
            )));
        }
        if self.access.shared_lease_ttl_secs == 0 {
            return Err(GraphError::BadRequest("shared_lease_ttl_secs must be positive".to_string()));
        }
        if self.host.queue_depth == 0 {
            return Err(GraphError::BadRequest("queue_depth must be positive".to_string()));
        }
        Ok(())
    }

    pub fn object_path(&self, graph_id: &str) -> String {
        self.access.object_path(graph_id)
    }
}
