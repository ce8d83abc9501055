//! Cloud resource API abstraction
//!
//! The engine never talks to a provider directly. Implement [`CloudClient`]
//! to plug in a control plane; this allows us to:
//! - drive a real REST endpoint
//! - simulate a control plane from a local file
//! - script failures in tests

use crate::error::CloudError;
use crate::node::ResourceNode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A create-or-update request for one resource.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyRequest {
    pub kind: String,
    pub name: String,
    pub path: String,
    pub parent_path: Option<String>,
    /// Full desired document (`location` + `properties`)
    pub document: Value,
}

impl ApplyRequest {
    /// Build a request from a node and its fully resolved document.
    pub fn for_node(node: &ResourceNode, document: Value) -> Self {
        Self {
            kind: node.kind().to_string(),
            name: node.name().to_string(),
            path: node.path().to_string(),
            parent_path: node.parent().map(|p| p.path.clone()),
            document,
        }
    }
}

/// What the control plane did with a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Created,
    Updated,
}

/// Response to a successful create-or-update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResponse {
    /// Provider resource id
    pub id: String,
    pub outcome: WriteOutcome,
    /// Document as stored by the provider, including computed fields
    pub document: Value,
}

/// Operations the engine needs from a control plane.
///
/// Both calls are blocking and may be invoked concurrently from the
/// executor's worker pool.
pub trait CloudClient: Send + Sync {
    /// Idempotent create-or-update. Never create-only.
    fn create_or_update(&self, request: &ApplyRequest) -> Result<ApplyResponse, CloudError>;

    /// Read the live document, or `None` if the resource does not exist.
    fn get(&self, kind: &str, path: &str) -> Result<Option<Value>, CloudError>;

    /// Provider id of the resource at `path`, as other documents refer to it.
    fn resource_id(&self, path: &str) -> String {
        path.to_string()
    }
}
