//! Resource model - typed description of a provisionable unit
//!
//! A [`ResourceNode`] is pure data: kind, name, location, a JSON document
//! and the structural links (parent, explicit dependencies, reference
//! bindings) the graph builder walks. Nodes are created through
//! [`KindRegistry`](crate::kind::KindRegistry), which enforces the kind's
//! naming and region constraints.

use crate::reference::{Binding, ExternalReference};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Symbolic identifier of a node, unique within one graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&NodeId> for NodeId {
    fn from(id: &NodeId) -> Self {
        id.clone()
    }
}

/// Who owns the resource's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Management {
    /// Created and updated by this graph
    Managed,
    /// Deployed elsewhere; read-only, participates in edges only
    External,
}

/// How writes to a resource's children interact with the resource itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildPolicy {
    /// Children can be written concurrently
    #[default]
    Independent,
    /// The control plane treats the parent and all its children as one
    /// optimistic-concurrency unit; child writes must be serialized
    Serialized,
}

/// Link from a child node to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub id: NodeId,
    pub path: String,
}

/// Membership in a numeric-indexed family (e.g. `pip[0]`, `pip[1]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyMember {
    pub family: String,
    pub index: usize,
}

/// An explicit ordering constraint declared by the author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    /// Apply after a single node
    Node(NodeId),
    /// Apply after every member of a family
    Family(String),
}

/// A provisionable unit.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceNode {
    id: NodeId,
    kind: String,
    name: String,
    path: String,
    document: Value,
    parent: Option<ParentRef>,
    depends_on: Vec<Dependency>,
    management: Management,
    child_policy: ChildPolicy,
    family: Option<FamilyMember>,
    bindings: Vec<Binding>,
    unordered: Vec<String>,
}

impl ResourceNode {
    /// Assemble a node. Validation happens in the kind registry.
    pub(crate) fn assemble(
        id: NodeId,
        kind: String,
        name: String,
        document: Value,
        parent: Option<ParentRef>,
        management: Management,
        child_policy: ChildPolicy,
    ) -> Self {
        let path = match &parent {
            Some(p) => format!("{}/{}/{}", p.path, kind, name),
            None => format!("/{}/{}", kind, name),
        };
        Self {
            id,
            kind,
            name,
            path,
            document,
            parent,
            depends_on: Vec::new(),
            management,
            child_policy,
            family: None,
            bindings: Vec::new(),
            unordered: Vec::new(),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deterministic resource identifier: `/{kind}/{name}` nested under the parent.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn location(&self) -> Option<&str> {
        self.document.get("location").and_then(Value::as_str)
    }

    pub fn properties(&self) -> &Value {
        &self.document["properties"]
    }

    /// The comparable document: `{"location": .., "properties": ..}`.
    pub fn document(&self) -> &Value {
        &self.document
    }

    pub(crate) fn document_mut(&mut self) -> &mut Value {
        &mut self.document
    }

    pub fn parent(&self) -> Option<&ParentRef> {
        self.parent.as_ref()
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.depends_on
    }

    pub fn management(&self) -> Management {
        self.management
    }

    pub fn is_managed(&self) -> bool {
        self.management == Management::Managed
    }

    pub fn child_policy(&self) -> ChildPolicy {
        self.child_policy
    }

    pub fn family(&self) -> Option<&FamilyMember> {
        self.family.as_ref()
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub(crate) fn bindings_mut(&mut self) -> &mut [Binding] {
        &mut self.bindings
    }

    /// Bindings still waiting for a provider-computed value.
    pub fn pending_bindings(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter().filter(|b| !b.reference.is_resolved())
    }

    /// Pointers of fields compared as sets rather than sequences.
    pub fn unordered_fields(&self) -> &[String] {
        &self.unordered
    }

    /// Human-readable label, e.g. `firewallPolicies/hub-policy`.
    pub fn label(&self) -> String {
        match &self.family {
            Some(m) => format!("{}/{} [{}#{}]", self.kind, self.name, m.family, m.index),
            None => format!("{}/{}", self.kind, self.name),
        }
    }

    /// Apply strictly after another node.
    pub fn depends_on(mut self, id: impl Into<NodeId>) -> Self {
        let dep = Dependency::Node(id.into());
        if !self.depends_on.contains(&dep) {
            self.depends_on.push(dep);
        }
        self
    }

    /// Apply strictly after every member of a family.
    pub fn depends_on_family(mut self, family: impl Into<String>) -> Self {
        let dep = Dependency::Family(family.into());
        if !self.depends_on.contains(&dep) {
            self.depends_on.push(dep);
        }
        self
    }

    /// Inject the value of `reference` at `pointer` in this node's document.
    pub fn bind(mut self, pointer: impl Into<String>, reference: ExternalReference) -> Self {
        self.bindings.push(Binding::new(pointer, reference));
        self
    }

    /// Mark the node as member `index` of `family`.
    pub fn in_family(mut self, family: impl Into<String>, index: usize) -> Self {
        self.family = Some(FamilyMember {
            family: family.into(),
            index,
        });
        self
    }

    /// Compare the array at `pointer` as a set (sorted and de-duplicated).
    pub fn with_unordered(mut self, pointer: impl Into<String>) -> Self {
        self.unordered.push(pointer.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, kind: &str, name: &str, parent: Option<ParentRef>) -> ResourceNode {
        ResourceNode::assemble(
            id.into(),
            kind.to_string(),
            name.to_string(),
            json!({ "location": "westeurope", "properties": {} }),
            parent,
            Management::Managed,
            ChildPolicy::Independent,
        )
    }

    #[test]
    fn test_path_nests_under_parent() {
        let vnet = node("vnet", "virtualNetworks", "hub", None);
        assert_eq!(vnet.path(), "/virtualNetworks/hub");

        let subnet = node(
            "fw-subnet",
            "subnets",
            "AzureFirewallSubnet",
            Some(ParentRef {
                id: vnet.id().clone(),
                path: vnet.path().to_string(),
            }),
        );
        assert_eq!(
            subnet.path(),
            "/virtualNetworks/hub/subnets/AzureFirewallSubnet"
        );
    }

    #[test]
    fn test_builders_deduplicate_dependencies() {
        let n = node("fw", "azureFirewalls", "fw", None)
            .depends_on("policy")
            .depends_on("policy")
            .depends_on_family("pip")
            .in_family("fw", 0);
        assert_eq!(n.dependencies().len(), 2);
        assert_eq!(n.family().map(|m| m.index), Some(0));
        assert_eq!(n.location(), Some("westeurope"));
        assert_eq!(n.label(), "azureFirewalls/fw [fw#0]");
    }
}
