//! Reference resolver - structural bindings between resources
//!
//! A node never refers to another node by string-matching identifiers.
//! Instead it carries [`Binding`]s: "put attribute X of node T at pointer P
//! of my document". The resolver turns each binding into a concrete value:
//!
//! - `External` targets are read through a [`LiveStateQuery`]; a missing
//!   target is a missing prerequisite deployment and is fatal.
//! - `Managed` targets are a local lookup. Fields the author did not write
//!   are provider-computed outputs, so the binding stays *deferred* until the
//!   executor has the target's post-apply document.
//!
//! Resolution is cached per `(target, attribute)`, so resolving the same
//! reference twice within a run returns the same value.

use crate::client::CloudClient;
use crate::error::{CloudError, Error, Result};
use crate::node::{NodeId, ResourceNode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Which output of the target a reference reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "pointer")]
pub enum Attribute {
    /// The target's deterministic resource path
    Id,
    /// A field of the target's document, as a JSON pointer
    Property(String),
}

/// A lazy binding to another resource's output attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExternalReference {
    pub target: NodeId,
    pub target_kind: String,
    pub attribute: Attribute,
    resolved: bool,
    value: Option<Value>,
}

impl ExternalReference {
    pub fn new(target: impl Into<NodeId>, target_kind: impl Into<String>, attribute: Attribute) -> Self {
        Self {
            target: target.into(),
            target_kind: target_kind.into(),
            attribute,
            resolved: false,
            value: None,
        }
    }

    /// Reference the target's resource id.
    pub fn id_of(target: impl Into<NodeId>, target_kind: impl Into<String>) -> Self {
        Self::new(target, target_kind, Attribute::Id)
    }

    /// Reference a field of the target's document.
    pub fn property_of(
        target: impl Into<NodeId>,
        target_kind: impl Into<String>,
        pointer: impl Into<String>,
    ) -> Self {
        Self::new(target, target_kind, Attribute::Property(pointer.into()))
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub(crate) fn mark_resolved(&mut self, value: Value) {
        self.resolved = true;
        self.value = Some(value);
    }
}

/// Where a reference's value lands in the dependent node's document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binding {
    pub pointer: String,
    pub reference: ExternalReference,
}

impl Binding {
    pub fn new(pointer: impl Into<String>, reference: ExternalReference) -> Self {
        Self {
            pointer: pointer.into(),
            reference,
        }
    }
}

/// Outcome of resolving one reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Value(Value),
    /// Provider-computed; known once the target has been applied
    Deferred,
}

/// Synchronous read access to live control-plane state.
pub trait LiveStateQuery {
    fn query(&self, kind: &str, path: &str) -> std::result::Result<Option<Value>, CloudError>;

    /// Id that an [`Attribute::Id`] reference to `path` resolves to.
    fn resource_id(&self, path: &str) -> String {
        path.to_string()
    }
}

impl<T: CloudClient + ?Sized> LiveStateQuery for T {
    fn query(&self, kind: &str, path: &str) -> std::result::Result<Option<Value>, CloudError> {
        self.get(kind, path)
    }

    fn resource_id(&self, path: &str) -> String {
        CloudClient::resource_id(self, path)
    }
}

/// Resolves references against one graph's nodes.
pub struct Resolver<'a, Q: LiveStateQuery + ?Sized> {
    nodes: HashMap<&'a NodeId, &'a ResourceNode>,
    query: &'a Q,
    cache: HashMap<(NodeId, Attribute), Resolution>,
    live: HashMap<NodeId, Option<Value>>,
    visiting: Vec<NodeId>,
}

impl<'a, Q: LiveStateQuery + ?Sized> Resolver<'a, Q> {
    pub fn new(nodes: &'a [ResourceNode], query: &'a Q) -> Self {
        Self {
            nodes: nodes.iter().map(|n| (n.id(), n)).collect(),
            query,
            cache: HashMap::new(),
            live: HashMap::new(),
            visiting: Vec::new(),
        }
    }

    /// Resolve `reference`, held by node `from`.
    pub fn resolve(&mut self, from: &NodeId, reference: &ExternalReference) -> Result<Resolution> {
        let key = (reference.target.clone(), reference.attribute.clone());
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }

        let target = *self
            .nodes
            .get(&reference.target)
            .ok_or_else(|| Error::DanglingReference {
                from: from.clone(),
                target: reference.target.clone(),
            })?;

        if target.kind() != reference.target_kind {
            return Err(Error::validation(
                format!("{} reference to {}", from, target.id()),
                format!(
                    "expected kind {}, target is {}",
                    reference.target_kind,
                    target.kind()
                ),
            ));
        }

        let resolution = if target.is_managed() {
            self.resolve_managed(target, &reference.attribute)?
        } else {
            self.resolve_external(from, target, &reference.attribute)?
        };

        self.cache.insert(key, resolution.clone());
        Ok(resolution)
    }

    fn resolve_external(
        &mut self,
        from: &NodeId,
        target: &ResourceNode,
        attribute: &Attribute,
    ) -> Result<Resolution> {
        if !self.live.contains_key(target.id()) {
            log::debug!("Querying live state of {}", target.path());
            let doc = self.query.query(target.kind(), target.path())?;
            self.live.insert(target.id().clone(), doc);
        }

        let Some(Some(doc)) = self.live.get(target.id()) else {
            return Err(Error::UnresolvedReference {
                from: from.clone(),
                kind: target.kind().to_string(),
                path: target.path().to_string(),
            });
        };

        match attribute {
            Attribute::Id => Ok(Resolution::Value(Value::String(
                self.query.resource_id(target.path()),
            ))),
            Attribute::Property(pointer) => doc
                .pointer(pointer)
                .cloned()
                .map(Resolution::Value)
                .ok_or_else(|| {
                    Error::validation(
                        format!("{} reference to {}", from, target.id()),
                        format!("existing {} has no field {}", target.path(), pointer),
                    )
                }),
        }
    }

    fn resolve_managed(&mut self, target: &'a ResourceNode, attribute: &Attribute) -> Result<Resolution> {
        let pointer = match attribute {
            Attribute::Id => {
                return Ok(Resolution::Value(Value::String(
                    self.query.resource_id(target.path()),
                )));
            }
            Attribute::Property(pointer) => pointer,
        };

        // The field may itself be filled by one of the target's bindings.
        if let Some(binding) = target
            .bindings()
            .iter()
            .find(|b| covers(&b.pointer, pointer))
        {
            if self.visiting.contains(target.id()) {
                let mut cycle = self.visiting.clone();
                cycle.push(target.id().clone());
                return Err(Error::CycleDetected { cycle });
            }
            self.visiting.push(target.id().clone());
            let inner = self.resolve(target.id(), &binding.reference);
            self.visiting.pop();

            return match inner? {
                Resolution::Deferred => Ok(Resolution::Deferred),
                Resolution::Value(value) => {
                    let rest = &pointer[binding.pointer.len()..];
                    if rest.is_empty() {
                        Ok(Resolution::Value(value))
                    } else {
                        value.pointer(rest).cloned().map(Resolution::Value).ok_or_else(|| {
                            Error::validation(
                                format!("reference to {}", target.id()),
                                format!("bound value has no field {}", rest),
                            )
                        })
                    }
                }
            };
        }

        match target.document().pointer(pointer) {
            Some(value) => Ok(Resolution::Value(value.clone())),
            None => {
                log::debug!(
                    "{}{} is provider-computed; deferring until apply",
                    target.id(),
                    pointer
                );
                Ok(Resolution::Deferred)
            }
        }
    }
}

/// Whether binding pointer `outer` produces the field at `pointer`.
fn covers(outer: &str, pointer: &str) -> bool {
    pointer == outer
        || (pointer.starts_with(outer) && pointer[outer.len()..].starts_with('/'))
}

/// Resolve every binding of every node and inject the values.
///
/// Bindings on provider-computed outputs stay pending; returns how many.
pub fn resolve_all<Q: LiveStateQuery + ?Sized>(
    nodes: &mut [ResourceNode],
    query: &Q,
) -> Result<usize> {
    let mut resolved: Vec<(usize, usize, Value)> = Vec::new();
    let mut deferred = 0;

    {
        let mut resolver = Resolver::new(&*nodes, query);
        for (ni, node) in nodes.iter().enumerate() {
            for (bi, binding) in node.bindings().iter().enumerate() {
                if binding.reference.is_resolved() {
                    continue;
                }
                match resolver.resolve(node.id(), &binding.reference)? {
                    Resolution::Value(value) => resolved.push((ni, bi, value)),
                    Resolution::Deferred => deferred += 1,
                }
            }
        }
    }

    for (ni, bi, value) in resolved {
        apply_binding(&mut nodes[ni], bi, value)?;
    }
    for node in nodes.iter_mut() {
        normalize_unordered(node);
    }

    Ok(deferred)
}

/// Inject a resolved value for binding `index` of `node`.
pub(crate) fn apply_binding(node: &mut ResourceNode, index: usize, value: Value) -> Result<()> {
    let pointer = node.bindings()[index].pointer.clone();
    inject(node.document_mut(), &pointer, value.clone())
        .map_err(|message| Error::validation(format!("{} binding {}", node.id(), pointer), message))?;
    node.bindings_mut()[index].reference.mark_resolved(value);
    Ok(())
}

/// Sort and de-duplicate every field the node compares as a set.
pub(crate) fn normalize_unordered(node: &mut ResourceNode) {
    let fields = node.unordered_fields().to_vec();
    normalize_document(node.document_mut(), &fields);
}

pub(crate) fn normalize_document(doc: &mut Value, fields: &[String]) {
    for pointer in fields {
        if let Some(Value::Array(items)) = doc.pointer_mut(pointer) {
            items.sort_by_key(Value::to_string);
            items.dedup();
        }
    }
}

/// Write `value` at `pointer`, creating intermediate containers.
///
/// Missing containers become arrays when the next token is an index and
/// objects otherwise. Arrays are padded with `null` up to the index.
pub(crate) fn inject(doc: &mut Value, pointer: &str, value: Value) -> std::result::Result<(), String> {
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(format!("'{pointer}' is not a JSON pointer"));
    };
    let tokens: Vec<String> = rest.split('/').map(unescape).collect();

    let mut current = doc;
    for (i, token) in tokens.iter().enumerate() {
        let last = i + 1 == tokens.len();
        let next_is_index = tokens
            .get(i + 1)
            .is_some_and(|t| t.parse::<usize>().is_ok());
        let empty = if next_is_index {
            Value::Array(Vec::new())
        } else {
            Value::Object(serde_json::Map::new())
        };

        current = match current {
            Value::Object(map) => {
                if last {
                    map.insert(token.clone(), value);
                    return Ok(());
                }
                let slot = map.entry(token.clone()).or_insert(Value::Null);
                if slot.is_null() {
                    *slot = empty;
                }
                slot
            }
            Value::Array(items) => {
                let index: usize = token
                    .parse()
                    .map_err(|_| format!("'{token}' is not an array index"))?;
                if items.len() <= index {
                    items.resize(index + 1, Value::Null);
                }
                if last {
                    items[index] = value;
                    return Ok(());
                }
                if items[index].is_null() {
                    items[index] = empty;
                }
                &mut items[index]
            }
            other => return Err(format!("cannot descend into {other} at '{token}'")),
        };
    }

    Err(format!("'{pointer}' is empty"))
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{KindRegistry, KindSpec, NodeSpec};
    use crate::testing::MockCloud;
    use serde_json::json;

    fn registry() -> KindRegistry {
        let mut r = KindRegistry::new();
        r.register(KindSpec::new("virtualNetworks").serialize_children());
        r.register(KindSpec::new("subnets").child_resource());
        r.register(KindSpec::new("ipGroups"));
        r.register(KindSpec::new("userAssignedIdentities"));
        r.register(KindSpec::new("roleAssignments"));
        r
    }

    fn spoke(r: &KindRegistry) -> Vec<ResourceNode> {
        let vnet = r.external("spoke", "virtualNetworks", "spoke-vnet", None).unwrap();
        let a = r.external("app", "subnets", "app", Some(&vnet)).unwrap();
        let b = r.external("data", "subnets", "data", Some(&vnet)).unwrap();
        vec![vnet, a, b]
    }

    fn ip_group(r: &KindRegistry, subnets: &[&str]) -> ResourceNode {
        let mut node = r
            .construct(NodeSpec::new("ipg", "ipGroups", "spokes").location("westeurope"))
            .unwrap()
            .with_unordered("/properties/ipAddresses");
        for (i, s) in subnets.iter().enumerate() {
            node = node.bind(
                format!("/properties/ipAddresses/{i}"),
                ExternalReference::property_of(*s, "subnets", "/properties/addressPrefix"),
            );
        }
        node
    }

    fn cloud() -> MockCloud {
        let cloud = MockCloud::new();
        cloud.seed(
            "/virtualNetworks/spoke-vnet/subnets/app",
            json!({ "properties": { "addressPrefix": "10.2.0.0/24" } }),
        );
        cloud.seed(
            "/virtualNetworks/spoke-vnet/subnets/data",
            json!({ "properties": { "addressPrefix": "10.1.0.0/24" } }),
        );
        cloud
    }

    #[test]
    fn test_resolves_live_subnet_prefixes_into_ip_group() {
        let r = registry();
        let mut nodes = spoke(&r);
        nodes.push(ip_group(&r, &["app", "data"]));

        let deferred = resolve_all(&mut nodes, &cloud()).unwrap();
        assert_eq!(deferred, 0);

        let ipg = &nodes[3];
        assert_eq!(
            ipg.properties()["ipAddresses"],
            json!(["10.1.0.0/24", "10.2.0.0/24"])
        );
        assert!(ipg.bindings().iter().all(|b| b.reference.is_resolved()));
    }

    #[test]
    fn test_missing_existing_resource_is_unresolved() {
        let r = registry();
        let mut nodes = spoke(&r);
        nodes.push(ip_group(&r, &["app"]));

        let err = resolve_all(&mut nodes, &MockCloud::new()).unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference { .. }));
    }

    #[test]
    fn test_unknown_target_is_dangling() {
        let r = registry();
        let mut nodes = vec![ip_group(&r, &["ghost"])];
        let err = resolve_all(&mut nodes, &MockCloud::new()).unwrap_err();
        assert!(matches!(err, Error::DanglingReference { .. }));
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let r = registry();
        let mut nodes = spoke(&r);
        let bad = r
            .construct(NodeSpec::new("ipg", "ipGroups", "spokes").location("westeurope"))
            .unwrap()
            .bind(
                "/properties/ipAddresses/0",
                ExternalReference::property_of("app", "virtualNetworks", "/properties/addressPrefix"),
            );
        nodes.push(bad);
        assert!(matches!(
            resolve_all(&mut nodes, &cloud()),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_resolution_is_cached_per_run() {
        let r = registry();
        let nodes = spoke(&r);
        let cloud = cloud();
        let mut resolver = Resolver::new(&nodes, &cloud);
        let reference = ExternalReference::property_of("app", "subnets", "/properties/addressPrefix");

        let first = resolver.resolve(&"x".into(), &reference).unwrap();
        cloud.seed(
            "/virtualNetworks/spoke-vnet/subnets/app",
            json!({ "properties": { "addressPrefix": "10.9.0.0/24" } }),
        );
        let second = resolver.resolve(&"y".into(), &reference).unwrap();

        assert_eq!(first, second);
        assert_eq!(cloud.get_calls(), 1);
    }

    #[test]
    fn test_managed_outputs_are_deferred_and_ids_are_local() {
        let r = registry();
        let identity = r
            .construct(
                NodeSpec::new("id", "userAssignedIdentities", "fw-identity").location("westeurope"),
            )
            .unwrap();
        let assignment = r
            .construct(NodeSpec::new("ra", "roleAssignments", "reader").location("westeurope"))
            .unwrap()
            .bind(
                "/properties/principalId",
                ExternalReference::property_of("id", "userAssignedIdentities", "/properties/principalId"),
            )
            .bind(
                "/properties/scope",
                ExternalReference::id_of("id", "userAssignedIdentities"),
            );
        let mut nodes = vec![identity, assignment];
        let cloud = MockCloud::new();

        let deferred = resolve_all(&mut nodes, &cloud).unwrap();
        assert_eq!(deferred, 1);
        assert_eq!(
            nodes[1].properties()["scope"],
            "/userAssignedIdentities/fw-identity"
        );
        assert_eq!(nodes[1].pending_bindings().count(), 1);
        assert_eq!(cloud.get_calls(), 0);
    }

    #[test]
    fn test_id_references_use_the_query_scope() {
        struct Scoped(MockCloud);

        impl LiveStateQuery for Scoped {
            fn query(&self, kind: &str, path: &str) -> std::result::Result<Option<Value>, CloudError> {
                self.0.get(kind, path)
            }

            fn resource_id(&self, path: &str) -> String {
                format!("/subscriptions/s1/resourceGroups/hub{path}")
            }
        }

        let r = registry();
        let mut nodes = spoke(&r);
        let identity = r
            .construct(
                NodeSpec::new("id", "userAssignedIdentities", "fw-identity").location("westeurope"),
            )
            .unwrap();
        let assignment = r
            .construct(NodeSpec::new("ra", "roleAssignments", "reader").location("westeurope"))
            .unwrap()
            .bind("/properties/scope", ExternalReference::id_of("id", "userAssignedIdentities"))
            .bind("/properties/subnet", ExternalReference::id_of("app", "subnets"));
        nodes.push(identity);
        nodes.push(assignment);

        let cloud = MockCloud::new();
        cloud.seed("/virtualNetworks/spoke-vnet/subnets/app", json!({ "properties": {} }));
        resolve_all(&mut nodes, &Scoped(cloud)).unwrap();

        let props = nodes[4].properties();
        assert_eq!(
            props["scope"],
            "/subscriptions/s1/resourceGroups/hub/userAssignedIdentities/fw-identity"
        );
        assert_eq!(
            props["subnet"],
            "/subscriptions/s1/resourceGroups/hub/virtualNetworks/spoke-vnet/subnets/app"
        );
    }

    #[test]
    fn test_chained_binding_resolves_through_target() {
        let r = registry();
        let mut nodes = spoke(&r);
        let first = r
            .construct(NodeSpec::new("g1", "ipGroups", "first").location("westeurope"))
            .unwrap()
            .bind(
                "/properties/ipAddresses/0",
                ExternalReference::property_of("app", "subnets", "/properties/addressPrefix"),
            );
        let second = r
            .construct(NodeSpec::new("g2", "ipGroups", "second").location("westeurope"))
            .unwrap()
            .bind(
                "/properties/mirror",
                ExternalReference::property_of("g1", "ipGroups", "/properties/ipAddresses/0"),
            );
        nodes.push(first);
        nodes.push(second);

        resolve_all(&mut nodes, &cloud()).unwrap();
        assert_eq!(nodes[4].properties()["mirror"], "10.2.0.0/24");
    }

    #[test]
    fn test_inject_creates_containers() {
        let mut doc = json!({ "properties": {} });
        inject(&mut doc, "/properties/ipConfigurations/0/properties/subnet/id", json!("/s")).unwrap();
        inject(&mut doc, "/properties/addresses/2", json!("c")).unwrap();
        assert_eq!(
            doc,
            json!({
                "properties": {
                    "ipConfigurations": [{ "properties": { "subnet": { "id": "/s" } } }],
                    "addresses": [null, null, "c"]
                }
            })
        );
        assert!(inject(&mut doc, "properties", json!(1)).is_err());
        assert!(inject(&mut doc, "/properties/addresses/x", json!(1)).is_err());
    }
}
