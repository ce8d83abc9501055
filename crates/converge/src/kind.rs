//! Kind registry - naming and placement constraints per resource kind

use crate::error::{Error, Result};
use crate::node::{ChildPolicy, Management, NodeId, ParentRef, ResourceNode};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};

/// Which regions a kind may be deployed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RegionPolicy {
    #[default]
    Any,
    /// Only the listed regions (e.g. regions with availability zones)
    Only(BTreeSet<String>),
}

impl RegionPolicy {
    pub fn allows(&self, region: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Only(regions) => regions.contains(region),
        }
    }
}

/// Constraints for one resource kind.
#[derive(Debug, Clone)]
pub struct KindSpec {
    kind: String,
    min_len: usize,
    max_len: usize,
    pattern: Option<Regex>,
    regions: RegionPolicy,
    child: bool,
    child_policy: ChildPolicy,
}

impl KindSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            min_len: 1,
            max_len: 80,
            pattern: None,
            regions: RegionPolicy::Any,
            child: false,
            child_policy: ChildPolicy::Independent,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name_length(mut self, min: usize, max: usize) -> Self {
        self.min_len = min;
        self.max_len = max;
        self
    }

    /// Replace the allowed name charset.
    pub fn name_pattern(mut self, pattern: &str) -> Result<Self> {
        let compiled = Regex::new(pattern)
            .map_err(|e| Error::validation(format!("kind {}", self.kind), e.to_string()))?;
        self.pattern = Some(compiled);
        Ok(self)
    }

    pub fn regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = RegionPolicy::Only(regions.into_iter().map(Into::into).collect());
        self
    }

    /// Child resources inherit their parent's location and carry none themselves.
    pub fn child_resource(mut self) -> Self {
        self.child = true;
        self
    }

    /// Writes to this kind's children must never overlap.
    pub fn serialize_children(mut self) -> Self {
        self.child_policy = ChildPolicy::Serialized;
        self
    }

    pub fn validate_name(&self, name: &str) -> Result<()> {
        let len = name.chars().count();
        if len < self.min_len || len > self.max_len {
            return Err(Error::validation(
                format!("{} name '{}'", self.kind, name),
                format!(
                    "length {} is outside {}..={}",
                    len, self.min_len, self.max_len
                ),
            ));
        }
        let (valid, expected) = match &self.pattern {
            Some(re) => (re.is_match(name), re.as_str()),
            None => (
                is_default_name(name),
                "alphanumerics, '_', '.', '-', starting with an alphanumeric",
            ),
        };
        if !valid {
            return Err(Error::validation(
                format!("{} name '{}'", self.kind, name),
                format!("expected {}", expected),
            ));
        }
        Ok(())
    }

    /// Child kinds only exist under a parent.
    pub fn validate_parent(&self, name: &str, has_parent: bool) -> Result<()> {
        if self.child && !has_parent {
            return Err(Error::validation(
                format!("{} '{}'", self.kind, name),
                "a child resource needs a parent",
            ));
        }
        Ok(())
    }

    pub fn validate_location(&self, location: Option<&str>) -> Result<()> {
        match (self.child, location) {
            (true, Some(loc)) => Err(Error::validation(
                format!("{} location", self.kind),
                format!("child resources inherit their location, got '{}'", loc),
            )),
            (true, None) => Ok(()),
            (false, None) => Err(Error::validation(
                format!("{} location", self.kind),
                "a location is required",
            )),
            (false, Some(loc)) if !self.regions.allows(loc) => Err(Error::validation(
                format!("{} location", self.kind),
                format!("region '{}' is not supported for this kind", loc),
            )),
            (false, Some(_)) => Ok(()),
        }
    }
}

/// Alphanumerics, `_`, `.` and `-`; must start with an alphanumeric and
/// must not end with `.` or `-`.
fn is_default_name(name: &str) -> bool {
    let Some(first) = name.chars().next() else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        && !name.ends_with(['.', '-'])
}

/// Input to [`KindRegistry::construct`].
#[derive(Debug, Clone)]
pub struct NodeSpec {
    id: NodeId,
    kind: String,
    name: String,
    location: Option<String>,
    properties: Value,
    parent: Option<ParentRef>,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            name: name.into(),
            location: None,
            properties: Value::Object(Map::new()),
            parent: None,
        }
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }

    pub fn parent(mut self, parent: &ResourceNode) -> Self {
        self.parent = Some(ParentRef {
            id: parent.id().clone(),
            path: parent.path().to_string(),
        });
        self
    }
}

/// Registry of known kinds.
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    specs: HashMap<String, KindSpec>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: KindSpec) {
        self.specs.insert(spec.kind.clone(), spec);
    }

    pub fn get(&self, kind: &str) -> Option<&KindSpec> {
        self.specs.get(kind)
    }

    fn spec(&self, kind: &str) -> Result<&KindSpec> {
        self.get(kind)
            .ok_or_else(|| Error::validation(format!("kind {kind}"), "kind is not registered"))
    }

    /// Construct a managed node, validating name, location and document shape.
    pub fn construct(&self, spec: NodeSpec) -> Result<ResourceNode> {
        let kind = self.spec(&spec.kind)?;
        kind.validate_name(&spec.name)?;
        kind.validate_parent(&spec.name, spec.parent.is_some())?;
        kind.validate_location(spec.location.as_deref())?;

        let properties = match spec.properties {
            Value::Null => Value::Object(Map::new()),
            obj @ Value::Object(_) => obj,
            other => {
                return Err(Error::validation(
                    format!("{} properties", spec.id),
                    format!("expected an object, got {other}"),
                ));
            }
        };

        let mut document = Map::new();
        if let Some(loc) = spec.location {
            document.insert("location".to_string(), Value::String(loc));
        }
        document.insert("properties".to_string(), properties);

        Ok(ResourceNode::assemble(
            spec.id,
            spec.kind,
            spec.name,
            Value::Object(document),
            spec.parent,
            Management::Managed,
            kind.child_policy,
        ))
    }

    /// Declare an existing resource this graph reads but never writes.
    pub fn external(
        &self,
        id: impl Into<NodeId>,
        kind: &str,
        name: &str,
        parent: Option<&ResourceNode>,
    ) -> Result<ResourceNode> {
        let spec = self.spec(kind)?;
        spec.validate_name(name)?;
        spec.validate_parent(name, parent.is_some())?;

        let parent = parent.map(|p| ParentRef {
            id: p.id().clone(),
            path: p.path().to_string(),
        });

        Ok(ResourceNode::assemble(
            id.into(),
            kind.to_string(),
            name.to_string(),
            serde_json::json!({ "properties": {} }),
            parent,
            Management::External,
            spec.child_policy,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> KindRegistry {
        let mut r = KindRegistry::new();
        r.register(
            KindSpec::new("azureFirewalls")
                .name_length(1, 56)
                .regions(["westeurope", "eastus2"]),
        );
        r.register(KindSpec::new("virtualNetworks").serialize_children());
        r.register(KindSpec::new("subnets").child_resource());
        r
    }

    #[test]
    fn test_construct_valid_node() {
        let node = registry()
            .construct(
                NodeSpec::new("fw", "azureFirewalls", "hub-fw")
                    .location("westeurope")
                    .properties(json!({ "sku": { "tier": "Premium" } })),
            )
            .unwrap();
        assert_eq!(node.path(), "/azureFirewalls/hub-fw");
        assert_eq!(node.properties()["sku"]["tier"], "Premium");
        assert!(node.is_managed());
    }

    #[test]
    fn test_rejects_region_without_zones() {
        let err = registry()
            .construct(NodeSpec::new("fw", "azureFirewalls", "hub-fw").location("westus"))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_rejects_bad_names() {
        let r = registry();
        let too_long = "x".repeat(57);
        assert!(
            r.construct(NodeSpec::new("fw", "azureFirewalls", too_long).location("westeurope"))
                .is_err()
        );
        assert!(
            r.construct(NodeSpec::new("fw", "azureFirewalls", "bad/name").location("westeurope"))
                .is_err()
        );
        assert!(
            r.construct(NodeSpec::new("fw", "azureFirewalls", "-lead").location("westeurope"))
                .is_err()
        );
    }

    #[test]
    fn test_custom_name_pattern() {
        let spec = KindSpec::new("roleAssignments")
            .name_pattern(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
            .unwrap();
        assert!(
            spec.validate_name("0b3c1e2a-94f1-4b8e-9d4a-2f1c3e5a7b90")
                .is_ok()
        );
        assert!(spec.validate_name("reader").is_err());
        assert!(KindSpec::new("x").name_pattern("(").is_err());
    }

    #[test]
    fn test_child_location_rules() {
        let r = registry();
        let vnet = r
            .construct(NodeSpec::new("vnet", "virtualNetworks", "hub").location("westeurope"))
            .unwrap();
        assert!(
            r.construct(
                NodeSpec::new("sn", "subnets", "AzureFirewallSubnet")
                    .location("westeurope")
                    .parent(&vnet)
            )
            .is_err()
        );
        let subnet = r
            .construct(NodeSpec::new("sn", "subnets", "AzureFirewallSubnet").parent(&vnet))
            .unwrap();
        assert_eq!(subnet.location(), None);
        assert_eq!(subnet.parent().map(|p| p.id.as_str()), Some("vnet"));
    }

    #[test]
    fn test_child_kind_needs_a_parent() {
        let r = registry();
        let err = r
            .construct(NodeSpec::new("sn", "subnets", "AzureFirewallSubnet"))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("needs a parent"));
        assert!(r.external("sn", "subnets", "app", None).is_err());
    }

    #[test]
    fn test_unknown_kind_and_bad_properties() {
        let r = registry();
        assert!(r.construct(NodeSpec::new("x", "nope", "x")).is_err());
        assert!(
            r.construct(
                NodeSpec::new("vnet", "virtualNetworks", "hub")
                    .location("westeurope")
                    .properties(json!([1, 2]))
            )
            .is_err()
        );
    }

    #[test]
    fn test_external_inherits_child_policy() {
        let r = registry();
        let vnet = r.external("spoke", "virtualNetworks", "spoke-vnet", None).unwrap();
        assert!(!vnet.is_managed());
        assert_eq!(vnet.child_policy(), ChildPolicy::Serialized);
    }
}
