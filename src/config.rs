//! Hub parameters: loading and pre-flight validation

use anyhow::{Context, Result, bail};
use converge::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cidr::Ipv4Cidr;
use crate::topology::rules::{self, RuleGroup};

/// Regions with availability-zone support.
pub const ZONE_REGIONS: &[&str] = &[
    "australiaeast",
    "brazilsouth",
    "canadacentral",
    "centralindia",
    "centralus",
    "eastasia",
    "eastus",
    "eastus2",
    "francecentral",
    "germanywestcentral",
    "japaneast",
    "koreacentral",
    "northeurope",
    "norwayeast",
    "southafricanorth",
    "southcentralus",
    "southeastasia",
    "swedencentral",
    "switzerlandnorth",
    "uaenorth",
    "uksouth",
    "westeurope",
    "westus2",
    "westus3",
];

/// Get the default control-plane state path for the local backend
pub fn default_state_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home
        .join(".local")
        .join("state")
        .join("hubctl")
        .join("control-plane.json"))
}

/// Expand `~` in a user-supplied path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubParameters {
    /// Prefix for every generated resource name
    pub prefix: String,
    pub location: String,
    pub address_space: Ipv4Cidr,
    pub firewall_subnet: Ipv4Cidr,
    /// Required by the Basic tier
    #[serde(default)]
    pub management_subnet: Option<Ipv4Cidr>,
    #[serde(default = "default_public_ip_count")]
    pub public_ip_count: usize,
    #[serde(default)]
    pub firewall: FirewallSettings,
    #[serde(default)]
    pub ip_groups: Vec<IpGroupParams>,
    #[serde(default)]
    pub rule_groups: Vec<RuleGroup>,
    #[serde(default)]
    pub role_assignments: Vec<RoleAssignmentParams>,
    #[serde(default)]
    pub engine: EngineSettings,
}

fn default_public_ip_count() -> usize {
    1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirewallTier {
    Basic,
    #[default]
    Standard,
    Premium,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreatIntelMode {
    Off,
    #[default]
    Alert,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FirewallSettings {
    pub tier: FirewallTier,
    pub zones: Vec<String>,
    pub threat_intel_mode: ThreatIntelMode,
    pub dns_proxy: bool,
}

impl Default for FirewallSettings {
    fn default() -> Self {
        Self {
            tier: FirewallTier::Standard,
            zones: vec!["1".into(), "2".into(), "3".into()],
            threat_intel_mode: ThreatIntelMode::Alert,
            dns_proxy: false,
        }
    }
}

/// An IP group materialized from existing spoke subnets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpGroupParams {
    pub name: String,
    #[serde(default)]
    pub subnets: Vec<SubnetRef>,
}

/// A subnet deployed outside this hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubnetRef {
    pub vnet: String,
    pub subnet: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleScope {
    Firewall,
    Policy,
    VirtualNetwork,
}

/// A role granted to the hub's managed identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleAssignmentParams {
    pub name: String,
    pub role_definition_id: String,
    pub scope: RoleScope,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    pub jobs: Option<usize>,
    pub retry: RetryConfig,
}

impl HubParameters {
    /// Load parameters from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let params: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Invalid TOML in {}", path.display()))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?,
            _ => bail!(
                "Unsupported parameters format: {} (expected .toml or .json)",
                path.display()
            ),
        };
        log::debug!("Loaded parameters from {}", path.display());
        Ok(params)
    }

    /// Load and validate in one step
    pub fn load_validated(path: &Path) -> Result<Self> {
        let params = Self::load(path)?;
        params.validate()?;
        Ok(params)
    }

    /// Every problem found, in declaration order.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.prefix.is_empty()
            || self.prefix.len() > 20
            || !self
                .prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || self.prefix.starts_with('-')
        {
            problems.push(format!(
                "prefix '{}' must be 1-20 lowercase letters, digits or '-'",
                self.prefix
            ));
        }

        if !ZONE_REGIONS.contains(&self.location.as_str()) {
            problems.push(format!(
                "location '{}' has no availability zones",
                self.location
            ));
        }

        self.check_address_plan(&mut problems);

        if self.public_ip_count == 0 {
            problems.push("public_ip_count must be at least 1".to_string());
        }

        let mut zones = BTreeSet::new();
        if self.firewall.zones.is_empty() {
            problems.push("firewall.zones must list at least one zone".to_string());
        }
        for zone in &self.firewall.zones {
            if !matches!(zone.as_str(), "1" | "2" | "3") {
                problems.push(format!("firewall zone '{zone}' must be 1, 2 or 3"));
            }
            if !zones.insert(zone) {
                problems.push(format!("firewall zone '{zone}' is listed twice"));
            }
        }
        if self.firewall.tier == FirewallTier::Basic {
            if self.management_subnet.is_none() {
                problems.push("the Basic tier needs a management_subnet".to_string());
            }
            if self.firewall.dns_proxy {
                problems.push("the Basic tier does not support dns_proxy".to_string());
            }
        }

        let mut ip_group_names = BTreeSet::new();
        for group in &self.ip_groups {
            if !ip_group_names.insert(group.name.clone()) {
                problems.push(format!("IP group '{}' is declared twice", group.name));
            }
            if group.subnets.is_empty() {
                problems.push(format!(
                    "IP group '{}' needs at least one spoke subnet",
                    group.name
                ));
            }
        }

        rules::validate(&self.rule_groups, &ip_group_names, &mut problems);

        let mut assignments = BTreeSet::new();
        for ra in &self.role_assignments {
            if !assignments.insert(ra.name.as_str()) {
                problems.push(format!("role assignment '{}' is declared twice", ra.name));
            }
            if ra.role_definition_id.trim().is_empty() {
                problems.push(format!(
                    "role assignment '{}' needs a role_definition_id",
                    ra.name
                ));
            }
        }

        if self.engine.jobs == Some(0) {
            problems.push("engine.jobs must be at least 1".to_string());
        }
        if self.engine.retry.max_attempts == 0 {
            problems.push("engine.retry.max_attempts must be at least 1".to_string());
        }

        problems
    }

    fn check_address_plan(&self, problems: &mut Vec<String>) {
        let space = self.address_space;
        if !(16..=24).contains(&space.prefix()) {
            problems.push(format!(
                "address_space {space} must be between /16 and /24"
            ));
        }

        let mut subnets = vec![("firewall_subnet", self.firewall_subnet)];
        if let Some(mgmt) = self.management_subnet {
            subnets.push(("management_subnet", mgmt));
        }
        for (field, subnet) in &subnets {
            if subnet.prefix() > 26 {
                problems.push(format!("{field} {subnet} must be /26 or larger"));
            }
            if !space.contains(subnet) {
                problems.push(format!("{field} {subnet} is outside {space}"));
            }
        }
        if let [(_, fw), (_, mgmt)] = subnets[..]
            && fw.overlaps(&mgmt)
        {
            problems.push(format!("management_subnet {mgmt} overlaps {fw}"));
        }
    }

    /// Fail with every problem listed
    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            return Ok(());
        }
        bail!(
            "Invalid parameters ({} problems):\n  - {}",
            problems.len(),
            problems.join("\n  - ")
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const SAMPLE: &str = r#"
prefix = "contoso"
location = "westeurope"
address_space = "10.0.0.0/22"
firewall_subnet = "10.0.0.0/26"
public_ip_count = 3

[firewall]
tier = "Premium"
zones = ["1", "2", "3"]

[[ip_groups]]
name = "spokes"
subnets = [
  { vnet = "spoke-app", subnet = "app" },
  { vnet = "spoke-app", subnet = "data" },
]

[[rule_groups]]
name = "platform"
priority = 200

[[rule_groups.collections]]
name = "allow-dns"
kind = "network"
priority = 100
action = "allow"

[[rule_groups.collections.rules]]
name = "dns"
protocols = ["UDP"]
source_ip_groups = ["spokes"]
destination_addresses = ["168.63.129.16"]
destination_ports = ["53"]

[[rule_groups]]
name = "workloads"
priority = 300

[[rule_groups.collections]]
name = "updates"
kind = "application"
priority = 200
action = "allow"

[[rule_groups.collections.rules]]
name = "ubuntu"
protocols = ["Https:443"]
source_ip_groups = ["spokes"]
target_fqdns = ["*.ubuntu.com"]

[[role_assignments]]
name = "policy-reader"
role_definition_id = "acdd72a7-3385-48ef-bd42-f606fba81ae7"
scope = "policy"

[engine]
jobs = 2
"#;

    pub(crate) fn sample() -> HubParameters {
        toml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_sample_is_valid() {
        let params = sample();
        assert!(params.problems().is_empty(), "{:?}", params.problems());
        assert_eq!(params.firewall.tier, FirewallTier::Premium);
        assert_eq!(params.engine.jobs, Some(2));
        assert_eq!(params.engine.retry, RetryConfig::default());
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("hub.toml");
        fs::write(&toml_path, SAMPLE).unwrap();
        assert_eq!(HubParameters::load(&toml_path).unwrap().prefix, "contoso");

        let json_path = dir.path().join("hub.json");
        let mut f = fs::File::create(&json_path).unwrap();
        write!(f, "{}", serde_json::to_string(&sample()).unwrap()).unwrap();
        assert_eq!(HubParameters::load(&json_path).unwrap().public_ip_count, 3);

        let yaml_path = dir.path().join("hub.yaml");
        fs::write(&yaml_path, "prefix: x").unwrap();
        assert!(HubParameters::load(&yaml_path).is_err());
    }

    #[test]
    fn test_region_without_zones() {
        let mut params = sample();
        params.location = "westus".into();
        assert!(params.problems().iter().any(|p| p.contains("westus")));
    }

    #[test]
    fn test_address_plan_bounds() {
        let mut params = sample();
        params.address_space = "10.0.0.0/8".parse().unwrap();
        params.firewall_subnet = "10.0.0.0/27".parse().unwrap();
        let problems = params.problems();
        assert!(problems.iter().any(|p| p.contains("between /16 and /24")));
        assert!(problems.iter().any(|p| p.contains("/26 or larger")));

        let mut params = sample();
        params.firewall_subnet = "10.9.0.0/26".parse().unwrap();
        assert!(params.problems().iter().any(|p| p.contains("is outside")));
    }

    #[test]
    fn test_basic_tier_needs_management_subnet() {
        let mut params = sample();
        params.firewall.tier = FirewallTier::Basic;
        assert!(params.problems().iter().any(|p| p.contains("management_subnet")));

        params.management_subnet = Some("10.0.0.0/26".parse().unwrap());
        assert!(params.problems().iter().any(|p| p.contains("overlaps")));

        params.management_subnet = Some("10.0.0.64/26".parse().unwrap());
        assert!(params.problems().is_empty());
    }

    #[test]
    fn test_minimum_lengths() {
        let mut params = sample();
        params.public_ip_count = 0;
        params.ip_groups[0].subnets.clear();
        let problems = params.problems();
        assert!(problems.iter().any(|p| p.contains("public_ip_count")));
        assert!(problems.iter().any(|p| p.contains("at least one spoke subnet")));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let bad = format!("{SAMPLE}\nunknown = 1\n");
        assert!(toml::from_str::<HubParameters>(&bad).is_err());
    }

    #[test]
    fn test_validate_lists_every_problem() {
        let mut params = sample();
        params.prefix = "Bad_Prefix".into();
        params.rule_groups[1].priority = 200;
        let err = params.validate().unwrap_err().to_string();
        assert!(err.contains("2 problems"));
        assert!(err.contains("prefix"));
        assert!(err.contains("already used"));
    }
}
