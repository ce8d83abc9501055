//! Firewall policy, rule collection groups and the zonal firewall

use converge::{ExternalReference, KindRegistry, NodeSpec, ResourceNode, Result};
use serde_json::{Value, json};

use super::network::{self, HubNetwork, PIP_FAMILY};
use super::rules::{RuleGroup, render_group};
use super::{FIREWALL_POLICIES, FIREWALLS, IP_GROUPS, PUBLIC_IPS, RULE_COLLECTION_GROUPS, SUBNETS};
use crate::config::{FirewallTier, HubParameters, ThreatIntelMode};

pub const POLICY_ID: &str = "policy";
pub const FIREWALL_ID: &str = "firewall";

pub struct HubFirewall {
    pub policy: ResourceNode,
    /// Ordered by priority
    pub rule_groups: Vec<ResourceNode>,
    pub firewall: ResourceNode,
}

impl HubFirewall {
    pub fn into_nodes(self) -> Vec<ResourceNode> {
        let mut nodes = vec![self.policy];
        nodes.extend(self.rule_groups);
        nodes.push(self.firewall);
        nodes
    }
}

pub fn rule_group_id(name: &str) -> String {
    format!("rcg-{name}")
}

fn tier_name(tier: FirewallTier) -> &'static str {
    match tier {
        FirewallTier::Basic => "Basic",
        FirewallTier::Standard => "Standard",
        FirewallTier::Premium => "Premium",
    }
}

fn threat_intel_name(mode: ThreatIntelMode) -> &'static str {
    match mode {
        ThreatIntelMode::Off => "Off",
        ThreatIntelMode::Alert => "Alert",
        ThreatIntelMode::Deny => "Deny",
    }
}

pub fn build(
    kinds: &KindRegistry,
    params: &HubParameters,
    net: &HubNetwork,
) -> Result<HubFirewall> {
    let prefix = &params.prefix;
    let settings = &params.firewall;

    let mut policy_props = json!({
        "sku": { "tier": tier_name(settings.tier) },
        "threatIntelMode": threat_intel_name(settings.threat_intel_mode),
    });
    if settings.tier != FirewallTier::Basic {
        policy_props["dnsSettings"] = json!({ "enableProxy": settings.dns_proxy });
    }
    let policy = kinds.construct(
        NodeSpec::new(POLICY_ID, FIREWALL_POLICIES, format!("{prefix}-fw-policy"))
            .location(&params.location)
            .properties(policy_props),
    )?;

    let rule_groups = build_rule_groups(kinds, &policy, &params.rule_groups)?;

    let mut fw = kinds
        .construct(
            NodeSpec::new(FIREWALL_ID, FIREWALLS, format!("{prefix}-fw"))
                .location(&params.location)
                .properties(firewall_properties(params, net)),
        )?
        .depends_on_family(PIP_FAMILY)
        .bind(
            "/properties/firewallPolicy/id",
            ExternalReference::id_of(POLICY_ID, FIREWALL_POLICIES),
        )
        .bind(
            "/properties/ipConfigurations/0/properties/subnet/id",
            ExternalReference::id_of(network::FIREWALL_SUBNET_ID, SUBNETS),
        );

    for (i, pip) in net.public_ips.iter().enumerate() {
        fw = fw.bind(
            format!("/properties/ipConfigurations/{i}/properties/publicIPAddress/id"),
            ExternalReference::id_of(pip.id(), PUBLIC_IPS),
        );
    }

    if net.management_ip.is_some() {
        fw = fw
            .bind(
                "/properties/managementIpConfiguration/properties/subnet/id",
                ExternalReference::id_of(network::MANAGEMENT_SUBNET_ID, SUBNETS),
            )
            .bind(
                "/properties/managementIpConfiguration/properties/publicIPAddress/id",
                ExternalReference::id_of(network::MANAGEMENT_PIP_ID, PUBLIC_IPS),
            );
    }

    // The policy must carry its full rule set before the firewall picks it up
    for group in &rule_groups {
        fw = fw.depends_on(group.id());
    }

    Ok(HubFirewall {
        policy,
        rule_groups,
        firewall: fw,
    })
}

fn firewall_properties(params: &HubParameters, net: &HubNetwork) -> Value {
    let ip_configurations: Vec<Value> = (1..=net.public_ips.len())
        .map(|n| json!({ "name": format!("ipconfig-{n}"), "properties": {} }))
        .collect();

    let mut props = json!({
        "sku": { "name": "AZFW_VNet", "tier": tier_name(params.firewall.tier) },
        "zones": params.firewall.zones,
        "ipConfigurations": ip_configurations,
    });
    if net.management_ip.is_some() {
        props["managementIpConfiguration"] = json!({ "name": "mgmt-ipconfig", "properties": {} });
    }
    props
}

/// Groups are chained by priority so the policy sees them in order.
fn build_rule_groups(
    kinds: &KindRegistry,
    policy: &ResourceNode,
    groups: &[RuleGroup],
) -> Result<Vec<ResourceNode>> {
    let mut ordered: Vec<&RuleGroup> = groups.iter().collect();
    ordered.sort_by_key(|g| g.priority);

    let mut nodes: Vec<ResourceNode> = Vec::with_capacity(ordered.len());
    for group in ordered {
        let (props, slots) = render_group(group);
        let mut node = kinds.construct(
            NodeSpec::new(rule_group_id(&group.name), RULE_COLLECTION_GROUPS, &group.name)
                .parent(policy)
                .properties(props),
        )?;
        for slot in slots {
            node = node.bind(
                slot.pointer,
                ExternalReference::id_of(network::ip_group_id(&slot.ip_group), IP_GROUPS),
            );
        }
        if let Some(previous) = nodes.last() {
            node = node.depends_on(previous.id());
        }
        nodes.push(node);
    }
    Ok(nodes)
}
