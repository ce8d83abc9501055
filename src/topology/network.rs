//! Hub network: virtual network, firewall subnets, public IPs and IP groups

use converge::{ExternalReference, KindRegistry, NodeSpec, ResourceNode, Result};
use serde_json::json;
use std::collections::BTreeMap;

use super::{IP_GROUPS, PUBLIC_IPS, SUBNETS, VIRTUAL_NETWORKS};
use crate::config::{FirewallTier, HubParameters};

pub const VNET_ID: &str = "vnet";
pub const FIREWALL_SUBNET_ID: &str = "subnet-firewall";
pub const MANAGEMENT_SUBNET_ID: &str = "subnet-management";
pub const MANAGEMENT_PIP_ID: &str = "pip-management";
pub const PIP_FAMILY: &str = "pip";

/// Subnet names the firewall requires verbatim.
const FIREWALL_SUBNET: &str = "AzureFirewallSubnet";
const MANAGEMENT_SUBNET: &str = "AzureFirewallManagementSubnet";

pub struct HubNetwork {
    pub vnet: ResourceNode,
    pub subnets: Vec<ResourceNode>,
    /// Data-plane public IPs, `pip-1` first
    pub public_ips: Vec<ResourceNode>,
    pub management_ip: Option<ResourceNode>,
    pub spokes: Vec<ResourceNode>,
    pub ip_groups: Vec<ResourceNode>,
}

impl HubNetwork {
    pub fn into_nodes(self) -> Vec<ResourceNode> {
        let mut nodes = vec![self.vnet];
        nodes.extend(self.subnets);
        nodes.extend(self.public_ips);
        nodes.extend(self.management_ip);
        nodes.extend(self.spokes);
        nodes.extend(self.ip_groups);
        nodes
    }
}

pub fn ip_group_id(name: &str) -> String {
    format!("ipg-{name}")
}

pub fn pip_id(n: usize) -> String {
    format!("pip-{n}")
}

pub fn build(kinds: &KindRegistry, params: &HubParameters) -> Result<HubNetwork> {
    let prefix = &params.prefix;

    let vnet = kinds.construct(
        NodeSpec::new(VNET_ID, VIRTUAL_NETWORKS, format!("{prefix}-hub-vnet"))
            .location(&params.location)
            .properties(json!({
                "addressSpace": { "addressPrefixes": [params.address_space.to_string()] },
            })),
    )?;

    let mut subnets = vec![kinds.construct(
        NodeSpec::new(FIREWALL_SUBNET_ID, SUBNETS, FIREWALL_SUBNET)
            .parent(&vnet)
            .properties(json!({ "addressPrefix": params.firewall_subnet.to_string() })),
    )?];
    if let Some(mgmt) = params.management_subnet {
        subnets.push(kinds.construct(
            NodeSpec::new(MANAGEMENT_SUBNET_ID, SUBNETS, MANAGEMENT_SUBNET)
                .parent(&vnet)
                .properties(json!({ "addressPrefix": mgmt.to_string() })),
        )?);
    }

    let pip = |id: String, name: String| {
        kinds.construct(
            NodeSpec::new(id, PUBLIC_IPS, name)
                .location(&params.location)
                .properties(json!({
                    "publicIPAllocationMethod": "Static",
                    "publicIPAddressVersion": "IPv4",
                    "sku": { "name": "Standard", "tier": "Regional" },
                    "zones": params.firewall.zones,
                })),
        )
    };

    let public_ips = (1..=params.public_ip_count)
        .map(|n| {
            pip(pip_id(n), format!("{prefix}-fw-pip-{n}")).map(|node| node.in_family(PIP_FAMILY, n - 1))
        })
        .collect::<Result<Vec<_>>>()?;

    let management_ip = if params.firewall.tier == FirewallTier::Basic {
        Some(pip(
            MANAGEMENT_PIP_ID.to_string(),
            format!("{prefix}-fw-mgmt-pip"),
        )?)
    } else {
        None
    };

    let (spokes, ip_groups) = build_ip_groups(kinds, params)?;

    Ok(HubNetwork {
        vnet,
        subnets,
        public_ips,
        management_ip,
        spokes,
        ip_groups,
    })
}

/// Spoke subnets are read, never written; the IP group takes their
/// current prefixes.
fn build_ip_groups(
    kinds: &KindRegistry,
    params: &HubParameters,
) -> Result<(Vec<ResourceNode>, Vec<ResourceNode>)> {
    let mut vnets: BTreeMap<&str, ResourceNode> = BTreeMap::new();
    let mut spokes = Vec::new();
    let mut groups = Vec::new();

    for group in &params.ip_groups {
        let mut node = kinds
            .construct(
                NodeSpec::new(
                    ip_group_id(&group.name),
                    IP_GROUPS,
                    format!("{}-ipg-{}", params.prefix, group.name),
                )
                .location(&params.location),
            )?
            .with_unordered("/properties/ipAddresses");

        for (i, subnet) in group.subnets.iter().enumerate() {
            if !vnets.contains_key(subnet.vnet.as_str()) {
                let vnet = kinds.external(
                    format!("spoke-{}", subnet.vnet),
                    VIRTUAL_NETWORKS,
                    &subnet.vnet,
                    None,
                )?;
                spokes.push(vnet.clone());
                vnets.insert(&subnet.vnet, vnet);
            }

            let id = format!("spoke-{}-{}", subnet.vnet, subnet.subnet);
            if !spokes.iter().any(|n| n.id().as_str() == id) {
                let vnet = &vnets[subnet.vnet.as_str()];
                spokes.push(kinds.external(id.as_str(), SUBNETS, &subnet.subnet, Some(vnet))?);
            }

            node = node.bind(
                format!("/properties/ipAddresses/{i}"),
                ExternalReference::property_of(id, SUBNETS, "/properties/addressPrefix"),
            );
        }
        groups.push(node);
    }

    Ok((spokes, groups))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubnetRef;
    use crate::config::tests::sample;
    use crate::topology::kinds;

    #[test]
    fn test_pips_form_a_family() {
        let net = build(&kinds().unwrap(), &sample()).unwrap();
        let families: Vec<usize> = net
            .public_ips
            .iter()
            .map(|p| p.family().unwrap().index)
            .collect();
        assert_eq!(families, vec![0, 1, 2]);
        assert_eq!(net.public_ips[0].path(), "/publicIPAddresses/contoso-fw-pip-1");
        assert!(net.management_ip.is_none());
    }

    #[test]
    fn test_subnets_nest_under_the_hub() {
        let net = build(&kinds().unwrap(), &sample()).unwrap();
        assert_eq!(
            net.subnets[0].path(),
            "/virtualNetworks/contoso-hub-vnet/subnets/AzureFirewallSubnet"
        );
        assert_eq!(net.subnets[0].properties()["addressPrefix"], "10.0.0.0/26");
        assert_eq!(net.subnets[0].location(), None);
    }

    #[test]
    fn test_spokes_are_shared_and_external() {
        let mut params = sample();
        params.ip_groups.push(crate::config::IpGroupParams {
            name: "data".into(),
            subnets: vec![SubnetRef {
                vnet: "spoke-app".into(),
                subnet: "data".into(),
            }],
        });
        let net = build(&kinds().unwrap(), &params).unwrap();

        assert_eq!(net.spokes.len(), 3);
        assert!(net.spokes.iter().all(|n| !n.is_managed()));
        assert_eq!(net.ip_groups.len(), 2);
        assert_eq!(net.ip_groups[0].bindings().len(), 2);
        assert_eq!(
            net.ip_groups[1].bindings()[0].reference.target.as_str(),
            "spoke-spoke-app-data"
        );
        assert_eq!(
            net.ip_groups[0].unordered_fields(),
            ["/properties/ipAddresses".to_string()]
        );
    }

    #[test]
    fn test_basic_tier_adds_management_resources() {
        let mut params = sample();
        params.firewall.tier = FirewallTier::Basic;
        params.management_subnet = Some("10.0.0.64/26".parse().unwrap());
        let net = build(&kinds().unwrap(), &params).unwrap();
        assert_eq!(net.subnets.len(), 2);
        assert_eq!(net.subnets[1].name(), "AzureFirewallManagementSubnet");
        assert!(net.management_ip.unwrap().family().is_none());
    }
}
