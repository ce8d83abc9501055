//! Hub topology - turns [`HubParameters`] into resource nodes
//!
//! Node ids are stable across runs so plans and reports can be compared:
//!
//! | id | resource |
//! |----|----------|
//! | `vnet` | hub virtual network |
//! | `subnet-firewall`, `subnet-management` | firewall subnets |
//! | `pip-{n}`, `pip-management` | public IPs (family `pip`) |
//! | `spoke-{vnet}`, `spoke-{vnet}-{subnet}` | existing spoke resources |
//! | `ipg-{name}` | IP groups |
//! | `policy`, `rcg-{name}` | firewall policy and rule collection groups |
//! | `firewall` | the firewall instance |
//! | `identity`, `ra-{name}` | managed identity and role assignments |

pub mod firewall;
pub mod network;
pub mod roles;
pub mod rules;

use converge::{KindRegistry, KindSpec, ResourceNode, Result};

use crate::config::{HubParameters, ZONE_REGIONS};

pub const VIRTUAL_NETWORKS: &str = "virtualNetworks";
pub const SUBNETS: &str = "subnets";
pub const PUBLIC_IPS: &str = "publicIPAddresses";
pub const IP_GROUPS: &str = "ipGroups";
pub const FIREWALL_POLICIES: &str = "firewallPolicies";
pub const RULE_COLLECTION_GROUPS: &str = "ruleCollectionGroups";
pub const FIREWALLS: &str = "azureFirewalls";
pub const IDENTITIES: &str = "userAssignedIdentities";
pub const ROLE_ASSIGNMENTS: &str = "roleAssignments";

/// Kinds used by the hub, with their naming and placement rules.
pub fn kinds() -> Result<KindRegistry> {
    let mut kinds = KindRegistry::new();
    kinds.register(
        KindSpec::new(VIRTUAL_NETWORKS)
            .name_length(2, 64)
            .serialize_children(),
    );
    kinds.register(KindSpec::new(SUBNETS).child_resource());
    kinds.register(KindSpec::new(PUBLIC_IPS));
    kinds.register(KindSpec::new(IP_GROUPS));
    kinds.register(KindSpec::new(FIREWALL_POLICIES).serialize_children());
    kinds.register(KindSpec::new(RULE_COLLECTION_GROUPS).child_resource());
    kinds.register(
        KindSpec::new(FIREWALLS)
            .name_length(1, 56)
            .regions(ZONE_REGIONS.iter().copied()),
    );
    kinds.register(
        KindSpec::new(IDENTITIES)
            .name_length(3, 128)
            .name_pattern(r"^[A-Za-z0-9][A-Za-z0-9_-]*$")?,
    );
    kinds.register(
        KindSpec::new(ROLE_ASSIGNMENTS)
            .name_length(36, 36)
            .name_pattern(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")?
            .child_resource(),
    );
    Ok(kinds)
}

/// Every node of the hub, in declaration order.
pub fn build_hub(params: &HubParameters) -> Result<Vec<ResourceNode>> {
    let kinds = kinds()?;

    let net = network::build(&kinds, params)?;
    let fw = firewall::build(&kinds, params, &net)?;
    let ra = roles::build(&kinds, params, &net, &fw)?;

    let mut nodes = net.into_nodes();
    nodes.extend(fw.into_nodes());
    nodes.extend(ra);
    log::debug!("Hub topology has {} nodes", nodes.len());
    Ok(nodes)
}
