//! Managed identity and its role assignments
//!
//! An assignment is a child of the resource it is scoped to. Its name is a
//! GUID derived from scope, role and principal, so re-running never creates
//! a second assignment for the same grant.

use converge::{ExternalReference, KindRegistry, NodeSpec, ResourceNode, Result};
use serde_json::json;

use super::firewall::HubFirewall;
use super::network::HubNetwork;
use super::{IDENTITIES, ROLE_ASSIGNMENTS};
use crate::config::{HubParameters, RoleScope};

pub const IDENTITY_ID: &str = "identity";

pub fn assignment_id(name: &str) -> String {
    format!("ra-{name}")
}

/// Deterministic GUID-formatted name for an assignment.
pub fn assignment_guid(scope_path: &str, role_definition_id: &str, principal: &str) -> String {
    let hash = blake3::hash(format!("{scope_path}|{role_definition_id}|{principal}").as_bytes());
    let hex = hash.to_hex();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn role_definition_path(id: &str) -> String {
    if id.starts_with('/') {
        id.to_string()
    } else {
        format!("/providers/Microsoft.Authorization/roleDefinitions/{id}")
    }
}

pub fn build(
    kinds: &KindRegistry,
    params: &HubParameters,
    net: &HubNetwork,
    fw: &HubFirewall,
) -> Result<Vec<ResourceNode>> {
    if params.role_assignments.is_empty() {
        return Ok(Vec::new());
    }

    let identity = kinds.construct(
        NodeSpec::new(
            IDENTITY_ID,
            IDENTITIES,
            format!("{}-fw-identity", params.prefix),
        )
        .location(&params.location),
    )?;

    let mut nodes = Vec::with_capacity(params.role_assignments.len() + 1);
    for ra in &params.role_assignments {
        let scope = match ra.scope {
            RoleScope::Firewall => &fw.firewall,
            RoleScope::Policy => &fw.policy,
            RoleScope::VirtualNetwork => &net.vnet,
        };
        let role = role_definition_path(&ra.role_definition_id);
        let name = assignment_guid(scope.path(), &role, identity.path());

        let node = kinds
            .construct(
                NodeSpec::new(assignment_id(&ra.name), ROLE_ASSIGNMENTS, name)
                    .parent(scope)
                    .properties(json!({
                        "roleDefinitionId": role,
                        "principalType": "ServicePrincipal",
                    })),
            )?
            .bind(
                "/properties/principalId",
                ExternalReference::property_of(IDENTITY_ID, IDENTITIES, "/properties/principalId"),
            );
        nodes.push(node);
    }

    nodes.insert(0, identity);
    Ok(nodes)
}
