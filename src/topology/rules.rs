//! Firewall rule groups: parameter model, validation and document rendering
//!
//! Rule content is operator data. Nothing here adds, removes or widens a
//! rule; a broad destination such as `AzureCloud.westeurope` is rendered
//! exactly as written.

use crate::cidr;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::fmt;

/// Lowest and highest priority accepted for groups and collections.
pub const PRIORITY_RANGE: std::ops::RangeInclusive<u32> = 100..=65000;

/// Collection types in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Dnat,
    Network,
    Application,
}

impl CollectionKind {
    pub const EVALUATION_ORDER: [Self; 3] = [Self::Dnat, Self::Network, Self::Application];
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dnat => write!(f, "dnat"),
            Self::Network => write!(f, "network"),
            Self::Application => write!(f, "application"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
    Dnat,
}

impl RuleAction {
    fn arm_name(self) -> &'static str {
        match self {
            Self::Allow => "Allow",
            Self::Deny => "Deny",
            Self::Dnat => "DNAT",
        }
    }
}

/// A rule collection group: a child of the firewall policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleGroup {
    pub name: String,
    pub priority: u32,
    #[serde(default)]
    pub collections: Vec<RuleCollection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleCollection {
    pub name: String,
    pub kind: CollectionKind,
    pub priority: u32,
    pub action: RuleAction,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Rule {
    pub name: String,
    /// `TCP`, `UDP`, `ICMP`, `Any` for network and DNAT rules;
    /// `Http:80`, `Https:443`, `Mssql:1433` for application rules
    pub protocols: Vec<String>,
    pub source_addresses: Vec<String>,
    /// Names of IP groups declared in the same parameters file
    pub source_ip_groups: Vec<String>,
    pub destination_addresses: Vec<String>,
    pub destination_ip_groups: Vec<String>,
    pub destination_ports: Vec<String>,
    pub destination_fqdns: Vec<String>,
    pub target_fqdns: Vec<String>,
    pub translated_address: Option<String>,
    pub translated_port: Option<String>,
}

/// An application protocol with its port, e.g. `Https:443`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppProtocol {
    pub name: String,
    pub port: u16,
}

pub fn parse_app_protocol(s: &str) -> Option<AppProtocol> {
    let (name, port) = s.split_once(':')?;
    let name = match name.to_ascii_lowercase().as_str() {
        "http" => "Http",
        "https" => "Https",
        "mssql" => "Mssql",
        _ => return None,
    };
    Some(AppProtocol {
        name: name.to_string(),
        port: port.parse().ok()?,
    })
}

fn is_network_protocol(s: &str) -> bool {
    matches!(s.to_ascii_uppercase().as_str(), "TCP" | "UDP" | "ICMP" | "ANY")
}

/// Parse a port entry: `*`, `443` or `8000-8080`.
pub fn parse_port_range(s: &str) -> Option<(u16, u16)> {
    if s == "*" {
        return Some((0, u16::MAX));
    }
    match s.split_once('-') {
        Some((lo, hi)) => {
            let lo: u16 = lo.trim().parse().ok()?;
            let hi: u16 = hi.trim().parse().ok()?;
            (lo <= hi).then_some((lo, hi))
        }
        None => s.trim().parse().ok().map(|p| (p, p)),
    }
}

fn check_unique_priorities<'a>(
    what: &str,
    items: impl Iterator<Item = (&'a str, u32)>,
    problems: &mut Vec<String>,
) {
    let mut seen = BTreeSet::new();
    for (name, priority) in items {
        if !PRIORITY_RANGE.contains(&priority) {
            problems.push(format!(
                "{what} '{name}': priority {priority} is outside {}..={}",
                PRIORITY_RANGE.start(),
                PRIORITY_RANGE.end()
            ));
        }
        if !seen.insert(priority) {
            problems.push(format!(
                "{what} '{name}': priority {priority} is already used"
            ));
        }
    }
}

/// Check rule groups; appends one message per problem.
pub fn validate(groups: &[RuleGroup], ip_groups: &BTreeSet<String>, problems: &mut Vec<String>) {
    let mut names = BTreeSet::new();
    for group in groups {
        if !names.insert(group.name.as_str()) {
            problems.push(format!("rule group '{}' is declared twice", group.name));
        }
    }
    check_unique_priorities(
        "rule group",
        groups.iter().map(|g| (g.name.as_str(), g.priority)),
        problems,
    );

    for group in groups {
        if group.collections.is_empty() {
            problems.push(format!("rule group '{}' has no collections", group.name));
        }
        check_unique_priorities(
            &format!("collection in '{}'", group.name),
            group
                .collections
                .iter()
                .map(|c| (c.name.as_str(), c.priority)),
            problems,
        );
        for collection in &group.collections {
            validate_collection(&group.name, collection, ip_groups, problems);
        }
    }
}

fn validate_collection(
    group: &str,
    collection: &RuleCollection,
    ip_groups: &BTreeSet<String>,
    problems: &mut Vec<String>,
) {
    let at = format!("{}/{}", group, collection.name);

    let action_ok = match collection.kind {
        CollectionKind::Dnat => collection.action == RuleAction::Dnat,
        CollectionKind::Network | CollectionKind::Application => {
            collection.action != RuleAction::Dnat
        }
    };
    if !action_ok {
        problems.push(format!(
            "{at}: action {:?} is not valid for a {} collection",
            collection.action, collection.kind
        ));
    }
    if collection.rules.is_empty() {
        problems.push(format!("{at}: collection has no rules"));
    }

    let mut rule_names = BTreeSet::new();
    for rule in &collection.rules {
        let at = format!("{at}/{}", rule.name);
        if rule.name.is_empty() {
            problems.push(format!("{at}: rule name is empty"));
        }
        if !rule_names.insert(rule.name.as_str()) {
            problems.push(format!("{at}: rule name is already used"));
        }
        if rule.source_addresses.is_empty() && rule.source_ip_groups.is_empty() {
            problems.push(format!("{at}: needs source addresses or source IP groups"));
        }
        for name in rule.source_ip_groups.iter().chain(&rule.destination_ip_groups) {
            if !ip_groups.contains(name) {
                problems.push(format!("{at}: unknown IP group '{name}'"));
            }
        }
        for entry in rule.source_addresses.iter().chain(&rule.destination_addresses) {
            if entry.contains('/') && cidr::parse_entry(entry).is_none() {
                problems.push(format!("{at}: invalid address '{entry}'"));
            }
        }
        for port in &rule.destination_ports {
            if parse_port_range(port).is_none() {
                problems.push(format!("{at}: invalid port '{port}'"));
            }
        }

        match collection.kind {
            CollectionKind::Dnat => validate_dnat_rule(&at, rule, problems),
            CollectionKind::Network => validate_network_rule(&at, rule, problems),
            CollectionKind::Application => validate_application_rule(&at, rule, problems),
        }
    }
}

fn validate_dnat_rule(at: &str, rule: &Rule, problems: &mut Vec<String>) {
    if rule.protocols.is_empty()
        || rule
            .protocols
            .iter()
            .any(|p| !matches!(p.to_ascii_uppercase().as_str(), "TCP" | "UDP"))
    {
        problems.push(format!("{at}: DNAT rules need TCP and/or UDP protocols"));
    }
    if rule.destination_addresses.len() != 1 || rule.destination_ports.len() != 1 {
        problems.push(format!(
            "{at}: DNAT rules need exactly one destination address and port"
        ));
    }
    if rule.translated_address.is_none() || rule.translated_port.is_none() {
        problems.push(format!("{at}: DNAT rules need a translated address and port"));
    }
}

fn validate_network_rule(at: &str, rule: &Rule, problems: &mut Vec<String>) {
    if rule.protocols.is_empty() || !rule.protocols.iter().all(|p| is_network_protocol(p)) {
        problems.push(format!("{at}: network rules need TCP, UDP, ICMP or Any"));
    }
    if rule.destination_addresses.is_empty()
        && rule.destination_ip_groups.is_empty()
        && rule.destination_fqdns.is_empty()
    {
        problems.push(format!("{at}: needs a destination"));
    }
    if rule.destination_ports.is_empty() {
        problems.push(format!("{at}: needs destination ports"));
    }
    if !rule.target_fqdns.is_empty() {
        problems.push(format!("{at}: target FQDNs are for application rules"));
    }
}

fn validate_application_rule(at: &str, rule: &Rule, problems: &mut Vec<String>) {
    if rule.protocols.is_empty() || rule.protocols.iter().any(|p| parse_app_protocol(p).is_none()) {
        problems.push(format!(
            "{at}: application rules need protocols like 'Https:443'"
        ));
    }
    if rule.target_fqdns.is_empty() {
        problems.push(format!("{at}: needs target FQDNs"));
    }
}

/// An IP group id to be bound at `pointer` of the group's document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpGroupSlot {
    pub pointer: String,
    pub ip_group: String,
}

/// Render a group's `properties`, collections ordered by priority.
///
/// IP group references are left out of the document and returned as slots
/// to bind.
pub fn render_group(group: &RuleGroup) -> (Value, Vec<IpGroupSlot>) {
    let mut collections: Vec<&RuleCollection> = group.collections.iter().collect();
    collections.sort_by_key(|c| c.priority);

    let mut slots = Vec::new();
    let rendered: Vec<Value> = collections
        .iter()
        .enumerate()
        .map(|(ci, collection)| {
            let rules: Vec<Value> = collection
                .rules
                .iter()
                .enumerate()
                .map(|(ri, rule)| {
                    let base = format!("/properties/ruleCollections/{ci}/rules/{ri}");
                    for (field, names) in [
                        ("sourceIpGroups", &rule.source_ip_groups),
                        ("destinationIpGroups", &rule.destination_ip_groups),
                    ] {
                        for (k, name) in names.iter().enumerate() {
                            slots.push(IpGroupSlot {
                                pointer: format!("{base}/{field}/{k}"),
                                ip_group: name.clone(),
                            });
                        }
                    }
                    render_rule(collection.kind, rule)
                })
                .collect();

            let collection_type = match collection.kind {
                CollectionKind::Dnat => "FirewallPolicyNatRuleCollection",
                CollectionKind::Network | CollectionKind::Application => {
                    "FirewallPolicyFilterRuleCollection"
                }
            };
            json!({
                "ruleCollectionType": collection_type,
                "name": collection.name,
                "priority": collection.priority,
                "action": { "type": collection.action.arm_name() },
                "rules": rules,
            })
        })
        .collect();

    (
        json!({ "priority": group.priority, "ruleCollections": rendered }),
        slots,
    )
}

fn render_rule(kind: CollectionKind, rule: &Rule) -> Value {
    match kind {
        CollectionKind::Dnat => json!({
            "ruleType": "NatRule",
            "name": rule.name,
            "ipProtocols": upper(&rule.protocols),
            "sourceAddresses": rule.source_addresses,
            "destinationAddresses": rule.destination_addresses,
            "destinationPorts": rule.destination_ports,
            "translatedAddress": rule.translated_address,
            "translatedPort": rule.translated_port,
        }),
        CollectionKind::Network => json!({
            "ruleType": "NetworkRule",
            "name": rule.name,
            "ipProtocols": upper(&rule.protocols),
            "sourceAddresses": rule.source_addresses,
            "destinationAddresses": rule.destination_addresses,
            "destinationFqdns": rule.destination_fqdns,
            "destinationPorts": rule.destination_ports,
        }),
        CollectionKind::Application => {
            let protocols: Vec<Value> = rule
                .protocols
                .iter()
                .filter_map(|p| parse_app_protocol(p))
                .map(|p| json!({ "protocolType": p.name, "port": p.port }))
                .collect();
            json!({
                "ruleType": "ApplicationRule",
                "name": rule.name,
                "protocols": protocols,
                "sourceAddresses": rule.source_addresses,
                "targetFqdns": rule.target_fqdns,
            })
        }
    }
}

fn upper(items: &[String]) -> Vec<String> {
    items.iter().map(|s| s.to_ascii_uppercase()).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn dns_rule() -> Rule {
        Rule {
            name: "dns".into(),
            protocols: vec!["UDP".into()],
            source_ip_groups: vec!["spokes".into()],
            destination_addresses: vec!["168.63.129.16".into()],
            destination_ports: vec!["53".into()],
            ..Default::default()
        }
    }

    pub(crate) fn web_rule() -> Rule {
        Rule {
            name: "web".into(),
            protocols: vec!["Https:443".into()],
            source_addresses: vec!["10.1.0.0/16".into()],
            target_fqdns: vec!["*.ubuntu.com".into()],
            ..Default::default()
        }
    }

    pub(crate) fn groups() -> Vec<RuleGroup> {
        vec![
            RuleGroup {
                name: "platform".into(),
                priority: 200,
                collections: vec![RuleCollection {
                    name: "allow-dns".into(),
                    kind: CollectionKind::Network,
                    priority: 100,
                    action: RuleAction::Allow,
                    rules: vec![dns_rule()],
                }],
            },
            RuleGroup {
                name: "workloads".into(),
                priority: 300,
                collections: vec![RuleCollection {
                    name: "updates".into(),
                    kind: CollectionKind::Application,
                    priority: 200,
                    action: RuleAction::Allow,
                    rules: vec![web_rule()],
                }],
            },
        ]
    }

    fn ip_groups() -> BTreeSet<String> {
        ["spokes".to_string()].into_iter().collect()
    }

    fn problems(groups: &[RuleGroup]) -> Vec<String> {
        let mut out = Vec::new();
        validate(groups, &ip_groups(), &mut out);
        out
    }

    #[test]
    fn test_valid_groups() {
        assert!(problems(&groups()).is_empty());
    }

    #[test]
    fn test_duplicate_and_out_of_range_priorities() {
        let mut g = groups();
        g[1].priority = 200;
        g[0].collections[0].priority = 50;
        let found = problems(&g);
        assert!(found.iter().any(|p| p.contains("already used")));
        assert!(found.iter().any(|p| p.contains("outside 100..=65000")));
    }

    #[test]
    fn test_rule_shape_checks() {
        let mut g = groups();
        g[0].collections[0].rules[0].source_ip_groups = vec!["nope".into()];
        g[0].collections[0].rules[0].destination_ports = vec!["70000".into()];
        g[1].collections[0].action = RuleAction::Dnat;
        g[1].collections[0].rules[0].protocols = vec!["Ftp:21".into()];
        let found = problems(&g);
        assert!(found.iter().any(|p| p.contains("unknown IP group 'nope'")));
        assert!(found.iter().any(|p| p.contains("invalid port '70000'")));
        assert!(found.iter().any(|p| p.contains("not valid for a application")));
        assert!(found.iter().any(|p| p.contains("'Https:443'")));
    }

    #[test]
    fn test_broad_destination_is_accepted_as_written() {
        let mut g = groups();
        g[0].collections[0].rules[0].destination_addresses = vec!["AzureCloud.westeurope".into()];
        assert!(problems(&g).is_empty());
        let (doc, _) = render_group(&g[0]);
        assert_eq!(
            doc["ruleCollections"][0]["rules"][0]["destinationAddresses"][0],
            "AzureCloud.westeurope"
        );
    }

    #[test]
    fn test_render_orders_collections_and_collects_slots() {
        let mut group = groups().remove(0);
        group.collections.insert(
            0,
            RuleCollection {
                name: "deny-all".into(),
                kind: CollectionKind::Network,
                priority: 4000,
                action: RuleAction::Deny,
                rules: vec![Rule {
                    name: "all".into(),
                    protocols: vec!["Any".into()],
                    source_addresses: vec!["*".into()],
                    destination_addresses: vec!["*".into()],
                    destination_ports: vec!["*".into()],
                    ..Default::default()
                }],
            },
        );

        let (doc, slots) = render_group(&group);
        assert_eq!(doc["priority"], 200);
        assert_eq!(doc["ruleCollections"][0]["name"], "allow-dns");
        assert_eq!(doc["ruleCollections"][1]["action"]["type"], "Deny");
        assert_eq!(
            slots,
            vec![IpGroupSlot {
                pointer: "/properties/ruleCollections/0/rules/0/sourceIpGroups/0".into(),
                ip_group: "spokes".into(),
            }]
        );
    }

    #[test]
    fn test_parsers() {
        assert_eq!(parse_port_range("*"), Some((0, u16::MAX)));
        assert_eq!(parse_port_range("8000-8080"), Some((8000, 8080)));
        assert_eq!(parse_port_range("9-1"), None);
        assert_eq!(
            parse_app_protocol("https:443"),
            Some(AppProtocol {
                name: "Https".into(),
                port: 443
            })
        );
        assert!(parse_app_protocol("Https").is_none());
    }
}
