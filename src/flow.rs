//! Offline flow evaluation against configured rule groups
//!
//! Mirrors the firewall's processing order: DNAT collections first, then
//! network, then application. Within a type, groups go by priority, then
//! collections by priority, then rules in order. The first matching rule
//! decides; no match means the flow is denied.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::cidr::{self, Ipv4Cidr};
use crate::config::HubParameters;
use crate::topology::rules::{
    CollectionKind, Rule, RuleAction, RuleCollection, RuleGroup, parse_app_protocol,
    parse_port_range,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowProtocol {
    Tcp,
    Udp,
    Icmp,
    Http,
    Https,
    Mssql,
}

impl FlowProtocol {
    /// Transport used by application protocols.
    fn transport(self) -> Self {
        match self {
            Self::Http | Self::Https | Self::Mssql => Self::Tcp,
            other => other,
        }
    }

    fn is_application(self) -> bool {
        matches!(self, Self::Http | Self::Https | Self::Mssql)
    }
}

impl FromStr for FlowProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "mssql" => Ok(Self::Mssql),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

impl fmt::Display for FlowProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Icmp => "ICMP",
            Self::Http => "Http",
            Self::Https => "Https",
            Self::Mssql => "Mssql",
        };
        f.write_str(name)
    }
}

/// A single connection attempt.
#[derive(Debug, Clone, Serialize)]
pub struct Flow {
    pub protocol: FlowProtocol,
    pub source: Ipv4Addr,
    pub destination: Option<Ipv4Addr>,
    pub port: Option<u16>,
    /// Requested host name, for FQDN and application rules
    pub fqdn: Option<String>,
    /// Service tag the destination belongs to, e.g. `AzureCloud.westeurope`
    pub service_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMatch {
    pub group: String,
    pub collection: String,
    pub kind: CollectionKind,
    pub rule: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum Verdict {
    Allow {
        #[serde(flatten)]
        matched: RuleMatch,
    },
    Deny {
        #[serde(flatten)]
        matched: RuleMatch,
    },
    Dnat {
        #[serde(flatten)]
        matched: RuleMatch,
        translated_address: Option<String>,
        translated_port: Option<String>,
    },
    /// No rule matched; the firewall denies by default
    NoMatch,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. } | Self::Dnat { .. })
    }

    pub fn matched(&self) -> Option<&RuleMatch> {
        match self {
            Self::Allow { matched } | Self::Deny { matched } | Self::Dnat { matched, .. } => {
                Some(matched)
            }
            Self::NoMatch => None,
        }
    }
}

/// Rule groups plus the address sets of their IP groups.
pub struct RuleSet<'a> {
    groups: Vec<&'a RuleGroup>,
    ip_groups: HashMap<&'a str, Vec<Ipv4Cidr>>,
}

impl<'a> RuleSet<'a> {
    /// `ip_groups` maps IP group names to their current prefixes.
    pub fn new(groups: &'a [RuleGroup], ip_groups: HashMap<&'a str, Vec<Ipv4Cidr>>) -> Self {
        let mut groups: Vec<&RuleGroup> = groups.iter().collect();
        groups.sort_by_key(|g| g.priority);
        Self { groups, ip_groups }
    }

    /// Build from parameters; IP group members are looked up by
    /// `subnet_prefix(vnet, subnet)`.
    pub fn from_params<F>(params: &'a HubParameters, mut subnet_prefix: F) -> Self
    where
        F: FnMut(&str, &str) -> Option<Ipv4Cidr>,
    {
        let ip_groups = params
            .ip_groups
            .iter()
            .map(|g| {
                let prefixes = g
                    .subnets
                    .iter()
                    .filter_map(|s| subnet_prefix(&s.vnet, &s.subnet))
                    .collect();
                (g.name.as_str(), prefixes)
            })
            .collect();
        Self::new(&params.rule_groups, ip_groups)
    }

    pub fn evaluate(&self, flow: &Flow) -> Verdict {
        for kind in CollectionKind::EVALUATION_ORDER {
            for group in &self.groups {
                let mut collections: Vec<&RuleCollection> =
                    group.collections.iter().filter(|c| c.kind == kind).collect();
                collections.sort_by_key(|c| c.priority);

                for collection in collections {
                    if let Some(rule) = collection.rules.iter().find(|r| self.matches(kind, r, flow))
                    {
                        let matched = RuleMatch {
                            group: group.name.clone(),
                            collection: collection.name.clone(),
                            kind,
                            rule: rule.name.clone(),
                        };
                        log::debug!("Flow matched {}/{}/{}", group.name, collection.name, rule.name);
                        return match collection.action {
                            RuleAction::Allow => Verdict::Allow { matched },
                            RuleAction::Deny => Verdict::Deny { matched },
                            RuleAction::Dnat => Verdict::Dnat {
                                matched,
                                translated_address: rule.translated_address.clone(),
                                translated_port: rule.translated_port.clone(),
                            },
                        };
                    }
                }
            }
        }
        Verdict::NoMatch
    }

    fn matches(&self, kind: CollectionKind, rule: &Rule, flow: &Flow) -> bool {
        if !self.source_matches(rule, flow.source) {
            return false;
        }
        match kind {
            CollectionKind::Dnat => {
                transport_matches(&rule.protocols, flow.protocol)
                    && flow.destination.is_some_and(|dst| {
                        rule.destination_addresses
                            .iter()
                            .any(|e| entry_matches(e, dst, flow.service_tag.as_deref()))
                    })
                    && port_matches(&rule.destination_ports, flow.port)
            }
            CollectionKind::Network => {
                transport_matches(&rule.protocols, flow.protocol)
                    && self.destination_matches(rule, flow)
                    && (flow.protocol == FlowProtocol::Icmp
                        || port_matches(&rule.destination_ports, flow.port))
            }
            CollectionKind::Application => {
                flow.protocol.is_application()
                    && rule.protocols.iter().filter_map(|p| parse_app_protocol(p)).any(|p| {
                        p.name.eq_ignore_ascii_case(&flow.protocol.to_string())
                            && flow.port.is_none_or(|port| port == p.port)
                    })
                    && flow
                        .fqdn
                        .as_deref()
                        .is_some_and(|host| rule.target_fqdns.iter().any(|t| fqdn_matches(t, host)))
            }
        }
    }

    fn source_matches(&self, rule: &Rule, source: Ipv4Addr) -> bool {
        rule.source_addresses
            .iter()
            .any(|e| entry_matches(e, source, None))
            || self.in_ip_groups(&rule.source_ip_groups, source)
    }

    fn destination_matches(&self, rule: &Rule, flow: &Flow) -> bool {
        let by_address = flow.destination.is_some_and(|dst| {
            rule.destination_addresses
                .iter()
                .any(|e| entry_matches(e, dst, flow.service_tag.as_deref()))
                || self.in_ip_groups(&rule.destination_ip_groups, dst)
        });
        let by_tag = flow.service_tag.as_deref().is_some_and(|tag| {
            rule.destination_addresses
                .iter()
                .any(|e| e.eq_ignore_ascii_case(tag))
        });
        let by_fqdn = flow.fqdn.as_deref().is_some_and(|host| {
            rule.destination_fqdns
                .iter()
                .any(|f| f.eq_ignore_ascii_case(host))
        });
        by_address || by_tag || by_fqdn
    }

    fn in_ip_groups(&self, names: &[String], addr: Ipv4Addr) -> bool {
        names.iter().any(|name| {
            self.ip_groups
                .get(name.as_str())
                .is_some_and(|prefixes| prefixes.iter().any(|p| p.contains_addr(addr)))
        })
    }
}

/// `*`, a CIDR block, a bare address or a service tag.
fn entry_matches(entry: &str, addr: Ipv4Addr, service_tag: Option<&str>) -> bool {
    if entry == "*" {
        return true;
    }
    match cidr::parse_entry(entry) {
        Some(block) => block.contains_addr(addr),
        None => service_tag.is_some_and(|tag| tag.eq_ignore_ascii_case(entry)),
    }
}

fn transport_matches(protocols: &[String], protocol: FlowProtocol) -> bool {
    let wanted = protocol.transport().to_string();
    protocols
        .iter()
        .any(|p| p.eq_ignore_ascii_case("any") || p.eq_ignore_ascii_case(&wanted))
}

fn port_matches(ports: &[String], port: Option<u16>) -> bool {
    let Some(port) = port else {
        return ports.iter().any(|p| p == "*");
    };
    ports
        .iter()
        .filter_map(|p| parse_port_range(p))
        .any(|(lo, hi)| (lo..=hi).contains(&port))
}

/// `*` matches anything; `*.example.com` matches subdomains only.
fn fqdn_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let host = host.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => host.ends_with(&format!(".{suffix}")),
        None => host == pattern,
    }
}
