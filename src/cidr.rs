//! IPv4 CIDR blocks for parameter validation and flow checks.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CidrError {
    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),

    #[error("Invalid prefix length: {0} (must be 0-32)")]
    InvalidPrefix(String),

    #[error("Host bits set in {0}: use the network address")]
    HostBitsSet(String),
}

/// An IPv4 network in CIDR notation, e.g. `10.0.0.0/26`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Parse a network; host bits must be zero.
    pub fn new(cidr: impl AsRef<str>) -> Result<Self, CidrError> {
        let cidr = cidr.as_ref();
        let (addr, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| CidrError::InvalidCidr(cidr.to_string()))?;
        let addr =
            Ipv4Addr::from_str(addr).map_err(|_| CidrError::InvalidCidr(cidr.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| CidrError::InvalidPrefix(cidr.to_string()))?;
        if prefix > 32 {
            return Err(CidrError::InvalidPrefix(cidr.to_string()));
        }

        let network = Ipv4Addr::from(u32::from(addr) & mask(prefix));
        if network != addr {
            return Err(CidrError::HostBitsSet(cidr.to_string()));
        }
        Ok(Self { network, prefix })
    }

    /// A single host as a /32.
    pub fn host(addr: Ipv4Addr) -> Self {
        Self {
            network: addr,
            prefix: 32,
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains_addr(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask(self.prefix) == u32::from(self.network)
    }

    /// Whether `other` lies entirely within this block.
    pub fn contains(&self, other: &Self) -> bool {
        other.prefix >= self.prefix && self.contains_addr(other.network)
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.contains(other) || other.contains(self)
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse an address-list entry: a CIDR block or a bare IPv4 address.
///
/// Returns `None` for anything else (`*`, service tags).
pub fn parse_entry(entry: &str) -> Option<Ipv4Cidr> {
    if entry.contains('/') {
        Ipv4Cidr::new(entry).ok()
    } else {
        Ipv4Addr::from_str(entry).ok().map(Ipv4Cidr::host)
    }
}
