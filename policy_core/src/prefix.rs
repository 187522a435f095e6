// CIDR prefixes shared by the list matcher and rule predicates.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An address range in `network/len` notation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpPrefix {
    V4 { network: Ipv4Addr, len: u8 },
    V6 { network: Ipv6Addr, len: u8 },
}

fn mask_v4(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(len))
    }
}

fn mask_v6(len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(len))
    }
}

impl IpPrefix {
    pub fn new(network: IpAddr, len: u8) -> Result<Self, String> {
        match network {
            IpAddr::V4(network) if len <= 32 => Ok(IpPrefix::V4 { network, len }),
            IpAddr::V6(network) if len <= 128 => Ok(IpPrefix::V6 { network, len }),
            IpAddr::V4(_) => Err(format!("IPv4 prefix length {} exceeds 32", len)),
            IpAddr::V6(_) => Err(format!("IPv6 prefix length {} exceeds 128", len)),
        }
    }

    pub fn len(&self) -> u8 {
        match self {
            IpPrefix::V4 { len, .. } | IpPrefix::V6 { len, .. } => *len,
        }
    }

    /// `(address & mask) == (network & mask)`; never matches across families
    pub fn contains(&self, address: &IpAddr) -> bool {
        match (self, address) {
            (IpPrefix::V4 { network, len }, IpAddr::V4(ip)) => {
                let mask = mask_v4(*len);
                (u32::from(*ip) & mask) == (u32::from(*network) & mask)
            }
            (IpPrefix::V6 { network, len }, IpAddr::V6(ip)) => {
                let mask = mask_v6(*len);
                (u128::from(*ip) & mask) == (u128::from(*network) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for IpPrefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("missing '/' in prefix '{}'", s))?;
        let network: IpAddr = addr
            .trim()
            .parse()
            .map_err(|e| format!("bad network address '{}': {}", addr, e))?;
        let len: u8 = len
            .trim()
            .parse()
            .map_err(|e| format!("bad prefix length '{}': {}", len, e))?;
        IpPrefix::new(network, len)
    }
}

impl std::fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpPrefix::V4 { network, len } => write!(f, "{}/{}", network, len),
            IpPrefix::V6 { network, len } => write!(f, "{}/{}", network, len),
        }
    }
}

impl Serialize for IpPrefix {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpPrefix {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
