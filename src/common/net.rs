//! Network utilities

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Remote endpoint address: a literal IP or a hostname
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name
    Domain(String),
}

impl Address {
    /// Convert to string representation
    pub fn to_string_with_port(&self, port: u16) -> String {
        match self {
            Address::Ipv4(ip) => format!("{}:{}", ip, port),
            Address::Ipv6(ip) => format!("[{}]:{}", ip, port),
            Address::Domain(d) => format!("{}:{}", d, port),
        }
    }

    /// Get as host string (IPv6 without brackets)
    pub fn to_host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Ipv6(ip) => ip.to_string(),
            Address::Domain(d) => d.clone(),
        }
    }

    /// Host form usable inside a URI authority (IPv6 bracketed)
    pub fn to_authority_host(&self) -> String {
        match self {
            Address::Ipv6(ip) => format!("[{}]", ip),
            other => other.to_host(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Address::Domain(d) if d.is_empty())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_host())
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Address::Ipv4(ip)
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Address::Ipv6(ip)
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl From<String> for Address {
    fn from(domain: String) -> Self {
        // Accept bracketed IPv6 as it appears in URI authorities
        let bare = domain
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(&domain);
        if let Ok(ip) = bare.parse::<Ipv4Addr>() {
            return Address::Ipv4(ip);
        }
        if let Ok(ip) = bare.parse::<Ipv6Addr>() {
            return Address::Ipv6(ip);
        }
        Address::Domain(domain)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address::from(s.to_string())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(Error::MissingHost);
        }
        Ok(Address::from(s.trim()))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_host())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Address::from(s))
    }
}

/// Parse a port number, rejecting zero and anything outside `u16`
pub fn parse_port(s: &str) -> Result<u16> {
    let port: u32 = s
        .trim()
        .parse()
        .map_err(|_| Error::invalid_port(format!("not a number: {}", s)))?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(Error::invalid_port(format!("out of range: {}", port)));
    }
    Ok(port as u16)
}
