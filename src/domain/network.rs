// Copyright (c) 2025 - Cowboy AI, Inc.
//! CIDR blocks and subnet arithmetic for cluster networks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Network validation error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Invalid IPv4 address: {0}")]
    InvalidIpAddress(String),

    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),

    #[error("Invalid prefix length: {0} (must be 0-32)")]
    InvalidPrefixLength(u8),

    #[error("Cannot split /{prefix} into 2^{newbits} subnets")]
    SplitTooSmall { prefix: u8, newbits: u8 },

    #[error("Subnet index {index} out of range for {count} subnets")]
    SubnetIndexOutOfRange { index: u32, count: u64 },
}

/// IPv4 network in CIDR notation
///
/// Invariants:
/// - valid IPv4 address and prefix 0-32
/// - canonical: host bits of the address are zero
///
/// # Examples
///
/// ```rust
/// use cim_provisioning::domain::Cidr;
///
/// let net = Cidr::new("192.168.0.0/16").unwrap();
/// let (public, private) = net.halves().unwrap();
/// assert_eq!(public.to_string(), "192.168.0.0/17");
/// assert_eq!(private.to_string(), "192.168.128.0/17");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    /// Parse `a.b.c.d/p`; host bits are cleared
    pub fn new(cidr: impl AsRef<str>) -> Result<Self, NetworkError> {
        let cidr = cidr.as_ref();
        let (addr, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| NetworkError::InvalidCidr(cidr.to_string()))?;

        let address = Ipv4Addr::from_str(addr)
            .map_err(|_| NetworkError::InvalidIpAddress(addr.to_string()))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidCidr(cidr.to_string()))?;

        Self::from_parts(address, prefix)
    }

    pub fn from_parts(address: Ipv4Addr, prefix: u8) -> Result<Self, NetworkError> {
        if prefix > 32 {
            return Err(NetworkError::InvalidPrefixLength(prefix));
        }
        let network = Ipv4Addr::from(u32::from(address) & mask(prefix));
        Ok(Self { network, prefix })
    }

    /// `0.0.0.0/0`, the destination of a default route
    pub const fn any() -> Self {
        Self {
            network: Ipv4Addr::UNSPECIFIED,
            prefix: 0,
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses covered
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix)
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & mask(self.prefix) == u32::from(self.network)
    }

    /// Whether `other` lies entirely inside this network
    pub fn covers(&self, other: &Cidr) -> bool {
        other.prefix >= self.prefix && self.contains(other.network)
    }

    /// The `index`-th of the 2^`newbits` equal subnets
    pub fn subnet(&self, newbits: u8, index: u32) -> Result<Cidr, NetworkError> {
        if newbits == 0 || u16::from(self.prefix) + u16::from(newbits) > 32 {
            return Err(NetworkError::SplitTooSmall {
                prefix: self.prefix,
                newbits,
            });
        }
        let prefix = self.prefix + newbits;
        let count = 1u64 << newbits;
        if u64::from(index) >= count {
            return Err(NetworkError::SubnetIndexOutOfRange { index, count });
        }
        let offset = u64::from(index) << (32 - prefix);
        let base = u64::from(u32::from(self.network)) + offset;
        // base stays inside the parent, which is below 2^32
        Cidr::from_parts(Ipv4Addr::from(base as u32), prefix)
    }

    /// Split into two equal halves (public, private)
    pub fn halves(&self) -> Result<(Cidr, Cidr), NetworkError> {
        Ok((self.subnet(1, 0)?, self.subnet(1, 1)?))
    }

    /// `n`-th usable host address, skipping the network and broadcast addresses
    pub fn host(&self, n: u32) -> Option<Ipv4Addr> {
        let (first, usable) = if self.prefix >= 31 {
            (0, self.size())
        } else {
            (1, self.size() - 2)
        };
        if u64::from(n) >= usable {
            return None;
        }
        let address = u64::from(u32::from(self.network)) + first + u64::from(n);
        Some(Ipv4Addr::from(address as u32))
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Cidr {
    type Error = NetworkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Cidr> for String {
    fn from(value: Cidr) -> Self {
        value.to_string()
    }
}
