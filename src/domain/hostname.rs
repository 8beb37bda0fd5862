// Copyright (c) 2025 - Cowboy AI, Inc.
//! Host names accepted by cloud providers and cluster node labels
//!
//! Cluster nodes are named after the cluster, their role and their index
//! (`prod-master-1`). The name doubles as the provider instance name and as the
//! node hostname the orchestrator sees, so it must be a single RFC 1123 label.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Hostname validation error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostnameError {
    #[error("Hostname is empty")]
    Empty,

    #[error("Hostname exceeds maximum length of 63 characters: {0}")]
    TooLong(String),

    #[error("Invalid character '{1}' in hostname: {0}")]
    InvalidCharacter(String, char),

    #[error("Hostname cannot start or end with hyphen: {0}")]
    InvalidFormat(String),

    #[error("Hostname cannot be all numeric: {0}")]
    Numeric(String),
}

/// Single-label host name
///
/// Invariants:
/// - 1 to 63 characters
/// - lowercase ASCII letters, digits and hyphens only
/// - does not start or end with a hyphen
/// - not all numeric
///
/// # Examples
///
/// ```rust
/// use cim_provisioning::domain::Hostname;
///
/// let name = Hostname::for_node("prod", "master", 2).unwrap();
/// assert_eq!(name.as_str(), "prod-master-2");
///
/// assert!(Hostname::new("Prod_Master").is_err());
/// assert!(Hostname::new("-gw").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hostname(String);

impl Hostname {
    /// Maximum length of a DNS label (RFC 1123)
    pub const MAX_LENGTH: usize = 63;

    /// Create a hostname with validation
    pub fn new(name: impl Into<String>) -> Result<Self, HostnameError> {
        let name = name.into();

        if name.is_empty() {
            return Err(HostnameError::Empty);
        }
        if name.len() > Self::MAX_LENGTH {
            return Err(HostnameError::TooLong(name));
        }
        if let Some(ch) = name
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(HostnameError::InvalidCharacter(name, ch));
        }
        if name.starts_with('-') || name.ends_with('-') {
            return Err(HostnameError::InvalidFormat(name));
        }
        if name.chars().all(|c| c.is_ascii_digit()) {
            return Err(HostnameError::Numeric(name));
        }

        Ok(Self(name))
    }

    /// Name of the `index`-th node of `role` in `cluster`
    ///
    /// The cluster name is lowercased first; indexes start at 1.
    pub fn for_node(cluster: &str, role: &str, index: usize) -> Result<Self, HostnameError> {
        Self::new(format!("{}-{}-{}", cluster.to_lowercase(), role, index))
    }

    /// Name of the gateway of `cluster`
    pub fn for_gateway(cluster: &str) -> Result<Self, HostnameError> {
        Self::new(format!("gw-{}", cluster.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trailing numeric index of a generated node name, if any
    pub fn index(&self) -> Option<usize> {
        self.0.rsplit_once('-').and_then(|(_, tail)| tail.parse().ok())
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Hostname {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Hostname {
    type Error = HostnameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Hostname {
    type Error = HostnameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Hostname> for String {
    fn from(value: Hostname) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_hostnames() {
        assert!(Hostname::new("gw-prod").is_ok());
        assert!(Hostname::new("prod-node-12").is_ok());
        assert!(Hostname::new("a").is_ok());
        assert!(Hostname::new("a".repeat(63)).is_ok());
    }

    #[test]
    fn test_invalid_hostnames() {
        assert_eq!(Hostname::new(""), Err(HostnameError::Empty));
        assert!(matches!(Hostname::new("-gw"), Err(HostnameError::InvalidFormat(_))));
        assert!(matches!(Hostname::new("gw-"), Err(HostnameError::InvalidFormat(_))));
        assert!(matches!(
            Hostname::new("prod.node"),
            Err(HostnameError::InvalidCharacter(_, '.'))
        ));
        assert!(matches!(
            Hostname::new("Prod"),
            Err(HostnameError::InvalidCharacter(_, 'P'))
        ));
        assert!(matches!(Hostname::new("123"), Err(HostnameError::Numeric(_))));
        assert!(matches!(
            Hostname::new("a".repeat(64)),
            Err(HostnameError::TooLong(_))
        ));
    }

    #[test]
    fn test_generated_names() {
        let node = Hostname::for_node("Prod", "node", 3).unwrap();
        assert_eq!(node.as_str(), "prod-node-3");
        assert_eq!(node.index(), Some(3));

        let gw = Hostname::for_gateway("prod").unwrap();
        assert_eq!(gw.to_string(), "gw-prod");
        assert_eq!(gw.index(), None);
    }

    #[test]
    fn test_serde_validates() {
        let ok: Hostname = serde_json::from_str("\"prod-master-1\"").unwrap();
        assert_eq!(ok.as_str(), "prod-master-1");
        assert!(serde_json::from_str::<Hostname>("\"bad name\"").is_err());
    }
}
