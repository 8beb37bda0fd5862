// Copyright (c) 2025 - Cowboy AI, Inc.
//! Cluster identity and classification types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::blueprint::Flavor;
use crate::domain::{Cidr, Hostname, HostnameError};
use crate::errors::{ProvisioningError, ProvisioningResult};

/// Size tier of a cluster; drives the minimum topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Small,
    Normal,
    Large,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complexity::Small => write!(f, "Small"),
            Complexity::Normal => write!(f, "Normal"),
            Complexity::Large => write!(f, "Large"),
        }
    }
}

/// Role of a node in a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Gateway,
    Master,
    PrivateNode,
    PublicNode,
}

impl NodeRole {
    /// Segment used in generated hostnames
    pub fn hostname_segment(&self) -> &'static str {
        match self {
            NodeRole::Gateway => "gw",
            NodeRole::Master => "master",
            NodeRole::PrivateNode => "node",
            NodeRole::PublicNode => "pubnode",
        }
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, NodeRole::PrivateNode | NodeRole::PublicNode)
    }

    /// Hosts of this role get a public address
    pub fn is_public(&self) -> bool {
        matches!(self, NodeRole::Gateway | NodeRole::PublicNode)
    }

    /// Hostname of the `index`-th node of this role in `cluster`
    pub fn hostname(&self, cluster: &str, index: usize) -> Result<Hostname, HostnameError> {
        match self {
            NodeRole::Gateway => Hostname::for_gateway(cluster),
            role => Hostname::for_node(cluster, role.hostname_segment(), index),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Gateway => write!(f, "gateway"),
            NodeRole::Master => write!(f, "master"),
            NodeRole::PrivateNode => write!(f, "private node"),
            NodeRole::PublicNode => write!(f, "public node"),
        }
    }
}

/// Aggregate state of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Unknown,
    Creating,
    Created,
    /// Every node is a member and its host is started
    Nominal,
    /// Some nodes are not members or their host is not started
    Degraded,
    Stopping,
    Stopped,
    Starting,
    Removed,
    Error,
}

/// SSH keypair installed on every node
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub name: String,
    pub public_key: String,
    pub private_key: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("name", &self.name)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Identity of a cluster
///
/// Fixed at creation: there are no setters, and the controller holds it by
/// value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterIdentity {
    name: String,
    flavor: Flavor,
    complexity: Complexity,
    cidr: Cidr,
    admin_password: String,
    keypair: KeyPair,
}

impl ClusterIdentity {
    /// Validates that `name` can prefix the cluster's hostnames
    pub fn new(
        name: impl Into<String>,
        flavor: Flavor,
        complexity: Complexity,
        cidr: Cidr,
        admin_password: impl Into<String>,
        keypair: KeyPair,
    ) -> ProvisioningResult<Self> {
        let name = name.into();
        Hostname::for_gateway(&name)
            .map_err(|e| ProvisioningError::Precondition(format!("invalid cluster name '{name}': {e}")))?;
        let admin_password = admin_password.into();
        if admin_password.is_empty() {
            return Err(ProvisioningError::Precondition(
                "admin password must not be empty".to_string(),
            ));
        }
        Ok(Self {
            name,
            flavor,
            complexity,
            cidr,
            admin_password,
            keypair,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn complexity(&self) -> Complexity {
        self.complexity
    }

    pub fn cidr(&self) -> Cidr {
        self.cidr
    }

    pub fn admin_password(&self) -> &str {
        &self.admin_password
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }
}

impl fmt::Debug for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterIdentity")
            .field("name", &self.name)
            .field("flavor", &self.flavor)
            .field("complexity", &self.complexity)
            .field("cidr", &self.cidr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn keypair() -> KeyPair {
        KeyPair {
            name: "alpha".to_string(),
            public_key: "ssh-ed25519 AAAA".to_string(),
            private_key: "secret-key".to_string(),
        }
    }

    #[test_case(NodeRole::Master, 1, "alpha-master-1")]
    #[test_case(NodeRole::PrivateNode, 3, "alpha-node-3")]
    #[test_case(NodeRole::PublicNode, 2, "alpha-pubnode-2")]
    #[test_case(NodeRole::Gateway, 0, "gw-alpha")]
    fn test_role_hostnames(role: NodeRole, index: usize, expected: &str) {
        assert_eq!(role.hostname("alpha", index).unwrap().as_str(), expected);
    }

    #[test]
    fn test_identity_rejects_bad_name() {
        let err = ClusterIdentity::new(
            "not a name",
            Flavor::Boh,
            Complexity::Small,
            "10.0.0.0/16".parse().unwrap(),
            "pw",
            keypair(),
        )
        .unwrap_err();
        assert!(matches!(err, ProvisioningError::Precondition(_)));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let identity = ClusterIdentity::new(
            "alpha",
            Flavor::Swarm,
            Complexity::Normal,
            "10.0.0.0/16".parse().unwrap(),
            "hunter2",
            keypair(),
        )
        .unwrap();
        let shown = format!("{identity:?} {:?}", identity.keypair());
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("secret-key"));
    }
}
