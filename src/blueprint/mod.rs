// Copyright (c) 2025 - Cowboy AI, Inc.
//! Cluster Blueprints
//!
//! A blueprint describes one cluster flavor: how many servers the smallest
//! cluster of each complexity needs, how hosts are sized, and the remote
//! actions that turn provisioned hosts into a working cluster. The
//! [`ClusterController`](crate::cluster::ClusterController) decides *when*
//! each callback runs; the blueprint only decides *what* runs.
//!
//! # Callback order
//!
//! ```text
//! hosts provisioned ─► global_system_requirements / node_installation_script
//!                   ─► configure_cluster (once)
//!                   ─► join_master_to_cluster / join_node_to_cluster
//!                   ─► membership_query + interpret_membership (polled)
//! scale-in          ─► unconfigure_node ─► membership_query (polled until Absent)
//! ```
//!
//! Flavors are selected with [`Flavor`]; every flavor is a separate
//! implementation of [`ClusterBlueprint`] and shares nothing mutable.

pub mod boh;
pub(crate) mod scripts;
pub mod swarm;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cluster::identity::{ClusterIdentity, NodeRole};
use crate::cluster::node::NodeView;
use crate::config::PollPolicy;
use crate::errors::ProvisioningResult;
use crate::features::FeatureInstaller;
use crate::properties::PropertyBag;
use crate::remote::{CommandOutput, RemoteSession};
use crate::stack::HostSizing;

pub use boh::BohBlueprint;
pub use swarm::SwarmBlueprint;

/// Cluster flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flavor {
    /// Docker Swarm
    Swarm,
    /// Bunch of hosts, no orchestrator
    Boh,
}

impl Flavor {
    /// Fresh blueprint for this flavor
    pub fn blueprint(&self) -> Arc<dyn ClusterBlueprint> {
        match self {
            Flavor::Swarm => Arc::new(SwarmBlueprint::new()),
            Flavor::Boh => Arc::new(BohBlueprint::new()),
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flavor::Swarm => write!(f, "swarm"),
            Flavor::Boh => write!(f, "boh"),
        }
    }
}

/// Number of servers per role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Topology {
    pub masters: usize,
    pub private_nodes: usize,
    pub public_nodes: usize,
}

impl Topology {
    pub const fn new(masters: usize, private_nodes: usize, public_nodes: usize) -> Self {
        Self {
            masters,
            private_nodes,
            public_nodes,
        }
    }

    pub fn total(&self) -> usize {
        self.masters + self.private_nodes + self.public_nodes
    }

    pub fn count(&self, role: NodeRole) -> usize {
        match role {
            NodeRole::Gateway => 0,
            NodeRole::Master => self.masters,
            NodeRole::PrivateNode => self.private_nodes,
            NodeRole::PublicNode => self.public_nodes,
        }
    }
}

/// Presence of a node as reported by the cluster coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePresence {
    /// Known to the coordinator and serving
    Active,
    /// Known to the coordinator but not serving (joining, down, draining)
    Inactive,
    /// Unknown to the coordinator
    Absent,
}

/// Everything a blueprint callback may touch
///
/// Built by the controller for each callback; `masters` and `nodes` list the
/// nodes with a backing host, in stable order.
#[derive(Clone)]
pub struct ClusterContext {
    pub identity: ClusterIdentity,
    pub remote: RemoteSession,
    pub installer: Arc<dyn FeatureInstaller>,
    pub properties: Arc<PropertyBag>,
    pub membership_poll: PollPolicy,
    pub masters: Vec<NodeView>,
    pub nodes: Vec<NodeView>,
}

impl ClusterContext {
    /// Hostnames of every master and node
    pub fn hostnames(&self) -> Vec<String> {
        self.masters
            .iter()
            .chain(self.nodes.iter())
            .map(|n| n.name.clone())
            .collect()
    }
}

/// Description of a cluster flavor
///
/// Only [`flavor`](ClusterBlueprint::flavor) and
/// [`minimum_required_servers`](ClusterBlueprint::minimum_required_servers)
/// are required; every other operation defaults to the behavior of a plain
/// bunch of hosts.
#[async_trait]
pub trait ClusterBlueprint: Send + Sync {
    fn flavor(&self) -> Flavor;

    /// Smallest topology a cluster of this identity can run with
    fn minimum_required_servers(&self, identity: &ClusterIdentity) -> Topology;

    fn default_gateway_sizing(&self) -> HostSizing {
        HostSizing::new(2, 15, 60)
    }

    fn default_master_sizing(&self) -> HostSizing {
        HostSizing::new(4, 15, 100)
    }

    fn default_node_sizing(&self) -> HostSizing {
        HostSizing::new(4, 15, 100)
    }

    fn default_image(&self) -> &str {
        "Ubuntu 18.04"
    }

    /// Sizing for hosts of `role`
    fn sizing_for(&self, role: NodeRole) -> HostSizing {
        match role {
            NodeRole::Gateway => self.default_gateway_sizing(),
            NodeRole::Master => self.default_master_sizing(),
            NodeRole::PrivateNode | NodeRole::PublicNode => self.default_node_sizing(),
        }
    }

    /// Script run on every host before its role script
    async fn global_system_requirements(
        &self,
        _ctx: &ClusterContext,
    ) -> ProvisioningResult<Option<String>> {
        Ok(None)
    }

    /// Script run on hosts of `role` after the global requirements
    async fn node_installation_script(
        &self,
        _ctx: &ClusterContext,
        _role: NodeRole,
    ) -> ProvisioningResult<Option<String>> {
        Ok(None)
    }

    /// Called exactly once, after the minimum topology is provisioned
    async fn configure_cluster(
        &self,
        _ctx: &ClusterContext,
        _cancel: &CancellationToken,
    ) -> ProvisioningResult<()> {
        Ok(())
    }

    /// Add a provisioned master to the cluster
    ///
    /// `coordinator` is the first live master other than `master`, if any.
    async fn join_master_to_cluster(
        &self,
        _ctx: &ClusterContext,
        _master: &NodeView,
        _coordinator: Option<&NodeView>,
        _cancel: &CancellationToken,
    ) -> ProvisioningResult<()> {
        Ok(())
    }

    async fn join_node_to_cluster(
        &self,
        _ctx: &ClusterContext,
        _node: &NodeView,
        _coordinator: Option<&NodeView>,
        _cancel: &CancellationToken,
    ) -> ProvisioningResult<()> {
        Ok(())
    }

    /// Take `node` out of the cluster
    ///
    /// Must succeed without side effects when the node is already gone.
    /// `coordinator` is the master to run cluster-side commands on, if one is
    /// reachable.
    async fn unconfigure_node(
        &self,
        _ctx: &ClusterContext,
        _node: &NodeView,
        _coordinator: Option<&NodeView>,
        _cancel: &CancellationToken,
    ) -> ProvisioningResult<()> {
        Ok(())
    }

    /// Command run on the coordinator to report `node`
    ///
    /// `None` means the flavor has no coordinator: joins and removals are
    /// confirmed as soon as the callbacks return.
    fn membership_query(&self, _node: &str) -> Option<String> {
        None
    }

    /// Read the output of [`membership_query`](ClusterBlueprint::membership_query)
    fn interpret_membership(&self, _node: &str, output: &CommandOutput) -> NodePresence {
        if output.success() {
            NodePresence::Active
        } else {
            NodePresence::Inactive
        }
    }
}
