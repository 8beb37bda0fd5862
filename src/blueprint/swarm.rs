// Copyright (c) 2025 - Cowboy AI, Inc.
//! Docker Swarm flavor
//!
//! The first master initialises the swarm and is recorded as leader in the
//! `swarm` property section. Later nodes join through the current
//! coordinator, which hands out the join token. Removal makes the node leave,
//! waits for the coordinator to see it `Down`, then removes it from the node
//! list; removing the leader hands the record over to the coordinator.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::scripts::{self, RequirementsScript, SwarmNodeScript};
use super::{ClusterBlueprint, ClusterContext, Flavor, NodePresence, Topology};
use crate::cluster::identity::{ClusterIdentity, Complexity, NodeRole};
use crate::cluster::node::NodeView;
use crate::convergence::{poll_until, CheckError};
use crate::errors::{ProvisioningError, ProvisioningResult, ResourceKind};
use crate::features::{InstallSettings, InstallTarget};
use crate::remote::CommandOutput;

/// Property section holding the swarm bootstrap data
pub const SWARM_SECTION: &str = "swarm";

const SWARM_PORT: u16 = 2377;

/// Swarm bootstrap data shared between callbacks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmProperties {
    pub leader: Option<String>,
    pub leader_ip: Option<Ipv4Addr>,
}

#[derive(Default)]
struct ScriptCache {
    requirements: OnceCell<String>,
    master: OnceCell<String>,
    worker: OnceCell<String>,
}

/// Docker Swarm blueprint
#[derive(Default)]
pub struct SwarmBlueprint {
    scripts: ScriptCache,
}

impl SwarmBlueprint {
    pub fn new() -> Self {
        Self::default()
    }

    async fn swarm(&self, ctx: &ClusterContext) -> ProvisioningResult<SwarmProperties> {
        ctx.properties
            .inspect(SWARM_SECTION, |p: &SwarmProperties| p.clone())
            .await
    }

    async fn join(
        &self,
        ctx: &ClusterContext,
        node: &NodeView,
        coordinator: Option<&NodeView>,
        as_manager: bool,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<()> {
        let swarm = self.swarm(ctx).await?;
        if swarm.leader.as_deref() == Some(node.name.as_str()) {
            debug!(node = %node.name, "leader already part of the swarm");
            return Ok(());
        }
        if swarm.leader.is_none() {
            return Err(ProvisioningError::Precondition(format!(
                "swarm of '{}' is not initialised",
                ctx.identity.name()
            )));
        }
        let coordinator = coordinator.ok_or_else(|| {
            ProvisioningError::Precondition(format!(
                "no reachable manager for '{}' to join through",
                node.name
            ))
        })?;

        let kind = if as_manager { "manager" } else { "worker" };
        let token = ctx
            .remote
            .run_with_retry(&coordinator.name, &format!("docker swarm join-token {kind} -q"), cancel)
            .await?
            .require_success(&coordinator.name, "docker swarm join-token")?
            .stdout
            .trim()
            .to_string();

        let command = format!(
            "docker swarm join --token {token} {}:{SWARM_PORT}",
            coordinator.private_ip
        );
        let output = ctx.remote.run_with_retry(&node.name, &command, cancel).await?;
        if !output.success() && !output.stderr.contains("already part of a swarm") {
            output.require_success(&node.name, "docker swarm join")?;
        }
        info!(node = %node.name, via = %coordinator.name, manager = as_manager, "joined swarm");
        Ok(())
    }
}

/// Parse `hostname:status` lines of `docker node ls`
fn presence_in(node: &str, stdout: &str) -> NodePresence {
    stdout
        .lines()
        .filter_map(|line| line.trim().split_once(':'))
        .find(|(hostname, _)| *hostname == node)
        .map(|(_, status)| {
            if status.trim().eq_ignore_ascii_case("ready") {
                NodePresence::Active
            } else {
                NodePresence::Inactive
            }
        })
        .unwrap_or(NodePresence::Absent)
}

#[async_trait]
impl ClusterBlueprint for SwarmBlueprint {
    fn flavor(&self) -> Flavor {
        Flavor::Swarm
    }

    fn minimum_required_servers(&self, identity: &ClusterIdentity) -> Topology {
        match identity.complexity() {
            Complexity::Small => Topology::new(1, 1, 0),
            Complexity::Normal => Topology::new(3, 3, 0),
            Complexity::Large => Topology::new(5, 3, 0),
        }
    }

    async fn global_system_requirements(
        &self,
        ctx: &ClusterContext,
    ) -> ProvisioningResult<Option<String>> {
        let script = self
            .scripts
            .requirements
            .get_or_try_init(|| async {
                scripts::render(&RequirementsScript::for_cluster(&ctx.identity).with_swarm_ports())
            })
            .await?;
        Ok(Some(script.clone()))
    }

    async fn node_installation_script(
        &self,
        ctx: &ClusterContext,
        role: NodeRole,
    ) -> ProvisioningResult<Option<String>> {
        let (cell, script) = match role {
            NodeRole::Gateway => return Ok(None),
            NodeRole::Master => (&self.scripts.master, SwarmNodeScript::manager(&ctx.identity)),
            NodeRole::PrivateNode | NodeRole::PublicNode => {
                (&self.scripts.worker, SwarmNodeScript::worker(&ctx.identity))
            }
        };
        let rendered = cell
            .get_or_try_init(|| async { scripts::render(&script) })
            .await?;
        Ok(Some(rendered.clone()))
    }

    async fn configure_cluster(
        &self,
        ctx: &ClusterContext,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<()> {
        let leader = ctx.masters.first().ok_or_else(|| {
            ProvisioningError::not_found(ResourceKind::Master, ctx.identity.name())
        })?;

        let target = InstallTarget::Cluster {
            name: ctx.identity.name().to_string(),
            hosts: ctx.hostnames(),
        };
        let docker = ctx
            .installer
            .add("docker", &target, &HashMap::new(), &InstallSettings::default(), cancel)
            .await?;
        if !docker.successful() {
            return Err(ProvisioningError::fatal(
                ctx.identity.name(),
                format!("docker installation failed: {}", docker.error_messages().join("; ")),
            ));
        }

        let init = format!("docker swarm init --advertise-addr {}", leader.private_ip);
        let output = ctx.remote.run_with_retry(&leader.name, &init, cancel).await?;
        if !output.success() && !output.stderr.contains("already part of a swarm") {
            output.require_success(&leader.name, "docker swarm init")?;
        }

        ctx.properties
            .lock_for_write(SWARM_SECTION)
            .await
            .then_use(|swarm: &mut SwarmProperties| {
                swarm.leader = Some(leader.name.clone());
                swarm.leader_ip = Some(leader.private_ip);
                Ok(())
            })?;

        info!(cluster = %ctx.identity.name(), leader = %leader.name, "swarm initialised");
        Ok(())
    }

    async fn join_master_to_cluster(
        &self,
        ctx: &ClusterContext,
        master: &NodeView,
        coordinator: Option<&NodeView>,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<()> {
        self.join(ctx, master, coordinator, true, cancel).await
    }

    async fn join_node_to_cluster(
        &self,
        ctx: &ClusterContext,
        node: &NodeView,
        coordinator: Option<&NodeView>,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<()> {
        self.join(ctx, node, coordinator, false, cancel).await
    }

    async fn unconfigure_node(
        &self,
        ctx: &ClusterContext,
        node: &NodeView,
        coordinator: Option<&NodeView>,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<()> {
        let coordinator = coordinator.ok_or_else(|| {
            ProvisioningError::Precondition(format!(
                "no reachable master to remove '{}' from the swarm",
                node.name
            ))
        })?;
        let query = self.membership_query(&node.name).unwrap_or_default();

        let presence = ctx
            .remote
            .run_with_retry(&coordinator.name, &query, cancel)
            .await
            .map(|output| self.interpret_membership(&node.name, &output))?;
        if presence == NodePresence::Absent {
            debug!(node = %node.name, "already out of the swarm");
            return Ok(());
        }

        if node.role == NodeRole::Master {
            ctx.remote
                .run_with_retry(&coordinator.name, &format!("docker node demote {}", node.name), cancel)
                .await?
                .require_success(&coordinator.name, "docker node demote")?;
        }

        let leave = ctx
            .remote
            .run_with_retry(&node.name, "docker swarm leave", cancel)
            .await?;
        if !leave.success() && !leave.stderr.contains("not part of a swarm") {
            leave.require_success(&node.name, "docker swarm leave")?;
        }

        let operation = format!("swarm sees {} down", node.name);
        poll_until(&operation, &ctx.membership_poll, cancel, || async {
            let output = ctx.remote.run(&coordinator.name, &query, cancel).await?;
            match self.interpret_membership(&node.name, &output) {
                NodePresence::Active => Err(CheckError::not_ready("node still ready")),
                NodePresence::Inactive | NodePresence::Absent => Ok(()),
            }
        })
        .await?;

        let remove = ctx
            .remote
            .run_with_retry(&coordinator.name, &format!("docker node rm {}", node.name), cancel)
            .await?;
        if !remove.success() && !remove.stderr.contains("not found") {
            remove.require_success(&coordinator.name, "docker node rm")?;
        }

        let (name, ip) = (coordinator.name.clone(), coordinator.private_ip);
        ctx.properties
            .lock_for_write(SWARM_SECTION)
            .await
            .then_use(|swarm: &mut SwarmProperties| {
                if swarm.leader.as_deref() == Some(node.name.as_str()) {
                    info!(from = %node.name, to = %name, "swarm leader handed over");
                    swarm.leader = Some(name);
                    swarm.leader_ip = Some(ip);
                }
                Ok(())
            })?;
        info!(node = %node.name, "removed from swarm");
        Ok(())
    }

    fn membership_query(&self, node: &str) -> Option<String> {
        Some(format!(
            "docker node ls --format \"{{{{.Hostname}}}}:{{{{.Status}}}}\" --filter \"name={node}\""
        ))
    }

    fn interpret_membership(&self, node: &str, output: &CommandOutput) -> NodePresence {
        if !output.success() {
            return NodePresence::Inactive;
        }
        presence_in(node, &output.stdout)
    }
}
