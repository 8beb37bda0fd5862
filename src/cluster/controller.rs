// Copyright (c) 2025 - Cowboy AI, Inc.
//! Cluster Controller
//!
//! Executes a [`ClusterBlueprint`] against a [`StackAdapter`] and owns the
//! [`NodeRecord`]s of the cluster.
//!
//! # Create pipeline
//!
//! ```text
//! network ─► gateway ─► hosts (parallel, bounded) ─► bootstrap scripts
//!         ─► configure_cluster (once) ─► joins (serialized) ─► membership polls
//! ```
//!
//! Every pipeline runs under one cancellation token and the configured
//! pipeline budget. When the budget runs out, outstanding work is cancelled,
//! in-flight sagas roll back, and the caller gets
//! [`ProvisioningError::PartialTimeout`] naming the nodes that did become
//! members.
//!
//! # Scale-in
//!
//! A node's host is only deleted once the blueprint unconfigured it and the
//! coordinator reports it absent. Otherwise the node stays `Leaving` and the
//! host is kept.

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::identity::{ClusterIdentity, ClusterState, NodeRole};
use super::node::{NodeRecord, NodeView};
use crate::blueprint::{ClusterBlueprint, ClusterContext, NodePresence};
use crate::config::ProvisioningConfig;
use crate::convergence::{poll_until, CheckError};
use crate::domain::{Hostname, HostnameError};
use crate::errors::{ErrorKind, ProvisioningError, ProvisioningResult, ResourceKind};
use crate::features::{CommandFeatureInstaller, FeatureInstaller};
use crate::properties::PropertyBag;
use crate::remote::{RemoteExecutor, RemoteSession};
use crate::stack::{
    GatewayRequest, Host, HostRequest, HostSizing, HostState, Network, NetworkRequest,
    StackAdapter,
};
use crate::state_machine::membership::MembershipEvent;

/// Property section holding the creation defaults of the cluster
pub const DEFAULTS_SECTION: &str = "defaults";

/// Image and sizing the cluster was created with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDefaults {
    pub image: String,
    pub gateway_sizing: Option<HostSizing>,
    pub master_sizing: Option<HostSizing>,
    pub node_sizing: Option<HostSizing>,
}

#[derive(Debug)]
struct ClusterInner {
    state: ClusterState,
    network: Option<Network>,
    gateway: Option<Host>,
    nodes: Vec<NodeRecord>,
    configured: bool,
}

/// Drives one cluster through its life
pub struct ClusterController {
    identity: ClusterIdentity,
    blueprint: Arc<dyn ClusterBlueprint>,
    stack: Arc<dyn StackAdapter>,
    remote: RemoteSession,
    installer: Arc<dyn FeatureInstaller>,
    properties: Arc<PropertyBag>,
    config: ProvisioningConfig,
    inner: RwLock<ClusterInner>,
    join_lock: Mutex<()>,
}

impl ClusterController {
    /// Controller for a cluster that does not exist yet
    ///
    /// The blueprint follows the identity's flavor; features are installed
    /// with a [`CommandFeatureInstaller`] over the same executor.
    pub fn new(
        identity: ClusterIdentity,
        stack: Arc<dyn StackAdapter>,
        executor: Arc<dyn RemoteExecutor>,
        config: ProvisioningConfig,
    ) -> ProvisioningResult<Self> {
        config.validate()?;
        let remote = RemoteSession::new(executor, &config);
        let installer: Arc<dyn FeatureInstaller> =
            Arc::new(CommandFeatureInstaller::new(remote.clone()));
        Ok(Self {
            blueprint: identity.flavor().blueprint(),
            identity,
            stack,
            remote,
            installer,
            properties: Arc::new(PropertyBag::new()),
            config,
            inner: RwLock::new(ClusterInner {
                state: ClusterState::Unknown,
                network: None,
                gateway: None,
                nodes: Vec::new(),
                configured: false,
            }),
            join_lock: Mutex::new(()),
        })
    }

    pub fn with_installer(mut self, installer: Arc<dyn FeatureInstaller>) -> Self {
        self.installer = installer;
        self
    }

    pub fn identity(&self) -> &ClusterIdentity {
        &self.identity
    }

    pub fn blueprint(&self) -> &Arc<dyn ClusterBlueprint> {
        &self.blueprint
    }

    pub fn properties(&self) -> &Arc<PropertyBag> {
        &self.properties
    }

    pub async fn network(&self) -> Option<Network> {
        self.inner.read().await.network.clone()
    }

    pub async fn gateway(&self) -> Option<Host> {
        self.inner.read().await.gateway.clone()
    }

    // ---------------------------------------------------------------
    // Creation
    // ---------------------------------------------------------------

    /// Create the cluster with the blueprint's minimum topology
    ///
    /// # Errors
    ///
    /// - `Precondition` if the cluster was already created
    /// - `Node` wrapping the first failure of a host, bootstrap or join
    /// - `Timeout` / `PartialTimeout` when the pipeline budget runs out
    pub async fn create(&self, cancel: &CancellationToken) -> ProvisioningResult<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.state != ClusterState::Unknown {
                return Err(ProvisioningError::Precondition(format!(
                    "cluster '{}' already exists ({:?})",
                    self.identity.name(),
                    inner.state
                )));
            }
            inner.state = ClusterState::Creating;
        }

        info!(
            cluster = %self.identity.name(),
            flavor = %self.identity.flavor(),
            complexity = %self.identity.complexity(),
            provider = %self.stack.provider(),
            "creating cluster"
        );
        let result = self
            .run_pipeline("create cluster", cancel, |token| async move {
                self.create_pipeline(&token).await
            })
            .await;

        let state = match &result {
            Ok(()) => ClusterState::Created,
            Err(err) => {
                error!(cluster = %self.identity.name(), error = %err, "cluster creation failed");
                ClusterState::Error
            }
        };
        self.inner.write().await.state = state;
        result
    }

    async fn create_pipeline(&self, token: &CancellationToken) -> ProvisioningResult<()> {
        let cluster = self.identity.name();
        self.record_defaults().await?;

        let network = self
            .stack
            .create_network(
                NetworkRequest {
                    name: cluster.to_string(),
                    cidr: self.identity.cidr(),
                    split_public_private: self.config.build_subnetworks,
                },
                token,
            )
            .await?;
        let network_id = network.id.clone();
        self.inner.write().await.network = Some(network);

        let gateway = self
            .stack
            .create_gateway(
                GatewayRequest {
                    name: NodeRole::Gateway.hostname(cluster, 0).map_err(invalid_name)?,
                    image: self.blueprint.default_image().to_string(),
                    sizing: self.blueprint.default_gateway_sizing(),
                    network_id,
                },
                token,
            )
            .await?;
        info!(%cluster, gateway = %gateway.name, "gateway ready");
        self.inner.write().await.gateway = Some(gateway);

        let topology = self.blueprint.minimum_required_servers(&self.identity);
        let mut names = Vec::with_capacity(topology.total());
        for role in [NodeRole::Master, NodeRole::PrivateNode, NodeRole::PublicNode] {
            names.extend(self.register_nodes(role, topology.count(role)).await?);
        }

        info!(%cluster, hosts = names.len(), "provisioning minimum topology");
        self.provision_group(&names, false, token).await?;
        self.configure(token).await?;

        for name in &names {
            self.join_node(name, token)
                .await
                .map_err(|e| e.for_node(name.as_str()))?;
        }
        info!(%cluster, "cluster created");
        Ok(())
    }

    async fn record_defaults(&self) -> ProvisioningResult<()> {
        let defaults = ClusterDefaults {
            image: self.blueprint.default_image().to_string(),
            gateway_sizing: Some(self.blueprint.default_gateway_sizing()),
            master_sizing: Some(self.blueprint.default_master_sizing()),
            node_sizing: Some(self.blueprint.default_node_sizing()),
        };
        self.properties
            .lock_for_write(DEFAULTS_SECTION)
            .await
            .then_use(|current: &mut ClusterDefaults| {
                *current = defaults;
                Ok(())
            })
    }

    /// Run `body` under a child token and the pipeline budget
    async fn run_pipeline<F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        body: F,
    ) -> ProvisioningResult<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ProvisioningResult<()>>,
    {
        let token = cancel.child_token();
        let started = Instant::now();
        let work = body(token.clone());
        tokio::pin!(work);

        tokio::select! {
            result = &mut work => return result,
            _ = tokio::time::sleep(self.config.pipeline_timeout()) => {}
        }

        let elapsed = started.elapsed();
        warn!(operation, ?elapsed, "pipeline budget exhausted, cancelling");
        token.cancel();
        if let Err(err) = work.await {
            debug!(operation, error = %err, "cancelled pipeline unwound");
        }

        let (members, incomplete) = self.partition_members().await;
        if members.is_empty() {
            Err(ProvisioningError::Timeout {
                operation: operation.to_string(),
                elapsed,
                attempts: 0,
            })
        } else {
            Err(ProvisioningError::PartialTimeout {
                elapsed,
                members,
                incomplete,
            })
        }
    }

    async fn partition_members(&self) -> (Vec<String>, Vec<String>) {
        let inner = self.inner.read().await;
        let mut members = Vec::new();
        let mut incomplete = Vec::new();
        for node in ordered(&inner.nodes) {
            if node.is_member() {
                members.push(node.name().to_string());
            } else {
                incomplete.push(node.name().to_string());
            }
        }
        (members, incomplete)
    }

    /// Add `count` records of `role` with the next free indexes
    async fn register_nodes(&self, role: NodeRole, count: usize) -> ProvisioningResult<Vec<Hostname>> {
        let mut inner = self.inner.write().await;
        let next = inner
            .nodes
            .iter()
            .filter(|n| n.role() == role)
            .filter_map(|n| n.name().index())
            .max()
            .unwrap_or(0)
            + 1;

        let mut names = Vec::with_capacity(count);
        for index in next..next + count {
            let name = role
                .hostname(self.identity.name(), index)
                .map_err(invalid_name)?;
            inner.nodes.push(NodeRecord::new(name.clone(), role));
            names.push(name);
        }
        Ok(names)
    }

    /// Provision `names` in parallel, optionally joining each one
    ///
    /// The first failure cancels the rest of the group; the error returned is
    /// the first one that is not a cancellation.
    async fn provision_group(
        &self,
        names: &[Hostname],
        join: bool,
        token: &CancellationToken,
    ) -> ProvisioningResult<()> {
        let group = token.child_token();
        let results: Vec<ProvisioningResult<()>> = stream::iter(names.iter().cloned())
            .map(|name| {
                let group = group.clone();
                async move {
                    let mut result = self.provision_node(&name, &group).await;
                    if join && result.is_ok() {
                        result = self.join_node(&name, &group).await;
                    }
                    if let Err(err) = &result {
                        warn!(node = %name, error = %err, "node failed, cancelling group");
                        group.cancel();
                    }
                    result.map_err(|e| e.for_node(name.as_str()))
                }
            })
            .buffer_unordered(self.config.max_parallel)
            .collect()
            .await;

        first_failure(results)
    }

    async fn provision_node(&self, name: &Hostname, token: &CancellationToken) -> ProvisioningResult<()> {
        let role = self.with_node(name.as_str(), |n| Ok(n.role())).await?;
        let network_id = self
            .inner
            .read()
            .await
            .network
            .as_ref()
            .map(|n| n.id.clone())
            .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Network, self.identity.name()))?;

        let request = HostRequest {
            name: name.clone(),
            image: self.blueprint.default_image().to_string(),
            sizing: self.blueprint.sizing_for(role),
            network_id,
            public_ip: role.is_public(),
        };
        debug!(node = %name, %role, "requesting host");

        let host = match self.stack.create_host(request, token).await {
            Ok(host) => host,
            Err(err) => {
                self.fail_node(name.as_str(), &err).await;
                return Err(err);
            }
        };
        self.update_node(name.as_str(), |node| {
            node.attach_host(host);
            node.apply(MembershipEvent::HostReady).map(|_| ())
        })
        .await?;

        if let Err(err) = self.bootstrap(name.as_str(), role, token).await {
            self.fail_node(name.as_str(), &err).await;
            return Err(err);
        }
        info!(node = %name, %role, "node provisioned");
        Ok(())
    }

    async fn bootstrap(&self, node: &str, role: NodeRole, token: &CancellationToken) -> ProvisioningResult<()> {
        let ctx = self.context().await;
        if let Some(script) = self.blueprint.global_system_requirements(&ctx).await? {
            self.remote
                .upload_and_run(node, "system_requirements.sh", &script, token)
                .await?
                .require_success(node, "system requirements")?;
        }
        if let Some(script) = self.blueprint.node_installation_script(&ctx, role).await? {
            let script_name = format!("install_{}.sh", role.hostname_segment());
            self.remote
                .upload_and_run(node, &script_name, &script, token)
                .await?
                .require_success(node, "node installation")?;
        }
        Ok(())
    }

    async fn configure(&self, token: &CancellationToken) -> ProvisioningResult<()> {
        if self.inner.read().await.configured {
            return Ok(());
        }
        let ctx = self.context().await;
        self.blueprint.configure_cluster(&ctx, token).await?;
        self.inner.write().await.configured = true;
        info!(cluster = %self.identity.name(), masters = ctx.masters.len(), "cluster configured");
        Ok(())
    }

    /// Join one provisioned node; joins never overlap
    async fn join_node(&self, name: &Hostname, token: &CancellationToken) -> ProvisioningResult<()> {
        let _join = self.join_lock.lock().await;
        let view = self.node_view(name.as_str()).await?;
        self.update_node(name.as_str(), |n| n.apply(MembershipEvent::JoinStarted).map(|_| ()))
            .await?;

        let joined = async {
            let coordinator = self.join_coordinator(&view.name, token).await?;
            let ctx = self.context().await;
            match view.role {
                NodeRole::Master => {
                    self.blueprint
                        .join_master_to_cluster(&ctx, &view, coordinator.as_ref(), token)
                        .await
                }
                _ => {
                    self.blueprint
                        .join_node_to_cluster(&ctx, &view, coordinator.as_ref(), token)
                        .await
                }
            }
        }
        .await;
        let confirmed = match joined {
            Ok(()) => {
                self.confirm_presence(&view.name, NodePresence::Active, None, token)
                    .await
            }
            Err(err) => Err(err),
        };

        match confirmed {
            Ok(()) => {
                self.update_node(name.as_str(), |n| {
                    n.apply(MembershipEvent::MembershipConfirmed).map(|_| ())
                })
                .await?;
                info!(node = %name, role = %view.role, "node joined");
                Ok(())
            }
            Err(err) => {
                self.fail_node(name.as_str(), &err).await;
                Err(err)
            }
        }
    }

    /// Poll the coordinator until it reports `node` as `wanted`
    ///
    /// Flavors without a coordinator confirm immediately.
    async fn confirm_presence(
        &self,
        node: &str,
        wanted: NodePresence,
        exclude: Option<&str>,
        token: &CancellationToken,
    ) -> ProvisioningResult<()> {
        let Some(query) = self.blueprint.membership_query(node) else {
            debug!(%node, ?wanted, "no coordinator, presence assumed");
            return Ok(());
        };

        let operation = format!("confirm {node} {wanted:?}");
        let policy = self.config.membership_poll();
        poll_until(&operation, &policy, token, || async {
            let coordinator = self
                .find_coordinator(exclude, token)
                .await
                .map_err(|e| CheckError::not_ready(e.to_string()))?;
            let output = self.remote.run(&coordinator.name, &query, token).await?;
            let presence = self.blueprint.interpret_membership(node, &output);
            if presence == wanted {
                Ok(())
            } else {
                Err(CheckError::not_ready(format!("{node} is {presence:?}")))
            }
        })
        .await
    }

    /// Master a joining node goes through; `None` without a live one
    async fn join_coordinator(
        &self,
        node: &str,
        token: &CancellationToken,
    ) -> ProvisioningResult<Option<NodeView>> {
        if self.blueprint.membership_query(node).is_none() {
            return Ok(None);
        }
        match self.find_coordinator(Some(node), token).await {
            Ok(master) => Ok(Some(master)),
            Err(err) if err.kind() == ErrorKind::Cancelled => Err(err),
            Err(err) => {
                debug!(%node, error = %err, "joining without a coordinator");
                Ok(None)
            }
        }
    }

    /// First master, in stable order, whose liveness check succeeds
    async fn find_coordinator(
        &self,
        exclude: Option<&str>,
        token: &CancellationToken,
    ) -> ProvisioningResult<NodeView> {
        let candidates: Vec<NodeView> = {
            let inner = self.inner.read().await;
            ordered(&inner.nodes)
                .into_iter()
                .filter(|n| n.role() == NodeRole::Master && n.state().has_running_host())
                .filter(|n| Some(n.name().as_str()) != exclude)
                .filter_map(NodeRecord::view)
                .collect()
        };

        for master in candidates {
            if self.is_live(&master.name, token).await? {
                return Ok(master);
            }
        }
        Err(ProvisioningError::not_found(
            ResourceKind::Master,
            format!("live master of {}", self.identity.name()),
        ))
    }

    async fn is_live(&self, node: &str, token: &CancellationToken) -> ProvisioningResult<bool> {
        match self.remote.run(node, &self.config.liveness_command, token).await {
            Ok(output) => {
                if !output.success() {
                    debug!(%node, exit_code = output.exit_code, "liveness check failed");
                }
                Ok(output.success())
            }
            Err(err) if err.kind() == ErrorKind::Cancelled => Err(err),
            Err(err) => {
                debug!(%node, error = %err, "node unreachable");
                Ok(false)
            }
        }
    }

    // ---------------------------------------------------------------
    // Scale-out / scale-in
    // ---------------------------------------------------------------

    /// Add one worker node; returns its name
    pub async fn add_node(&self, public: bool, cancel: &CancellationToken) -> ProvisioningResult<String> {
        let mut names = self.add_nodes(1, public, cancel).await?;
        names
            .pop()
            .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Node, self.identity.name()))
    }

    /// Add `count` worker nodes in parallel; returns their names
    pub async fn add_nodes(
        &self,
        count: usize,
        public: bool,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<Vec<String>> {
        self.require_created().await?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let role = worker_role(public);
        let names = self.register_nodes(role, count).await?;
        info!(cluster = %self.identity.name(), %role, count, "adding nodes");

        let group = names.clone();
        self.run_pipeline("add nodes", cancel, |token| async move {
            self.provision_group(&group, true, &token).await
        })
        .await?;
        Ok(names.into_iter().map(String::from).collect())
    }

    /// Remove the worker with the highest index; returns its name
    pub async fn delete_last_node(
        &self,
        public: bool,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<String> {
        let role = worker_role(public);
        let name = {
            let inner = self.inner.read().await;
            ordered(&inner.nodes)
                .into_iter()
                .filter(|n| n.role() == role)
                .last()
                .map(|n| n.name().to_string())
        }
        .ok_or_else(|| {
            ProvisioningError::not_found(
                ResourceKind::Node,
                format!("{role} of {}", self.identity.name()),
            )
        })?;

        self.delete_specific_node(&name, cancel).await?;
        Ok(name)
    }

    /// Take `name` out of the cluster and delete its host
    ///
    /// # Errors
    ///
    /// - `NotFound` if the cluster has no such node
    /// - `Precondition` for the gateway or the last master
    /// - `Node` when unconfiguring or the absence confirmation failed; the node
    ///   stays `Leaving` and its host is not deleted
    pub async fn delete_specific_node(&self, name: &str, cancel: &CancellationToken) -> ProvisioningResult<()> {
        self.require_created().await?;
        let (role, view) = self.with_node(name, |n| Ok((n.role(), n.view()))).await?;
        if role == NodeRole::Master && self.count_role(NodeRole::Master).await <= 1 {
            return Err(ProvisioningError::Precondition(format!(
                "cannot remove '{name}', the last master of '{}'",
                self.identity.name()
            )));
        }

        self.update_node(name, |n| n.apply(MembershipEvent::RemovalRequested).map(|_| ()))
            .await
            .map_err(|e| e.for_node(name))?;

        let Some(view) = view else {
            debug!(node = %name, "node has no host, nothing to unconfigure");
            self.update_node(name, |n| n.apply(MembershipEvent::AbsenceConfirmed).map(|_| ()))
                .await?;
            self.forget_node(name).await;
            return Ok(());
        };

        let removal = async {
            let coordinator = self.find_coordinator(Some(name), cancel).await.ok();
            let ctx = self.context().await;
            self.blueprint
                .unconfigure_node(&ctx, &view, coordinator.as_ref(), cancel)
                .await?;
            self.confirm_presence(name, NodePresence::Absent, Some(name), cancel)
                .await
        }
        .await;
        if let Err(err) = removal {
            warn!(node = %name, error = %err, "removal not confirmed, keeping host");
            return Err(err.for_node(name));
        }

        self.update_node(name, |n| n.apply(MembershipEvent::AbsenceConfirmed).map(|_| ()))
            .await?;
        match self.stack.delete_host(&view.host_id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(node = %name, host = %view.host_id, "host already gone");
            }
            Err(err) => return Err(err.for_node(name)),
        }
        self.forget_node(name).await;
        info!(node = %name, %role, "node removed");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Start / stop / delete
    // ---------------------------------------------------------------

    /// Start the gateway, then masters, then nodes
    pub async fn start(&self, cancel: &CancellationToken) -> ProvisioningResult<()> {
        self.enter(&[ClusterState::Stopped, ClusterState::Created], ClusterState::Starting)
            .await?;
        let (gateway, masters, workers) = self.host_tiers().await;

        let mut result = Ok(());
        for tier in [gateway, masters, workers] {
            result = self.power_tier(&tier, true, cancel).await;
            if result.is_err() {
                break;
            }
        }
        self.settle(&result, ClusterState::Created).await;
        result
    }

    /// Stop nodes, then masters, then the gateway
    pub async fn stop(&self, cancel: &CancellationToken) -> ProvisioningResult<()> {
        self.enter(&[ClusterState::Created], ClusterState::Stopping).await?;
        let (gateway, masters, workers) = self.host_tiers().await;

        let mut result = Ok(());
        for tier in [workers, masters, gateway] {
            result = self.power_tier(&tier, false, cancel).await;
            if result.is_err() {
                break;
            }
        }
        self.settle(&result, ClusterState::Stopped).await;
        result
    }

    async fn power_tier(&self, hosts: &[String], start: bool, cancel: &CancellationToken) -> ProvisioningResult<()> {
        let results: Vec<ProvisioningResult<()>> = stream::iter(hosts.iter())
            .map(|id| async move {
                if start {
                    self.stack.start_host(id, cancel).await
                } else {
                    self.stack.stop_host(id, cancel).await
                }
            })
            .buffer_unordered(self.config.max_parallel)
            .collect()
            .await;
        first_failure(results)
    }

    /// Delete every host of the cluster, then its network
    ///
    /// Hosts and networks that are already gone are skipped, so a failed
    /// delete can be retried.
    pub async fn delete(&self, cancel: &CancellationToken) -> ProvisioningResult<()> {
        let (gateway, masters, workers) = self.host_tiers().await;
        info!(cluster = %self.identity.name(), "deleting cluster");

        for tier in [workers, masters, gateway] {
            if cancel.is_cancelled() {
                return Err(ProvisioningError::cancelled(format!(
                    "delete cluster {}",
                    self.identity.name()
                )));
            }
            let results: Vec<ProvisioningResult<()>> = stream::iter(tier.iter())
                .map(|id| async move {
                    match self.stack.delete_host(id).await {
                        Err(err) if err.is_not_found() => Ok(()),
                        other => other,
                    }
                })
                .buffer_unordered(self.config.max_parallel)
                .collect()
                .await;
            first_failure(results)?;
        }

        let network = self.inner.read().await.network.clone();
        if let Some(network) = network {
            match self.stack.delete_network(&network.id).await {
                Err(err) if !err.is_not_found() => return Err(err),
                _ => {}
            }
        }

        let mut inner = self.inner.write().await;
        inner.nodes.clear();
        inner.gateway = None;
        inner.network = None;
        inner.state = ClusterState::Removed;
        info!(cluster = %self.identity.name(), "cluster deleted");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------

    /// Current state; a created cluster is `Nominal` only when every node is
    /// a member and its host is started
    pub async fn state(&self) -> ProvisioningResult<ClusterState> {
        let (stored, nodes) = {
            let inner = self.inner.read().await;
            let nodes: Vec<(bool, Option<String>)> = inner
                .nodes
                .iter()
                .map(|n| (n.is_member(), n.host().map(|h| h.id.clone())))
                .collect();
            (inner.state, nodes)
        };
        if stored != ClusterState::Created {
            return Ok(stored);
        }

        for (is_member, host_id) in nodes {
            let Some(host_id) = host_id else {
                return Ok(ClusterState::Degraded);
            };
            if !is_member || self.stack.get_host_state(&host_id).await? != HostState::Started {
                return Ok(ClusterState::Degraded);
            }
        }
        Ok(ClusterState::Nominal)
    }

    pub async fn list_master_ids(&self) -> Vec<String> {
        self.hosts_of(|role| role == NodeRole::Master, |h| h.id.clone()).await
    }

    pub async fn list_master_ips(&self) -> Vec<Ipv4Addr> {
        self.hosts_of(|role| role == NodeRole::Master, |h| h.private_ip).await
    }

    pub async fn list_node_ids(&self, public: bool) -> Vec<String> {
        let wanted = worker_role(public);
        self.hosts_of(|role| role == wanted, |h| h.id.clone()).await
    }

    pub async fn list_node_ips(&self, public: bool) -> Vec<Ipv4Addr> {
        let wanted = worker_role(public);
        self.hosts_of(|role| role == wanted, |h| h.private_ip).await
    }

    /// Master able to coordinate the cluster right now
    pub async fn find_available_master(&self, cancel: &CancellationToken) -> ProvisioningResult<NodeView> {
        self.find_coordinator(None, cancel).await
    }

    /// First member worker whose liveness check succeeds
    pub async fn find_available_node(
        &self,
        public: bool,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<NodeView> {
        let role = worker_role(public);
        let candidates: Vec<NodeView> = {
            let inner = self.inner.read().await;
            ordered(&inner.nodes)
                .into_iter()
                .filter(|n| n.role() == role && n.is_member())
                .filter_map(NodeRecord::view)
                .collect()
        };
        for node in candidates {
            if self.is_live(&node.name, cancel).await? {
                return Ok(node);
            }
        }
        Err(ProvisioningError::not_found(
            ResourceKind::Node,
            format!("live {role} of {}", self.identity.name()),
        ))
    }

    pub async fn search_node(&self, name: &str) -> bool {
        self.inner
            .read()
            .await
            .nodes
            .iter()
            .any(|n| n.name().as_str() == name)
    }

    pub async fn get_node(&self, name: &str) -> ProvisioningResult<NodeRecord> {
        self.with_node(name, |n| Ok(n.clone())).await
    }

    /// Every node record, masters first
    pub async fn list_nodes(&self) -> Vec<NodeRecord> {
        let inner = self.inner.read().await;
        ordered(&inner.nodes).into_iter().cloned().collect()
    }

    pub async fn count_nodes(&self, public: bool) -> usize {
        self.count_role(worker_role(public)).await
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    async fn count_role(&self, role: NodeRole) -> usize {
        self.inner
            .read()
            .await
            .nodes
            .iter()
            .filter(|n| n.role() == role)
            .count()
    }

    async fn hosts_of<T>(&self, role: impl Fn(NodeRole) -> bool, project: impl Fn(&Host) -> T) -> Vec<T> {
        let inner = self.inner.read().await;
        ordered(&inner.nodes)
            .into_iter()
            .filter(|n| role(n.role()))
            .filter_map(|n| n.host())
            .map(project)
            .collect()
    }

    /// Host ids of the gateway, masters and workers
    async fn host_tiers(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        let gateway = self
            .gateway()
            .await
            .map(|h| vec![h.id])
            .unwrap_or_default();
        let masters = self.list_master_ids().await;
        let workers = self
            .hosts_of(|role| role.is_worker(), |h| h.id.clone())
            .await;
        (gateway, masters, workers)
    }

    async fn require_created(&self) -> ProvisioningResult<()> {
        let inner = self.inner.read().await;
        if inner.state == ClusterState::Created && inner.configured {
            return Ok(());
        }
        Err(ProvisioningError::Precondition(format!(
            "cluster '{}' is not operational ({:?})",
            self.identity.name(),
            inner.state
        )))
    }

    async fn enter(&self, from: &[ClusterState], to: ClusterState) -> ProvisioningResult<()> {
        let mut inner = self.inner.write().await;
        if !from.contains(&inner.state) {
            return Err(ProvisioningError::Precondition(format!(
                "cluster '{}' cannot go from {:?} to {to:?}",
                self.identity.name(),
                inner.state
            )));
        }
        inner.state = to;
        Ok(())
    }

    async fn settle(&self, result: &ProvisioningResult<()>, on_success: ClusterState) {
        let state = if result.is_ok() {
            on_success
        } else {
            ClusterState::Error
        };
        self.inner.write().await.state = state;
    }

    async fn context(&self) -> ClusterContext {
        let inner = self.inner.read().await;
        let mut masters = Vec::new();
        let mut nodes = Vec::new();
        for node in ordered(&inner.nodes) {
            if !node.state().has_running_host() {
                continue;
            }
            if let Some(view) = node.view() {
                if node.role() == NodeRole::Master {
                    masters.push(view);
                } else {
                    nodes.push(view);
                }
            }
        }
        ClusterContext {
            identity: self.identity.clone(),
            remote: self.remote.clone(),
            installer: self.installer.clone(),
            properties: self.properties.clone(),
            membership_poll: self.config.membership_poll(),
            masters,
            nodes,
        }
    }

    async fn node_view(&self, name: &str) -> ProvisioningResult<NodeView> {
        self.with_node(name, |n| {
            n.view()
                .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Host, name))
        })
        .await
    }

    async fn with_node<R>(
        &self,
        name: &str,
        reader: impl FnOnce(&NodeRecord) -> ProvisioningResult<R>,
    ) -> ProvisioningResult<R> {
        let inner = self.inner.read().await;
        let node = inner
            .nodes
            .iter()
            .find(|n| n.name().as_str() == name)
            .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Node, name))?;
        reader(node)
    }

    async fn update_node<R>(
        &self,
        name: &str,
        mutator: impl FnOnce(&mut NodeRecord) -> ProvisioningResult<R>,
    ) -> ProvisioningResult<R> {
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .iter_mut()
            .find(|n| n.name().as_str() == name)
            .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Node, name))?;
        mutator(node)
    }

    async fn fail_node(&self, name: &str, cause: &ProvisioningError) {
        let reason = cause.to_string();
        let outcome = self
            .update_node(name, |n| n.apply(MembershipEvent::Fail { reason }).map(|_| ()))
            .await;
        if let Err(err) = outcome {
            debug!(node = %name, error = %err, "could not mark node failed");
        }
    }

    async fn forget_node(&self, name: &str) {
        let mut inner = self.inner.write().await;
        inner.nodes.retain(|n| n.name().as_str() != name);
    }
}

fn worker_role(public: bool) -> NodeRole {
    if public {
        NodeRole::PublicNode
    } else {
        NodeRole::PrivateNode
    }
}

/// Nodes sorted by role, then by index
fn ordered(nodes: &[NodeRecord]) -> Vec<&NodeRecord> {
    let mut sorted: Vec<&NodeRecord> = nodes.iter().collect();
    sorted.sort_by_key(|n| (n.role(), n.name().index().unwrap_or(0)));
    sorted
}

fn invalid_name(err: HostnameError) -> ProvisioningError {
    ProvisioningError::Precondition(format!("cannot name node: {err}"))
}

/// First error that is not a cancellation, else the first error
fn first_failure(results: Vec<ProvisioningResult<()>>) -> ProvisioningResult<()> {
    let mut errors: Vec<ProvisioningError> = results.into_iter().filter_map(Result::err).collect();
    if errors.is_empty() {
        return Ok(());
    }
    let index = errors
        .iter()
        .position(|e| e.kind() != ErrorKind::Cancelled)
        .unwrap_or(0);
    Err(errors.swap_remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_failure_prefers_root_cause() {
        let results = vec![
            Ok(()),
            Err(ProvisioningError::cancelled("sibling")),
            Err(ProvisioningError::fatal("alpha-node-2", "boot failed")),
        ];
        let err = first_failure(results).unwrap_err();
        assert!(matches!(err, ProvisioningError::FatalRemote { .. }));
    }

    #[test]
    fn test_first_failure_all_cancelled() {
        let results = vec![Err(ProvisioningError::cancelled("a")), Err(ProvisioningError::cancelled("b"))];
        assert_eq!(first_failure(results).unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_ordering_uses_numeric_index() {
        let nodes = vec![
            NodeRecord::new(Hostname::new("alpha-node-10").unwrap(), NodeRole::PrivateNode),
            NodeRecord::new(Hostname::new("alpha-node-2").unwrap(), NodeRole::PrivateNode),
            NodeRecord::new(Hostname::new("alpha-master-1").unwrap(), NodeRole::Master),
        ];
        let names: Vec<String> = ordered(&nodes).iter().map(|n| n.name().to_string()).collect();
        assert_eq!(names, vec!["alpha-master-1", "alpha-node-2", "alpha-node-10"]);
    }
}
