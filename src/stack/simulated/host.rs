// Copyright (c) 2025 - Cowboy AI, Inc.
//! Host and gateway creation for the simulated provider

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cloud::{CloudError, Raw, RawKind, SimulatedCloud};
use super::{network_section, wait_host_state, NetworkMetadata};
use crate::config::{PollPolicy, ProvisioningConfig};
use crate::errors::{ProvisioningError, ProvisioningResult, ResourceKind};
use crate::properties::PropertyBag;
use crate::saga::{ResourceSaga, SagaStep};
use crate::stack::model::{
    GatewayRequest, Host, HostRequest, HostSizing, HostState, Network, Subnetwork,
};

pub(super) fn sizing_section(host_id: &str) -> String {
    format!("host/{host_id}/sizing")
}

fn host_err(id: &str) -> impl FnOnce(CloudError) -> ProvisioningError + '_ {
    move |e| e.into_provisioning(ResourceKind::Host, id)
}

/// Handles produced while building a host
struct HostBuild {
    cloud: Arc<SimulatedCloud>,
    ready: PollPolicy,
    request: HostRequest,
    subnet: Subnetwork,
    instance_id: Option<String>,
    address_id: Option<String>,
    associated: bool,
}

impl HostBuild {
    fn instance_id(&self) -> ProvisioningResult<String> {
        self.instance_id
            .clone()
            .ok_or_else(|| ProvisioningError::Precondition("instance not launched".to_string()))
    }
}

struct RunInstance;

#[async_trait]
impl SagaStep<HostBuild> for RunInstance {
    fn name(&self) -> &str {
        "run-instance"
    }

    async fn execute(&self, ctx: &mut HostBuild, _cancel: &CancellationToken) -> ProvisioningResult<()> {
        let name = ctx.request.name.to_string();
        let id = ctx
            .cloud
            .run_instance(&name, &ctx.request.image, ctx.request.sizing, &ctx.subnet.id)
            .map_err(host_err(&name))?;
        debug!(host = %name, instance = %id, "instance launched");
        ctx.instance_id = Some(id);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut HostBuild) -> ProvisioningResult<()> {
        let id = ctx.instance_id()?;
        terminate(&ctx.cloud, &id, &ctx.ready).await?;
        ctx.instance_id = None;
        Ok(())
    }
}

struct WaitRunning;

#[async_trait]
impl SagaStep<HostBuild> for WaitRunning {
    fn name(&self) -> &str {
        "wait-running"
    }

    async fn execute(&self, ctx: &mut HostBuild, cancel: &CancellationToken) -> ProvisioningResult<()> {
        let id = ctx.instance_id()?;
        wait_host_state(&ctx.cloud, &id, HostState::Started, &ctx.ready, cancel).await?;
        Ok(())
    }

    async fn compensate(&self, _ctx: &mut HostBuild) -> ProvisioningResult<()> {
        Ok(())
    }
}

struct AllocateAddress;

#[async_trait]
impl SagaStep<HostBuild> for AllocateAddress {
    fn name(&self) -> &str {
        "allocate-address"
    }

    async fn execute(&self, ctx: &mut HostBuild, _cancel: &CancellationToken) -> ProvisioningResult<()> {
        let network = ctx.subnet.network_id.clone();
        let id = ctx
            .cloud
            .allocate_address(&network)
            .map_err(host_err(&network))?;
        ctx.address_id = Some(id);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut HostBuild) -> ProvisioningResult<()> {
        if let Some(id) = ctx.address_id.take() {
            ctx.cloud.release_address(&id).map_err(host_err(&id))?;
        }
        Ok(())
    }
}

struct AssociateAddress;

#[async_trait]
impl SagaStep<HostBuild> for AssociateAddress {
    fn name(&self) -> &str {
        "associate-address"
    }

    async fn execute(&self, ctx: &mut HostBuild, _cancel: &CancellationToken) -> ProvisioningResult<()> {
        let instance = ctx.instance_id()?;
        let address = ctx.address_id.clone().ok_or_else(|| {
            ProvisioningError::Precondition("address not allocated".to_string())
        })?;
        ctx.cloud
            .associate_address(&address, &instance)
            .map_err(host_err(&instance))?;
        ctx.associated = true;
        Ok(())
    }

    async fn compensate(&self, ctx: &mut HostBuild) -> ProvisioningResult<()> {
        if let (true, Some(address)) = (ctx.associated, ctx.address_id.as_ref()) {
            ctx.cloud
                .disassociate_address(address)
                .map_err(host_err(address))?;
            ctx.associated = false;
        }
        Ok(())
    }
}

/// Terminate an instance and wait until the provider reports it gone
async fn terminate(cloud: &SimulatedCloud, id: &str, policy: &PollPolicy) -> ProvisioningResult<()> {
    cloud.terminate_instance(id).map_err(host_err(id))?;
    // runs to completion regardless of the caller token
    wait_host_state(cloud, id, HostState::Terminated, policy, &CancellationToken::new()).await?;
    Ok(())
}

pub(super) fn ensure_unique_name(cloud: &SimulatedCloud, name: &str) -> ProvisioningResult<()> {
    if find(cloud, |raw| raw.name == name)?.is_some() {
        return Err(ProvisioningError::Precondition(format!(
            "host '{name}' already exists"
        )));
    }
    Ok(())
}

/// Create a host in `network` and return it once Started
pub(super) async fn provision(
    cloud: &Arc<SimulatedCloud>,
    config: &ProvisioningConfig,
    network: &Network,
    request: HostRequest,
    cancel: &CancellationToken,
) -> ProvisioningResult<Host> {
    let subnet = network
        .subnetwork_for(request.public_ip)
        .cloned()
        .ok_or_else(|| {
            ProvisioningError::Precondition(format!(
                "network '{}' has no subnetwork",
                network.name
            ))
        })?;

    let mut saga = ResourceSaga::new(format!("host {}", request.name))
        .step(RunInstance)
        .step(WaitRunning);
    if request.public_ip {
        saga = saga.step(AllocateAddress).step(AssociateAddress);
    }

    let mut ctx = HostBuild {
        cloud: cloud.clone(),
        ready: config.host_ready_poll(),
        request,
        subnet,
        instance_id: None,
        address_id: None,
        associated: false,
    };
    saga.run(&mut ctx, cancel).await?;

    let id = ctx.instance_id()?;
    let host = find(cloud, |raw| raw.id == id)?
        .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Host, id.clone()))?;
    info!(host = %host.name, id = %host.id, ip = %host.access_ip(), "host ready");
    Ok(host)
}

/// Handles produced while building a gateway
struct GatewayBuild {
    cloud: Arc<SimulatedCloud>,
    config: ProvisioningConfig,
    properties: Arc<PropertyBag>,
    network: Network,
    request: HostRequest,
    host: Option<Host>,
}

impl GatewayBuild {
    fn host(&self) -> ProvisioningResult<&Host> {
        self.host
            .as_ref()
            .ok_or_else(|| ProvisioningError::Precondition("gateway host not created".to_string()))
    }
}

struct CreateGatewayHost;

#[async_trait]
impl SagaStep<GatewayBuild> for CreateGatewayHost {
    fn name(&self) -> &str {
        "create-gateway-host"
    }

    async fn execute(&self, ctx: &mut GatewayBuild, cancel: &CancellationToken) -> ProvisioningResult<()> {
        let host = provision(
            &ctx.cloud,
            &ctx.config,
            &ctx.network,
            ctx.request.clone(),
            cancel,
        )
        .await?;
        ctx.host = Some(host);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut GatewayBuild) -> ProvisioningResult<()> {
        if let Some(host) = ctx.host.take() {
            teardown(&ctx.cloud, &ctx.config, &host).await?;
        }
        Ok(())
    }
}

struct TagGatewaySizing;

#[async_trait]
impl SagaStep<GatewayBuild> for TagGatewaySizing {
    fn name(&self) -> &str {
        "record-gateway-sizing"
    }

    async fn execute(&self, ctx: &mut GatewayBuild, _cancel: &CancellationToken) -> ProvisioningResult<()> {
        let host = ctx.host()?.clone();
        let sizing = serde_json::to_string(&host.sizing)?;
        ctx.cloud
            .create_tags(&host.id, &[("role", "gateway".to_string()), ("sizing", sizing)])
            .map_err(host_err(&host.id))?;

        ctx.properties
            .lock_for_write(&sizing_section(&host.id))
            .await
            .then_use(|stored: &mut Option<HostSizing>| {
                *stored = Some(host.sizing);
                Ok(())
            })
    }

    async fn compensate(&self, ctx: &mut GatewayBuild) -> ProvisioningResult<()> {
        let id = ctx.host()?.id.clone();
        ctx.properties.remove(&sizing_section(&id)).await;
        Ok(())
    }
}

struct RecordGateway;

#[async_trait]
impl SagaStep<GatewayBuild> for RecordGateway {
    fn name(&self) -> &str {
        "record-gateway"
    }

    async fn execute(&self, ctx: &mut GatewayBuild, _cancel: &CancellationToken) -> ProvisioningResult<()> {
        let id = ctx.host()?.id.clone();
        let network = ctx.network.name.clone();
        ctx.properties
            .lock_for_write(&network_section(&ctx.network.id))
            .await
            .then_use(|meta: &mut NetworkMetadata| {
                if let Some(existing) = &meta.gateway_id {
                    return Err(ProvisioningError::Precondition(format!(
                        "network '{network}' already has gateway '{existing}'"
                    )));
                }
                meta.gateway_id = Some(id);
                Ok(())
            })
    }

    async fn compensate(&self, ctx: &mut GatewayBuild) -> ProvisioningResult<()> {
        ctx.properties
            .lock_for_write(&network_section(&ctx.network.id))
            .await
            .then_use(|meta: &mut NetworkMetadata| {
                meta.gateway_id = None;
                Ok(())
            })
    }
}

/// Create the gateway host of `network`
///
/// The gateway is an ordinary host with a public address whose sizing is
/// recorded on the instance and in the adapter metadata. A failure after the
/// host exists deletes the host again.
pub(super) async fn provision_gateway(
    cloud: Arc<SimulatedCloud>,
    config: ProvisioningConfig,
    properties: Arc<PropertyBag>,
    network: Network,
    request: GatewayRequest,
    cancel: &CancellationToken,
) -> ProvisioningResult<Host> {
    let saga = ResourceSaga::new(format!("gateway {}", request.name))
        .step(CreateGatewayHost)
        .step(TagGatewaySizing)
        .step(RecordGateway);

    let mut ctx = GatewayBuild {
        cloud,
        config,
        properties,
        network,
        request: request.into(),
        host: None,
    };
    saga.run(&mut ctx, cancel).await?;
    let host = ctx.host()?.clone();
    info!(gateway = %host.name, network = %ctx.network.name, "gateway ready");
    Ok(host)
}

/// Release the public address of a host, detach its volumes, terminate it
pub(super) async fn teardown(
    cloud: &SimulatedCloud,
    config: &ProvisioningConfig,
    host: &Host,
) -> ProvisioningResult<()> {
    let attached = cloud
        .list("describe_host_resources", |raw| match &raw.kind {
            RawKind::Address { instance_id, .. } => instance_id.as_deref() == Some(host.id.as_str()),
            RawKind::Volume { attached_to, .. } => {
                attached_to.as_ref().map(|(h, _)| h.as_str()) == Some(host.id.as_str())
            }
            _ => false,
        })
        .map_err(host_err(&host.id))?;

    for raw in attached {
        match raw.kind {
            RawKind::Address { .. } => {
                cloud.disassociate_address(&raw.id).map_err(host_err(&raw.id))?;
                cloud.release_address(&raw.id).map_err(host_err(&raw.id))?;
            }
            RawKind::Volume { .. } => {
                warn!(host = %host.name, volume = %raw.id, "detaching volume of deleted host");
                cloud
                    .detach_volume(&raw.id, &host.id)
                    .map_err(host_err(&raw.id))?;
            }
            _ => {}
        }
    }

    terminate(cloud, &host.id, &config.host_ready_poll()).await
}

fn host_from_raw(raw: Raw, public_ip: Option<Ipv4Addr>) -> Option<Host> {
    let code = raw.instance_code()?;
    match raw.kind {
        RawKind::Instance {
            image,
            sizing,
            vpc_id,
            subnet_id,
            private_ip,
            ..
        } => Some(Host {
            id: raw.id,
            name: raw.name,
            state: HostState::from_code(code),
            image,
            sizing,
            network_id: vpc_id,
            subnetwork_id: subnet_id,
            private_ip,
            public_ip,
        }),
        _ => None,
    }
}

/// Every instance that is not terminated, ordered by id
pub(super) fn list(cloud: &SimulatedCloud) -> ProvisioningResult<Vec<Host>> {
    let resources = cloud
        .list("describe_instances", |raw| {
            matches!(raw.kind, RawKind::Instance { .. } | RawKind::Address { .. })
        })
        .map_err(host_err("*"))?;

    let addresses: Vec<(String, Ipv4Addr)> = resources
        .iter()
        .filter_map(|raw| match &raw.kind {
            RawKind::Address {
                instance_id: Some(instance),
                public_ip,
                ..
            } => Some((instance.clone(), *public_ip)),
            _ => None,
        })
        .collect();

    Ok(resources
        .into_iter()
        .filter(|raw| {
            raw.instance_code()
                .map(|code| HostState::from_code(code) != HostState::Terminated)
                .unwrap_or(false)
        })
        .filter_map(|raw| {
            let public_ip = addresses
                .iter()
                .find(|(instance, _)| *instance == raw.id)
                .map(|(_, ip)| *ip);
            host_from_raw(raw, public_ip)
        })
        .collect())
}

pub(super) fn find(
    cloud: &SimulatedCloud,
    predicate: impl Fn(&Host) -> bool,
) -> ProvisioningResult<Option<Host>> {
    Ok(list(cloud)?.into_iter().find(|host| predicate(host)))
}
