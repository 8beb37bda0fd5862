// Copyright (c) 2025 - Cowboy AI, Inc.
//! Reference stack adapter
//!
//! Implements the full [`StackAdapter`] contract on top of [`SimulatedCloud`].
//! Composite creations run as [`ResourceSaga`](crate::saga::ResourceSaga)s
//! whose steps wait for the provider with the convergence poller, so the
//! adapter exercises the same rollback and retry paths a real provider would.

mod cloud;
mod host;
mod network;
mod volume;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{PollPolicy, ProvisioningConfig};
use crate::convergence::{poll_until, CheckError};
use crate::errors::{ProvisioningError, ProvisioningResult, ResourceKind};
use crate::properties::PropertyBag;
use crate::saga::SagaRegistry;
use crate::stack::model::{
    GatewayRequest, Host, HostRequest, HostState, Network, NetworkRequest, Volume,
    VolumeAttachment, VolumeAttachmentRequest, VolumeRequest,
};
use crate::stack::StackAdapter;

use cloud::Raw;
pub use cloud::{Fault, SimulatedCloud};

/// Adapter metadata kept per network
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NetworkMetadata {
    gateway_id: Option<String>,
}

fn network_section(network_id: &str) -> String {
    format!("network/{network_id}")
}

/// Stack adapter backed by the in-memory cloud
pub struct SimulatedStack {
    cloud: Arc<SimulatedCloud>,
    config: ProvisioningConfig,
    registry: SagaRegistry,
    properties: Arc<PropertyBag>,
}

impl SimulatedStack {
    pub fn new(cloud: Arc<SimulatedCloud>, config: ProvisioningConfig) -> Self {
        Self {
            cloud,
            config,
            registry: SagaRegistry::new(),
            properties: Arc::new(PropertyBag::new()),
        }
    }

    /// The provider API behind this adapter
    pub fn cloud(&self) -> &Arc<SimulatedCloud> {
        &self.cloud
    }

    /// Adapter metadata (gateway records, host sizing)
    pub fn properties(&self) -> &Arc<PropertyBag> {
        &self.properties
    }

    async fn gateway_of(&self, network_id: &str) -> ProvisioningResult<Option<String>> {
        self.properties
            .inspect(&network_section(network_id), |m: &NetworkMetadata| {
                m.gateway_id.clone()
            })
            .await
    }

    async fn network_view(&self, vpc: Raw) -> ProvisioningResult<Network> {
        let gateway_id = self.gateway_of(&vpc.id).await?;
        network::network_from_raw(&self.cloud, vpc, gateway_id)
    }
}

/// Poll `describe` on `id` until the resource is no longer pending
pub(crate) async fn wait_settled(
    cloud: &SimulatedCloud,
    op: &str,
    kind: ResourceKind,
    id: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> ProvisioningResult<Raw> {
    poll_until(&format!("{op} {id}"), policy, cancel, move || async move {
        let raw = cloud
            .describe(op, id)
            .map_err(|e| e.into_provisioning(kind, id))?;
        if raw.is_pending() {
            Err(CheckError::not_ready(format!("{id} is pending")))
        } else {
            Ok(raw)
        }
    })
    .await
}

/// Poll an instance until it reaches `wanted`
///
/// `Error` and `Terminated` (unless wanted) abort the poll.
pub(crate) async fn wait_host_state(
    cloud: &SimulatedCloud,
    id: &str,
    wanted: HostState,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> ProvisioningResult<Raw> {
    poll_until(
        &format!("host {id} {wanted}"),
        policy,
        cancel,
        move || async move {
            let raw = cloud
                .describe("describe_instances", id)
                .map_err(|e| e.into_provisioning(ResourceKind::Host, id))?;
            let code = raw
                .instance_code()
                .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Host, id))?;
            let state = HostState::from_code(code);
            if state == wanted {
                return Ok(raw);
            }
            match state {
                HostState::Error | HostState::Terminated => Err(CheckError::Fatal(
                    ProvisioningError::fatal(id, format!("host entered state {state}")),
                )),
                other => Err(CheckError::not_ready(format!("{id} is {other}"))),
            }
        },
    )
    .await
}

#[async_trait]
impl StackAdapter for SimulatedStack {
    fn provider(&self) -> &str {
        "simulated"
    }

    async fn create_network(
        &self,
        request: NetworkRequest,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<Network> {
        let _lease = self.registry.acquire(&format!("network:{}", request.name))?;
        if self.get_network_by_name(&request.name).await.is_ok() {
            return Err(ProvisioningError::Precondition(format!(
                "network '{}' already exists",
                request.name
            )));
        }

        let name = request.name.clone();
        let vpc_id = network::build(
            self.cloud.clone(),
            self.config.resource_poll(),
            request,
            cancel,
        )
        .await?;
        info!(network = %name, %vpc_id, "network created");
        self.get_network(&vpc_id).await
    }

    async fn get_network(&self, id: &str) -> ProvisioningResult<Network> {
        let vpc = network::find_vpc(&self.cloud, |raw| raw.id == id)?
            .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Network, id))?;
        self.network_view(vpc).await
    }

    async fn get_network_by_name(&self, name: &str) -> ProvisioningResult<Network> {
        let vpc = network::find_vpc(&self.cloud, |raw| raw.name == name)?
            .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Network, name))?;
        self.network_view(vpc).await
    }

    async fn list_networks(&self) -> ProvisioningResult<Vec<Network>> {
        let vpcs = network::list_vpcs(&self.cloud)?;
        let mut networks = Vec::with_capacity(vpcs.len());
        for vpc in vpcs {
            networks.push(self.network_view(vpc).await?);
        }
        Ok(networks)
    }

    async fn delete_network(&self, id: &str) -> ProvisioningResult<()> {
        let _lease = self.registry.acquire(&format!("network-id:{id}"))?;
        network::teardown(&self.cloud, id)?;
        self.properties
            .lock_for_write(&network_section(id))
            .await
            .then_use(|m: &mut NetworkMetadata| {
                m.gateway_id = None;
                Ok(())
            })?;
        info!(network = %id, "network deleted");
        Ok(())
    }

    async fn create_host(
        &self,
        request: HostRequest,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<Host> {
        let _lease = self.registry.acquire(&format!("host:{}", request.name))?;
        let network = self.get_network(&request.network_id).await?;
        host::ensure_unique_name(&self.cloud, request.name.as_str())?;
        host::provision(&self.cloud, &self.config, &network, request, cancel).await
    }

    async fn create_gateway(
        &self,
        request: GatewayRequest,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<Host> {
        let _lease = self.registry.acquire(&format!("host:{}", request.name))?;
        let network = self.get_network(&request.network_id).await?;
        if let Some(existing) = &network.gateway_id {
            return Err(ProvisioningError::Precondition(format!(
                "network '{}' already has gateway '{existing}'",
                network.name
            )));
        }
        host::ensure_unique_name(&self.cloud, request.name.as_str())?;
        host::provision_gateway(
            self.cloud.clone(),
            self.config.clone(),
            self.properties.clone(),
            network,
            request,
            cancel,
        )
        .await
    }

    async fn get_host(&self, id: &str) -> ProvisioningResult<Host> {
        host::find(&self.cloud, |raw| raw.id == id)?
            .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Host, id))
    }

    async fn get_host_by_name(&self, name: &str) -> ProvisioningResult<Host> {
        host::find(&self.cloud, |raw| raw.name == name)?
            .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Host, name))
    }

    async fn list_hosts(&self) -> ProvisioningResult<Vec<Host>> {
        host::list(&self.cloud)
    }

    async fn get_host_state(&self, id: &str) -> ProvisioningResult<HostState> {
        let raw = self
            .cloud
            .describe("describe_instances", id)
            .map_err(|e| e.into_provisioning(ResourceKind::Host, id))?;
        raw.instance_code()
            .map(HostState::from_code)
            .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Host, id))
    }

    async fn start_host(&self, id: &str, cancel: &CancellationToken) -> ProvisioningResult<()> {
        self.get_host(id).await?;
        self.cloud
            .start_instance(id)
            .map_err(|e| e.into_provisioning(ResourceKind::Host, id))?;
        wait_host_state(
            &self.cloud,
            id,
            HostState::Started,
            &self.config.host_ready_poll(),
            cancel,
        )
        .await?;
        info!(host = %id, "host started");
        Ok(())
    }

    async fn stop_host(&self, id: &str, cancel: &CancellationToken) -> ProvisioningResult<()> {
        self.get_host(id).await?;
        self.cloud
            .stop_instance(id)
            .map_err(|e| e.into_provisioning(ResourceKind::Host, id))?;
        wait_host_state(
            &self.cloud,
            id,
            HostState::Stopped,
            &self.config.host_ready_poll(),
            cancel,
        )
        .await?;
        info!(host = %id, "host stopped");
        Ok(())
    }

    async fn delete_host(&self, id: &str) -> ProvisioningResult<()> {
        let _lease = self.registry.acquire(&format!("host-id:{id}"))?;
        let host = self.get_host(id).await?;
        host::teardown(&self.cloud, &self.config, &host).await?;
        self.properties.remove(&host::sizing_section(id)).await;
        self.properties
            .lock_for_write(&network_section(&host.network_id))
            .await
            .then_use(|m: &mut NetworkMetadata| {
                if m.gateway_id.as_deref() == Some(id) {
                    m.gateway_id = None;
                }
                Ok(())
            })?;
        info!(host = %host.name, %id, "host deleted");
        Ok(())
    }

    async fn create_volume(
        &self,
        request: VolumeRequest,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<Volume> {
        let _lease = self.registry.acquire(&format!("volume:{}", request.name))?;
        if volume::find(&self.cloud, |raw| raw.name == request.name)?.is_some() {
            return Err(ProvisioningError::Precondition(format!(
                "volume '{}' already exists",
                request.name
            )));
        }
        volume::provision(
            self.cloud.clone(),
            self.config.resource_poll(),
            request,
            cancel,
        )
        .await
    }

    async fn get_volume(&self, id: &str) -> ProvisioningResult<Volume> {
        volume::find(&self.cloud, |raw| raw.id == id)?
            .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Volume, id))
    }

    async fn get_volume_by_name(&self, name: &str) -> ProvisioningResult<Volume> {
        volume::find(&self.cloud, |raw| raw.name == name)?
            .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Volume, name))
    }

    async fn list_volumes(&self) -> ProvisioningResult<Vec<Volume>> {
        volume::list(&self.cloud)
    }

    async fn delete_volume(&self, id: &str) -> ProvisioningResult<()> {
        self.cloud
            .delete_volume(id)
            .map_err(|e| e.into_provisioning(ResourceKind::Volume, id))?;
        info!(volume = %id, "volume deleted");
        Ok(())
    }

    async fn attach_volume(
        &self,
        request: VolumeAttachmentRequest,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<VolumeAttachment> {
        self.get_host(&request.host_id).await?;
        volume::attach(&self.cloud, &self.config.resource_poll(), request, cancel).await
    }

    async fn detach_volume(&self, host_id: &str, volume_id: &str) -> ProvisioningResult<()> {
        volume::detach(&self.cloud, &self.config.resource_poll(), host_id, volume_id).await
    }
}
