// Copyright (c) 2025 - Cowboy AI, Inc.
//! Stack Adapter Abstraction
//!
//! A stack adapter hides one cloud provider behind a uniform capability set:
//! networks, hosts, volumes and virtual IPs, all expressed in the canonical
//! [`model`] types.
//!
//! # Architecture
//!
//! ```text
//! ClusterController → StackAdapter → Provider API
//!                          ↓
//!          ResourceSaga + ConvergencePoller
//! ```
//!
//! # Contract
//!
//! 1. **Ready on return**: `create_*` returns only once the resource is usable,
//!    polling the provider until it converges
//! 2. **All or nothing**: a failed composite create leaves no orphaned parts;
//!    rollback failures surface as consequences of the returned error
//! 3. **Ordered listings**: `list_*` results are sorted by provider id
//! 4. **Explicit absence**: `get_*` and a repeated `delete_*` return NotFound
//! 5. **Total status mapping**: every provider status maps into [`HostState`]
//! 6. **No silent no-ops**: missing capabilities return Unsupported

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::{ProvisioningError, ProvisioningResult};

pub mod model;
pub mod simulated;

pub use model::{
    GatewayRequest, Host, HostRequest, HostSizing, HostState, Network, NetworkRequest,
    Subnetwork, VirtualIp, VirtualIpRequest, Volume, VolumeAttachment, VolumeAttachmentRequest,
    VolumeRequest, VolumeSpeed, VolumeState,
};
pub use simulated::{Fault, SimulatedCloud, SimulatedStack};

/// Per-provider capability set
///
/// Implementations must be safe to share between the concurrent pipelines of
/// a cluster controller.
#[async_trait]
pub trait StackAdapter: Send + Sync {
    /// Provider name, used in logs
    fn provider(&self) -> &str;

    // ---------------------------------------------------------------
    // Networks
    // ---------------------------------------------------------------

    /// Create a network with its subnetworks, internet gateway and routes
    ///
    /// # Errors
    ///
    /// - `Precondition` if a network with the same name is being built
    /// - `Composite` if a step failed; completed steps were rolled back
    async fn create_network(
        &self,
        request: NetworkRequest,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<Network>;

    async fn get_network(&self, id: &str) -> ProvisioningResult<Network>;

    async fn get_network_by_name(&self, name: &str) -> ProvisioningResult<Network>;

    async fn list_networks(&self) -> ProvisioningResult<Vec<Network>>;

    /// Delete a network and everything that depends on it
    ///
    /// Dependents go first: addresses, route-table associations, subnetworks,
    /// internet gateways, routes and route tables, then the network itself.
    async fn delete_network(&self, id: &str) -> ProvisioningResult<()>;

    // ---------------------------------------------------------------
    // Hosts
    // ---------------------------------------------------------------

    /// Create a host and wait until it is Started
    async fn create_host(
        &self,
        request: HostRequest,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<Host>;

    /// Create the gateway host of a network
    ///
    /// A gateway always gets a public address. It is recorded on the network
    /// so later hosts can route through it.
    async fn create_gateway(
        &self,
        request: GatewayRequest,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<Host>;

    async fn get_host(&self, id: &str) -> ProvisioningResult<Host>;

    async fn get_host_by_name(&self, name: &str) -> ProvisioningResult<Host>;

    async fn list_hosts(&self) -> ProvisioningResult<Vec<Host>>;

    /// Current provider status of a host
    async fn get_host_state(&self, id: &str) -> ProvisioningResult<HostState>;

    async fn start_host(&self, id: &str, cancel: &CancellationToken) -> ProvisioningResult<()>;

    async fn stop_host(&self, id: &str, cancel: &CancellationToken) -> ProvisioningResult<()>;

    /// Terminate a host and release its public address
    async fn delete_host(&self, id: &str) -> ProvisioningResult<()>;

    // ---------------------------------------------------------------
    // Volumes
    // ---------------------------------------------------------------

    async fn create_volume(
        &self,
        request: VolumeRequest,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<Volume>;

    async fn get_volume(&self, id: &str) -> ProvisioningResult<Volume>;

    async fn get_volume_by_name(&self, name: &str) -> ProvisioningResult<Volume>;

    async fn list_volumes(&self) -> ProvisioningResult<Vec<Volume>>;

    async fn delete_volume(&self, id: &str) -> ProvisioningResult<()>;

    /// Attach a volume and wait until the provider reports it in use
    async fn attach_volume(
        &self,
        request: VolumeAttachmentRequest,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<VolumeAttachment>;

    async fn detach_volume(&self, host_id: &str, volume_id: &str) -> ProvisioningResult<()>;

    // ---------------------------------------------------------------
    // Virtual IPs (optional capability)
    // ---------------------------------------------------------------

    async fn create_vip(&self, request: VirtualIpRequest) -> ProvisioningResult<VirtualIp> {
        let _ = request;
        Err(ProvisioningError::unsupported("create_vip"))
    }

    async fn add_public_ip_to_vip(&self, vip: &VirtualIp) -> ProvisioningResult<VirtualIp> {
        let _ = vip;
        Err(ProvisioningError::unsupported("add_public_ip_to_vip"))
    }

    async fn bind_host_to_vip(&self, vip: &VirtualIp, host_id: &str) -> ProvisioningResult<()> {
        let _ = (vip, host_id);
        Err(ProvisioningError::unsupported("bind_host_to_vip"))
    }

    async fn unbind_host_from_vip(
        &self,
        vip: &VirtualIp,
        host_id: &str,
    ) -> ProvisioningResult<()> {
        let _ = (vip, host_id);
        Err(ProvisioningError::unsupported("unbind_host_from_vip"))
    }

    async fn delete_vip(&self, vip: &VirtualIp) -> ProvisioningResult<()> {
        let _ = vip;
        Err(ProvisioningError::unsupported("delete_vip"))
    }
}
