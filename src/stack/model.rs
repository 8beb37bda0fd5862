// Copyright (c) 2025 - Cowboy AI, Inc.
//! Canonical resource model
//!
//! Every provider adapter translates its native objects into these types, so
//! the cluster controller never sees provider specifics.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::domain::{Cidr, Hostname};

/// Uniform host status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Starting,
    Started,
    Stopping,
    Stopped,
    Terminated,
    Error,
}

impl HostState {
    /// Map an EC2-style instance state code.
    ///
    /// Only the low byte is meaningful; the high byte is provider-internal.
    /// Codes outside the known set map to [`HostState::Error`].
    pub fn from_code(code: u16) -> Self {
        match code & 0x00ff {
            0 => HostState::Starting,
            16 => HostState::Started,
            32 => HostState::Stopping,
            48 => HostState::Terminated,
            64 => HostState::Stopping,
            80 => HostState::Stopped,
            _ => HostState::Error,
        }
    }

    /// Whether the state can no longer change on its own
    pub fn is_settled(&self) -> bool {
        !matches!(self, HostState::Starting | HostState::Stopping)
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostState::Starting => "starting",
            HostState::Started => "started",
            HostState::Stopping => "stopping",
            HostState::Stopped => "stopped",
            HostState::Terminated => "terminated",
            HostState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Compute sizing of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostSizing {
    pub cores: u32,
    pub ram_gb: u32,
    pub disk_gb: u32,
}

impl HostSizing {
    pub const fn new(cores: u32, ram_gb: u32, disk_gb: u32) -> Self {
        Self {
            cores,
            ram_gb,
            disk_gb,
        }
    }
}

impl fmt::Display for HostSizing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cores, {} GB RAM, {} GB disk",
            self.cores, self.ram_gb, self.disk_gb
        )
    }
}

/// Request for a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub name: String,
    pub cidr: Cidr,
    /// Split the CIDR into a public and a private subnetwork
    #[serde(default)]
    pub split_public_private: bool,
}

/// A subnetwork, owned by exactly one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnetwork {
    pub id: String,
    pub name: String,
    pub network_id: String,
    pub cidr: Cidr,
    pub public: bool,
}

/// Isolated network with its subnetworks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub cidr: Cidr,
    pub subnetworks: Vec<Subnetwork>,
    /// Host acting as gateway, once created
    pub gateway_id: Option<String>,
}

impl Network {
    /// Subnetwork for public (or private) hosts; falls back to the first one
    pub fn subnetwork_for(&self, public: bool) -> Option<&Subnetwork> {
        self.subnetworks
            .iter()
            .find(|s| s.public == public)
            .or_else(|| self.subnetworks.first())
    }
}

/// Request for a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRequest {
    pub name: Hostname,
    pub image: String,
    pub sizing: HostSizing,
    pub network_id: String,
    /// Allocate and associate a public address
    #[serde(default)]
    pub public_ip: bool,
}

/// Request for the gateway of a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub name: Hostname,
    pub image: String,
    pub sizing: HostSizing,
    pub network_id: String,
}

impl From<GatewayRequest> for HostRequest {
    fn from(request: GatewayRequest) -> Self {
        HostRequest {
            name: request.name,
            image: request.image,
            sizing: request.sizing,
            network_id: request.network_id,
            public_ip: true,
        }
    }
}

/// A compute host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub state: HostState,
    pub image: String,
    pub sizing: HostSizing,
    pub network_id: String,
    pub subnetwork_id: String,
    pub private_ip: Ipv4Addr,
    pub public_ip: Option<Ipv4Addr>,
}

impl Host {
    /// Address remote commands should reach
    pub fn access_ip(&self) -> Ipv4Addr {
        self.public_ip.unwrap_or(self.private_ip)
    }
}

/// Storage performance class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeSpeed {
    Cold,
    Hdd,
    Ssd,
}

/// Request for a block volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub name: String,
    pub size_gb: u32,
    pub speed: VolumeSpeed,
}

/// Volume status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Error,
}

/// A block volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub size_gb: u32,
    pub speed: VolumeSpeed,
    pub state: VolumeState,
}

/// Request to attach a volume to a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachmentRequest {
    pub volume_id: String,
    pub host_id: String,
}

/// Volume attached to a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub volume_id: String,
    pub host_id: String,
    pub device: String,
}

/// Request for a virtual IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualIpRequest {
    pub name: String,
    pub network_id: String,
}

/// Floating address shared by several hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualIp {
    pub id: String,
    pub name: String,
    pub network_id: String,
    pub private_ip: Option<Ipv4Addr>,
    pub public_ip: Option<Ipv4Addr>,
    pub host_ids: Vec<String>,
}
