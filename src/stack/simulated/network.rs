// Copyright (c) 2025 - Cowboy AI, Inc.
//! Network build and teardown for the simulated provider

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::cloud::{CloudError, Raw, RawKind, SimulatedCloud, CODE_TERMINATED};
use super::wait_settled;
use crate::config::PollPolicy;
use crate::domain::Cidr;
use crate::errors::{ProvisioningError, ProvisioningResult, ResourceKind};
use crate::saga::{ResourceSaga, SagaStep};
use crate::stack::model::{Network, NetworkRequest, Subnetwork};

/// Handles produced while building a network
pub(super) struct NetworkBuild {
    cloud: Arc<SimulatedCloud>,
    poll: PollPolicy,
    request: NetworkRequest,
    vpc_id: Option<String>,
    subnet_ids: Vec<String>,
    igw_id: Option<String>,
    route_table_id: Option<String>,
    association_id: Option<String>,
}

impl NetworkBuild {
    fn vpc_id(&self) -> ProvisioningResult<String> {
        self.vpc_id
            .clone()
            .ok_or_else(|| ProvisioningError::Precondition("vpc not created".to_string()))
    }

    fn igw_id(&self) -> ProvisioningResult<String> {
        self.igw_id.clone().ok_or_else(|| {
            ProvisioningError::Precondition("internet gateway not created".to_string())
        })
    }
}

fn vpc_err(id: &str) -> impl FnOnce(CloudError) -> ProvisioningError + '_ {
    move |e| e.into_provisioning(ResourceKind::Network, id)
}

fn subnet_err(id: &str) -> impl FnOnce(CloudError) -> ProvisioningError + '_ {
    move |e| e.into_provisioning(ResourceKind::Subnetwork, id)
}

struct CreateVpc;

#[async_trait]
impl SagaStep<NetworkBuild> for CreateVpc {
    fn name(&self) -> &str {
        "create-vpc"
    }

    async fn execute(&self, ctx: &mut NetworkBuild, _cancel: &CancellationToken) -> ProvisioningResult<()> {
        let name = ctx.request.name.clone();
        let id = ctx
            .cloud
            .create_vpc(&name, ctx.request.cidr)
            .map_err(vpc_err(&name))?;
        ctx.vpc_id = Some(id);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut NetworkBuild) -> ProvisioningResult<()> {
        let id = ctx.vpc_id()?;
        ctx.cloud.delete_vpc(&id).map_err(vpc_err(&id))?;
        ctx.vpc_id = None;
        Ok(())
    }
}

struct WaitVpcAvailable;

#[async_trait]
impl SagaStep<NetworkBuild> for WaitVpcAvailable {
    fn name(&self) -> &str {
        "wait-vpc-available"
    }

    async fn execute(&self, ctx: &mut NetworkBuild, cancel: &CancellationToken) -> ProvisioningResult<()> {
        let id = ctx.vpc_id()?;
        wait_settled(&ctx.cloud, "describe_vpcs", ResourceKind::Network, &id, &ctx.poll, cancel)
            .await?;
        Ok(())
    }

    async fn compensate(&self, _ctx: &mut NetworkBuild) -> ProvisioningResult<()> {
        Ok(())
    }
}

struct CreateSubnet {
    step: String,
    name: String,
    cidr: Cidr,
    public: bool,
}

#[async_trait]
impl SagaStep<NetworkBuild> for CreateSubnet {
    fn name(&self) -> &str {
        &self.step
    }

    async fn execute(&self, ctx: &mut NetworkBuild, _cancel: &CancellationToken) -> ProvisioningResult<()> {
        let vpc_id = ctx.vpc_id()?;
        let id = ctx
            .cloud
            .create_subnet(&vpc_id, &self.name, self.cidr, self.public)
            .map_err(subnet_err(&self.name))?;
        ctx.subnet_ids.push(id);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut NetworkBuild) -> ProvisioningResult<()> {
        if let Some(id) = ctx.subnet_ids.pop() {
            ctx.cloud.delete_subnet(&id).map_err(subnet_err(&id))?;
        }
        Ok(())
    }
}

/// Waits for the most recently created subnetwork
struct WaitSubnetAvailable {
    step: String,
}

#[async_trait]
impl SagaStep<NetworkBuild> for WaitSubnetAvailable {
    fn name(&self) -> &str {
        &self.step
    }

    async fn execute(&self, ctx: &mut NetworkBuild, cancel: &CancellationToken) -> ProvisioningResult<()> {
        let id = ctx.subnet_ids.last().cloned().ok_or_else(|| {
            ProvisioningError::Precondition("no subnetwork to wait for".to_string())
        })?;
        wait_settled(
            &ctx.cloud,
            "describe_subnets",
            ResourceKind::Subnetwork,
            &id,
            &ctx.poll,
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn compensate(&self, _ctx: &mut NetworkBuild) -> ProvisioningResult<()> {
        Ok(())
    }
}

struct CreateInternetGateway;

#[async_trait]
impl SagaStep<NetworkBuild> for CreateInternetGateway {
    fn name(&self) -> &str {
        "create-internet-gateway"
    }

    async fn execute(&self, ctx: &mut NetworkBuild, _cancel: &CancellationToken) -> ProvisioningResult<()> {
        let name = format!("{}-igw", ctx.request.name);
        let id = ctx
            .cloud
            .create_internet_gateway(&name)
            .map_err(vpc_err(&name))?;
        ctx.igw_id = Some(id);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut NetworkBuild) -> ProvisioningResult<()> {
        let id = ctx.igw_id()?;
        ctx.cloud.delete_internet_gateway(&id).map_err(vpc_err(&id))?;
        ctx.igw_id = None;
        Ok(())
    }
}

struct AttachInternetGateway;

#[async_trait]
impl SagaStep<NetworkBuild> for AttachInternetGateway {
    fn name(&self) -> &str {
        "attach-internet-gateway"
    }

    async fn execute(&self, ctx: &mut NetworkBuild, _cancel: &CancellationToken) -> ProvisioningResult<()> {
        let (igw, vpc) = (ctx.igw_id()?, ctx.vpc_id()?);
        ctx.cloud
            .attach_internet_gateway(&igw, &vpc)
            .map_err(vpc_err(&igw))
    }

    async fn compensate(&self, ctx: &mut NetworkBuild) -> ProvisioningResult<()> {
        let (igw, vpc) = (ctx.igw_id()?, ctx.vpc_id()?);
        ctx.cloud
            .detach_internet_gateway(&igw, &vpc)
            .map_err(vpc_err(&igw))
    }
}

struct CreateDefaultRoute;

#[async_trait]
impl SagaStep<NetworkBuild> for CreateDefaultRoute {
    fn name(&self) -> &str {
        "create-default-route"
    }

    async fn execute(&self, ctx: &mut NetworkBuild, _cancel: &CancellationToken) -> ProvisioningResult<()> {
        let (igw, vpc) = (ctx.igw_id()?, ctx.vpc_id()?);
        let table = ctx.cloud.main_route_table(&vpc).map_err(vpc_err(&vpc))?;
        ctx.cloud
            .create_route(&table, Cidr::any(), &igw)
            .map_err(vpc_err(&table))?;
        ctx.route_table_id = Some(table);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut NetworkBuild) -> ProvisioningResult<()> {
        if let Some(table) = ctx.route_table_id.take() {
            ctx.cloud
                .delete_route(&table, Cidr::any())
                .map_err(vpc_err(&table))?;
        }
        Ok(())
    }
}

struct AssociatePublicSubnet;

#[async_trait]
impl SagaStep<NetworkBuild> for AssociatePublicSubnet {
    fn name(&self) -> &str {
        "associate-route-table"
    }

    async fn execute(&self, ctx: &mut NetworkBuild, _cancel: &CancellationToken) -> ProvisioningResult<()> {
        let table = ctx.route_table_id.clone().ok_or_else(|| {
            ProvisioningError::Precondition("route table not resolved".to_string())
        })?;
        let subnet = ctx.subnet_ids.first().cloned().ok_or_else(|| {
            ProvisioningError::Precondition("no subnetwork to associate".to_string())
        })?;
        let association = ctx
            .cloud
            .associate_route_table(&table, &subnet)
            .map_err(subnet_err(&subnet))?;
        ctx.association_id = Some(association);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut NetworkBuild) -> ProvisioningResult<()> {
        if let Some(association) = ctx.association_id.take() {
            ctx.cloud
                .disassociate_route_table(&association)
                .map_err(vpc_err(&association))?;
        }
        Ok(())
    }
}

/// Subnetworks to create: the whole CIDR, or public and private halves
fn plan_subnets(request: &NetworkRequest) -> ProvisioningResult<Vec<CreateSubnet>> {
    if !request.split_public_private {
        return Ok(vec![CreateSubnet {
            step: "create-subnet".to_string(),
            name: request.name.clone(),
            cidr: request.cidr,
            public: true,
        }]);
    }

    let (public, private) = request
        .cidr
        .halves()
        .map_err(|e| ProvisioningError::Precondition(e.to_string()))?;
    Ok(vec![
        CreateSubnet {
            step: "create-public-subnet".to_string(),
            name: format!("{}-public", request.name),
            cidr: public,
            public: true,
        },
        CreateSubnet {
            step: "create-private-subnet".to_string(),
            name: format!("{}-private", request.name),
            cidr: private,
            public: false,
        },
    ])
}

/// Build a network; returns the VPC id
pub(super) async fn build(
    cloud: Arc<SimulatedCloud>,
    poll: PollPolicy,
    request: NetworkRequest,
    cancel: &CancellationToken,
) -> ProvisioningResult<String> {
    let mut saga = ResourceSaga::new(format!("network {}", request.name))
        .step(CreateVpc)
        .step(WaitVpcAvailable);
    for subnet in plan_subnets(&request)? {
        let wait = WaitSubnetAvailable {
            step: subnet.step.replacen("create", "wait", 1),
        };
        saga = saga.step(subnet).step(wait);
    }
    let saga = saga
        .step(CreateInternetGateway)
        .step(AttachInternetGateway)
        .step(CreateDefaultRoute)
        .step(AssociatePublicSubnet);

    let mut ctx = NetworkBuild {
        cloud,
        poll,
        request,
        vpc_id: None,
        subnet_ids: Vec::new(),
        igw_id: None,
        route_table_id: None,
        association_id: None,
    };
    saga.run(&mut ctx, cancel).await?;
    ctx.vpc_id()
}

pub(super) fn list_vpcs(cloud: &SimulatedCloud) -> ProvisioningResult<Vec<Raw>> {
    cloud
        .list("describe_vpcs", |raw| matches!(raw.kind, RawKind::Vpc { .. }))
        .map_err(vpc_err("*"))
}

pub(super) fn find_vpc(
    cloud: &SimulatedCloud,
    predicate: impl Fn(&Raw) -> bool,
) -> ProvisioningResult<Option<Raw>> {
    Ok(list_vpcs(cloud)?.into_iter().find(|raw| predicate(raw)))
}

pub(super) fn network_from_raw(
    cloud: &SimulatedCloud,
    vpc: Raw,
    gateway_id: Option<String>,
) -> ProvisioningResult<Network> {
    let cidr = match vpc.kind {
        RawKind::Vpc { cidr } => cidr,
        _ => return Err(ProvisioningError::not_found(ResourceKind::Network, vpc.id)),
    };
    let subnetworks = cloud
        .list("describe_subnets", |raw| {
            matches!(&raw.kind, RawKind::Subnet { vpc_id, .. } if *vpc_id == vpc.id)
        })
        .map_err(subnet_err("*"))?
        .into_iter()
        .filter_map(|raw| match raw.kind {
            RawKind::Subnet { cidr, public, .. } => Some(Subnetwork {
                id: raw.id,
                name: raw.name,
                network_id: vpc.id.clone(),
                cidr,
                public,
            }),
            _ => None,
        })
        .collect();

    Ok(Network {
        id: vpc.id,
        name: vpc.name,
        cidr,
        subnetworks,
        gateway_id,
    })
}

/// Delete a VPC and its dependents, dependents first
///
/// Order: addresses, route-table associations, subnets, internet gateways,
/// routes and non-main route tables, then the VPC.
pub(super) fn teardown(cloud: &SimulatedCloud, vpc_id: &str) -> ProvisioningResult<()> {
    find_vpc(cloud, |raw| raw.id == vpc_id)?
        .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Network, vpc_id))?;

    let owned = cloud.list("describe_network_resources", |_| true).map_err(vpc_err(vpc_id))?;

    // refuse before touching anything while instances still run inside
    let blocker = owned.iter().find(|raw| {
        matches!(&raw.kind, RawKind::Instance { vpc_id: owner, code, .. }
            if owner == vpc_id && *code != CODE_TERMINATED)
    });
    if let Some(blocker) = blocker {
        return Err(CloudError::DependencyViolation(format!(
            "'{vpc_id}' is used by '{}'",
            blocker.id
        ))
        .into_provisioning(ResourceKind::Network, vpc_id));
    }

    for raw in &owned {
        if let RawKind::Address {
            vpc_id: owner,
            instance_id,
            ..
        } = &raw.kind
        {
            if owner != vpc_id {
                continue;
            }
            if instance_id.is_some() {
                cloud.disassociate_address(&raw.id).map_err(vpc_err(&raw.id))?;
            }
            cloud.release_address(&raw.id).map_err(vpc_err(&raw.id))?;
            debug!(network = %vpc_id, address = %raw.id, "address released");
        }
    }

    for raw in &owned {
        if let RawKind::RouteTable {
            vpc_id: owner,
            associations,
            ..
        } = &raw.kind
        {
            if owner != vpc_id {
                continue;
            }
            for association in associations {
                cloud
                    .disassociate_route_table(&association.id)
                    .map_err(vpc_err(&association.id))?;
            }
        }
    }

    for raw in &owned {
        if matches!(&raw.kind, RawKind::Subnet { vpc_id: owner, .. } if owner == vpc_id) {
            cloud.delete_subnet(&raw.id).map_err(subnet_err(&raw.id))?;
            debug!(network = %vpc_id, subnet = %raw.id, "subnet deleted");
        }
    }

    for raw in &owned {
        if matches!(&raw.kind, RawKind::InternetGateway { attached_to } if attached_to.as_deref() == Some(vpc_id))
        {
            cloud
                .detach_internet_gateway(&raw.id, vpc_id)
                .map_err(vpc_err(&raw.id))?;
            cloud.delete_internet_gateway(&raw.id).map_err(vpc_err(&raw.id))?;
            debug!(network = %vpc_id, gateway = %raw.id, "internet gateway deleted");
        }
    }

    for raw in &owned {
        if let RawKind::RouteTable {
            vpc_id: owner,
            main,
            routes,
            ..
        } = &raw.kind
        {
            if owner != vpc_id {
                continue;
            }
            for route in routes {
                debug!(table = %raw.id, via = %route.gateway_id, "deleting route");
                cloud
                    .delete_route(&raw.id, route.destination)
                    .map_err(vpc_err(&raw.id))?;
            }
            if !main {
                cloud.delete_route_table(&raw.id).map_err(vpc_err(&raw.id))?;
            }
        }
    }

    cloud.delete_vpc(vpc_id).map_err(vpc_err(vpc_id))?;
    info!(network = %vpc_id, "vpc and dependents deleted");
    Ok(())
}
