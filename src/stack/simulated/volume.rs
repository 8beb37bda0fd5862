// Copyright (c) 2025 - Cowboy AI, Inc.
//! Volumes for the simulated provider

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::cloud::{CloudError, Raw, RawKind, SimulatedCloud};
use super::wait_settled;
use crate::config::PollPolicy;
use crate::errors::{ProvisioningError, ProvisioningResult, ResourceKind};
use crate::saga::{ResourceSaga, SagaStep};
use crate::stack::model::{
    Volume, VolumeAttachment, VolumeAttachmentRequest, VolumeRequest, VolumeState,
};

fn volume_err(id: &str) -> impl FnOnce(CloudError) -> ProvisioningError + '_ {
    move |e| e.into_provisioning(ResourceKind::Volume, id)
}

struct VolumeBuild {
    cloud: Arc<SimulatedCloud>,
    poll: PollPolicy,
    request: VolumeRequest,
    volume_id: Option<String>,
}

struct CreateVolume;

#[async_trait]
impl SagaStep<VolumeBuild> for CreateVolume {
    fn name(&self) -> &str {
        "create-volume"
    }

    async fn execute(&self, ctx: &mut VolumeBuild, _cancel: &CancellationToken) -> ProvisioningResult<()> {
        let request = &ctx.request;
        let id = ctx
            .cloud
            .create_volume(&request.name, request.size_gb, request.speed)
            .map_err(volume_err(&request.name))?;
        ctx.volume_id = Some(id);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut VolumeBuild) -> ProvisioningResult<()> {
        if let Some(id) = ctx.volume_id.take() {
            ctx.cloud.delete_volume(&id).map_err(volume_err(&id))?;
        }
        Ok(())
    }
}

struct WaitAvailable;

#[async_trait]
impl SagaStep<VolumeBuild> for WaitAvailable {
    fn name(&self) -> &str {
        "wait-available"
    }

    async fn execute(&self, ctx: &mut VolumeBuild, cancel: &CancellationToken) -> ProvisioningResult<()> {
        let id = ctx
            .volume_id
            .clone()
            .ok_or_else(|| ProvisioningError::Precondition("volume not created".to_string()))?;
        wait_settled(&ctx.cloud, "describe_volumes", ResourceKind::Volume, &id, &ctx.poll, cancel)
            .await?;
        Ok(())
    }

    async fn compensate(&self, _ctx: &mut VolumeBuild) -> ProvisioningResult<()> {
        Ok(())
    }
}

pub(super) async fn provision(
    cloud: Arc<SimulatedCloud>,
    poll: PollPolicy,
    request: VolumeRequest,
    cancel: &CancellationToken,
) -> ProvisioningResult<Volume> {
    let saga = ResourceSaga::new(format!("volume {}", request.name))
        .step(CreateVolume)
        .step(WaitAvailable);
    let mut ctx = VolumeBuild {
        cloud: cloud.clone(),
        poll,
        request,
        volume_id: None,
    };
    saga.run(&mut ctx, cancel).await?;

    let id = ctx
        .volume_id
        .ok_or_else(|| ProvisioningError::Precondition("volume not created".to_string()))?;
    let volume = find(&cloud, |v| v.id == id)?
        .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Volume, id.clone()))?;
    info!(volume = %volume.name, id = %volume.id, size_gb = volume.size_gb, "volume ready");
    Ok(volume)
}

fn volume_from_raw(raw: Raw) -> Option<Volume> {
    let pending = raw.is_pending();
    match raw.kind {
        RawKind::Volume {
            size_gb,
            speed,
            attached_to,
        } => Some(Volume {
            id: raw.id,
            name: raw.name,
            size_gb,
            speed,
            state: match (attached_to.is_some(), pending) {
                (true, _) => VolumeState::InUse,
                (false, true) => VolumeState::Creating,
                (false, false) => VolumeState::Available,
            },
        }),
        _ => None,
    }
}

pub(super) fn list(cloud: &SimulatedCloud) -> ProvisioningResult<Vec<Volume>> {
    Ok(cloud
        .list("describe_volumes", |raw| matches!(raw.kind, RawKind::Volume { .. }))
        .map_err(volume_err("*"))?
        .into_iter()
        .filter_map(volume_from_raw)
        .collect())
}

pub(super) fn find(
    cloud: &SimulatedCloud,
    predicate: impl Fn(&Volume) -> bool,
) -> ProvisioningResult<Option<Volume>> {
    Ok(list(cloud)?.into_iter().find(|volume| predicate(volume)))
}

pub(super) async fn attach(
    cloud: &SimulatedCloud,
    poll: &PollPolicy,
    request: VolumeAttachmentRequest,
    cancel: &CancellationToken,
) -> ProvisioningResult<VolumeAttachment> {
    let device = cloud
        .attach_volume(&request.volume_id, &request.host_id)
        .map_err(volume_err(&request.volume_id))?;
    wait_settled(
        cloud,
        "describe_volumes",
        ResourceKind::Volume,
        &request.volume_id,
        poll,
        cancel,
    )
    .await?;
    info!(volume = %request.volume_id, host = %request.host_id, %device, "volume attached");
    Ok(VolumeAttachment {
        volume_id: request.volume_id,
        host_id: request.host_id,
        device,
    })
}

pub(super) async fn detach(
    cloud: &SimulatedCloud,
    poll: &PollPolicy,
    host_id: &str,
    volume_id: &str,
) -> ProvisioningResult<()> {
    cloud
        .detach_volume(volume_id, host_id)
        .map_err(volume_err(volume_id))?;
    wait_settled(
        cloud,
        "describe_volumes",
        ResourceKind::Volume,
        volume_id,
        poll,
        &CancellationToken::new(),
    )
    .await?;
    info!(volume = %volume_id, host = %host_id, "volume detached");
    Ok(())
}
