// Copyright (c) 2025 - Cowboy AI, Inc.
//! Bunch-of-hosts flavor
//!
//! Hosts with the common system requirements and nothing else. There is no
//! coordinator, so joins and removals are confirmed as soon as the callbacks
//! return.

use async_trait::async_trait;
use tokio::sync::OnceCell;

use super::scripts::{self, RequirementsScript};
use super::{ClusterBlueprint, ClusterContext, Flavor, Topology};
use crate::cluster::identity::{ClusterIdentity, Complexity};
use crate::errors::ProvisioningResult;

#[derive(Default)]
pub struct BohBlueprint {
    requirements: OnceCell<String>,
}

impl BohBlueprint {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterBlueprint for BohBlueprint {
    fn flavor(&self) -> Flavor {
        Flavor::Boh
    }

    fn minimum_required_servers(&self, identity: &ClusterIdentity) -> Topology {
        match identity.complexity() {
            Complexity::Small => Topology::new(1, 1, 0),
            Complexity::Normal => Topology::new(3, 3, 0),
            Complexity::Large => Topology::new(3, 7, 0),
        }
    }

    async fn global_system_requirements(
        &self,
        ctx: &ClusterContext,
    ) -> ProvisioningResult<Option<String>> {
        let script = self
            .requirements
            .get_or_try_init(|| async {
                scripts::render(&RequirementsScript::for_cluster(&ctx.identity))
            })
            .await?;
        Ok(Some(script.clone()))
    }
}
