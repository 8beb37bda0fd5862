// Copyright (c) 2025 - Cowboy AI, Inc.
//! Cluster Provisioner
//!
//! Creates a cluster on the simulated provider, reports its topology, then
//! deletes it again unless `CIM_CLUSTER_KEEP` is set. Remote commands go to a
//! dry-run executor that logs them and answers like a healthy node, so the
//! whole pipeline can be exercised without a cloud account.
//!
//! Run with: cargo run --bin provisioner
//!
//! Environment:
//! - `CIM_CLUSTER_NAME` (default `demo`)
//! - `CIM_CLUSTER_FLAVOR`: `boh` or `swarm` (default `boh`)
//! - `CIM_CLUSTER_COMPLEXITY`: `small`, `normal` or `large` (default `small`)
//! - `CIM_CLUSTER_CIDR` (default `192.168.0.0/16`)
//! - `CIM_PROVISIONING_*`: engine settings, see `ProvisioningConfig`

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use cim_provisioning::{
    cluster::KeyPair,
    domain::Cidr,
    stack::{SimulatedCloud, SimulatedStack},
    ClusterController, ClusterIdentity, CommandOutput, Complexity, Flavor, ProvisioningConfig,
    ProvisioningResult, RemoteExecutor, RemoteTimeouts, TenantRegistry,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Logs commands instead of running them
struct DryRunExecutor;

#[async_trait]
impl RemoteExecutor for DryRunExecutor {
    async fn run(
        &self,
        node: &str,
        command: &str,
        _timeouts: RemoteTimeouts,
    ) -> ProvisioningResult<CommandOutput> {
        debug!(%node, %command, "dry run");
        if command.contains("join-token") {
            return Ok(CommandOutput::ok("SWMTKN-dry-run\n"));
        }
        if command.starts_with("docker node ls") {
            // report the queried node as ready
            let queried = command
                .rsplit("name=")
                .next()
                .unwrap_or_default()
                .trim_matches('"');
            return Ok(CommandOutput::ok(format!("{queried}:Ready\n")));
        }
        Ok(CommandOutput::ok(""))
    }

    async fn copy(
        &self,
        node: &str,
        source: &Path,
        destination: &str,
        _timeouts: RemoteTimeouts,
    ) -> ProvisioningResult<CommandOutput> {
        debug!(%node, source = %source.display(), %destination, "dry run copy");
        Ok(CommandOutput::ok(""))
    }
}

/// Cluster requested through the environment
struct ClusterRequest {
    name: String,
    flavor: Flavor,
    complexity: Complexity,
    cidr: Cidr,
    keep: bool,
}

impl ClusterRequest {
    fn from_env() -> Result<Self> {
        let name = std::env::var("CIM_CLUSTER_NAME").unwrap_or_else(|_| "demo".to_string());

        let flavor = match std::env::var("CIM_CLUSTER_FLAVOR").as_deref() {
            Ok("swarm") => Flavor::Swarm,
            Ok("boh") | Err(_) => Flavor::Boh,
            Ok(other) => bail!("unknown flavor '{other}'"),
        };

        let complexity = match std::env::var("CIM_CLUSTER_COMPLEXITY").as_deref() {
            Ok("small") | Err(_) => Complexity::Small,
            Ok("normal") => Complexity::Normal,
            Ok("large") => Complexity::Large,
            Ok(other) => bail!("unknown complexity '{other}'"),
        };

        let cidr = std::env::var("CIM_CLUSTER_CIDR")
            .unwrap_or_else(|_| "192.168.0.0/16".to_string())
            .parse::<Cidr>()
            .context("CIM_CLUSTER_CIDR is not an IPv4 CIDR")?;

        Ok(Self {
            name,
            flavor,
            complexity,
            cidr,
            keep: std::env::var("CIM_CLUSTER_KEEP").is_ok(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("🚀 Starting cluster provisioner");

    let config = ProvisioningConfig::from_env().context("Invalid provisioning configuration")?;
    let request = ClusterRequest::from_env()?;
    info!("📋 Configuration loaded:");
    info!("  - Cluster: {} ({}, {})", request.name, request.flavor, request.complexity);
    info!("  - CIDR: {}", request.cidr);
    info!("  - Max parallel: {}", config.max_parallel);

    let tenants = TenantRegistry::new();
    let stack = SimulatedStack::new(Arc::new(SimulatedCloud::new()), config.clone());
    tenants.register("simulated", Arc::new(stack));
    tenants.set_current("simulated")?;
    let tenant = tenants.current().context("No active tenant")?;

    let identity = ClusterIdentity::new(
        request.name.clone(),
        request.flavor,
        request.complexity,
        request.cidr,
        "changeme",
        KeyPair {
            name: request.name.clone(),
            public_key: "ssh-ed25519 AAAA-dry-run".to_string(),
            private_key: String::new(),
        },
    )?;
    let controller = ClusterController::new(identity, tenant.stack, Arc::new(DryRunExecutor), config)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    controller
        .create(&cancel)
        .await
        .context("Failed to create cluster")?;
    info!("✅ Cluster created, state {:?}", controller.state().await?);

    for node in controller.list_nodes().await {
        let ip = node
            .host()
            .map(|h| h.private_ip.to_string())
            .unwrap_or_default();
        info!("  - {} {} {} {}", node.name(), node.role(), node.state(), ip);
    }

    if request.keep {
        info!("📌 Keeping cluster {}", request.name);
        return Ok(());
    }

    controller
        .delete(&cancel)
        .await
        .context("Failed to delete cluster")?;
    info!("🧹 Cluster {} deleted", request.name);
    Ok(())
}
