// Copyright (c) 2025 - Cowboy AI, Inc.
//! Test Fixtures for cim-provisioning
//!
//! Provides a simulated provider, a deterministic cluster identity and a
//! scripted remote executor that behaves like a small Docker Swarm.
//!
//! # Design Principles
//! - Fixtures are the only place that builds identities and configs
//! - Poll delays are short; time-dependent tests run with paused time
//! - The executor records every command so tests assert on what was run

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use cim_provisioning::cluster::KeyPair;
use cim_provisioning::stack::{SimulatedCloud, SimulatedStack};
use cim_provisioning::{
    ClusterController, ClusterIdentity, CommandOutput, Complexity, Flavor, ProvisioningConfig,
    ProvisioningError, ProvisioningResult, RemoteExecutor, RemoteTimeouts,
};

pub const CLUSTER_NAME: &str = "alpha";
pub const CLUSTER_CIDR: &str = "10.20.0.0/16";

/// Config with short poll delays and a private staging directory
pub fn fast_config() -> ProvisioningConfig {
    ProvisioningConfig {
        poll_min_delay_ms: 100,
        poll_max_delay_ms: 1_000,
        poll_timeout_secs: 60,
        host_ready_timeout_secs: 60,
        member_timeout_secs: 60,
        staging_dir: std::env::temp_dir().join(format!("cim-provisioning-test-{}", Uuid::now_v7())),
        ..ProvisioningConfig::default()
    }
}

pub fn identity(flavor: Flavor, complexity: Complexity) -> ClusterIdentity {
    ClusterIdentity::new(
        CLUSTER_NAME,
        flavor,
        complexity,
        CLUSTER_CIDR.parse().expect("Invalid CIDR in test fixture"),
        "s3cret",
        KeyPair {
            name: CLUSTER_NAME.to_string(),
            public_key: "ssh-ed25519 AAAAC3NzaTest".to_string(),
            private_key: "test-private-key".to_string(),
        },
    )
    .expect("Invalid identity in test fixture")
}

/// Simulated provider API and the adapter over it
pub fn simulated(config: &ProvisioningConfig) -> (Arc<SimulatedCloud>, Arc<SimulatedStack>) {
    let cloud = Arc::new(SimulatedCloud::new());
    let stack = Arc::new(SimulatedStack::new(cloud.clone(), config.clone()));
    (cloud, stack)
}

/// Controller over a fresh simulated provider and scripted executor
pub struct Harness {
    pub cloud: Arc<SimulatedCloud>,
    pub stack: Arc<SimulatedStack>,
    pub executor: Arc<ScriptedExecutor>,
    pub controller: ClusterController,
}

pub fn harness(flavor: Flavor, complexity: Complexity) -> Harness {
    harness_with(flavor, complexity, fast_config())
}

pub fn harness_with(flavor: Flavor, complexity: Complexity, config: ProvisioningConfig) -> Harness {
    let (cloud, stack) = simulated(&config);
    let executor = Arc::new(ScriptedExecutor::watching(cloud.clone()));
    let controller = ClusterController::new(
        identity(flavor, complexity),
        stack.clone(),
        executor.clone(),
        config,
    )
    .expect("Invalid controller in test fixture");
    Harness {
        cloud,
        stack,
        executor,
        controller,
    }
}

/// Hosts requested for cluster nodes, gateway excluded
pub fn node_run_instances(cloud: &SimulatedCloud) -> usize {
    cloud
        .calls()
        .iter()
        .filter(|c| c.starts_with(&format!("run_instances:{CLUSTER_NAME}-")))
        .count()
}

// ============================================================================
// Scripted executor
// ============================================================================

#[derive(Default)]
struct ExecutorState {
    runs: Vec<(String, String)>,
    copies: Vec<(String, String)>,
    transient: Vec<(String, usize)>,
    failing: Vec<(String, i32, String)>,
    swarm: BTreeMap<String, String>,
    never_ready: Vec<String>,
    kept_listed: Vec<String>,
    hosts_at_configure: Option<usize>,
}

/// Remote executor answering like hosts of a Docker Swarm
///
/// Joined nodes are `Ready`, nodes that left are `Down` until removed.
pub struct ScriptedExecutor {
    state: Mutex<ExecutorState>,
    cloud: Option<Arc<SimulatedCloud>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ExecutorState::default()),
            cloud: None,
        }
    }

    /// Also record how many node hosts existed when the swarm was initialised
    pub fn watching(cloud: Arc<SimulatedCloud>) -> Self {
        Self {
            state: Mutex::new(ExecutorState::default()),
            cloud: Some(cloud),
        }
    }

    /// Commands containing `pattern` fail with a transport error `times` times
    pub fn transient(&self, pattern: &str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .transient
            .push((pattern.to_string(), times));
    }

    /// Commands containing `pattern` exit with `exit_code`
    pub fn fail(&self, pattern: &str, exit_code: i32, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .failing
            .push((pattern.to_string(), exit_code, stderr.to_string()));
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing.clear();
        state.transient.clear();
    }

    /// Number of run attempts whose command contains `pattern`
    pub fn runs_matching(&self, pattern: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .runs
            .iter()
            .filter(|(_, command)| command.contains(pattern))
            .count()
    }

    /// Commands run on `node`, in order
    pub fn commands_on(&self, node: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .runs
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn copies(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().copies.clone()
    }

    pub fn swarm_status(&self, node: &str) -> Option<String> {
        self.state.lock().unwrap().swarm.get(node).cloned()
    }

    /// Mark a swarm node, e.g. `Down`
    pub fn set_swarm_status(&self, node: &str, status: &str) {
        self.state
            .lock()
            .unwrap()
            .swarm
            .insert(node.to_string(), status.to_string());
    }

    /// `node` joins the swarm but is always reported `Down`
    pub fn never_ready(&self, node: &str) {
        self.state.lock().unwrap().never_ready.push(node.to_string());
    }

    /// `docker node rm` of `node` succeeds but the swarm keeps listing it `Down`
    pub fn keep_listed(&self, node: &str) {
        self.state.lock().unwrap().kept_listed.push(node.to_string());
    }

    pub fn hosts_at_configure(&self) -> Option<usize> {
        self.state.lock().unwrap().hosts_at_configure
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Value of `name=` in a `docker node ls` filter
fn filtered_name(command: &str) -> &str {
    command
        .rsplit("name=")
        .next()
        .unwrap_or_default()
        .trim_matches('"')
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(
        &self,
        node: &str,
        command: &str,
        _timeouts: RemoteTimeouts,
    ) -> ProvisioningResult<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        state.runs.push((node.to_string(), command.to_string()));

        if let Some(entry) = state
            .transient
            .iter_mut()
            .find(|(pattern, left)| *left > 0 && command.contains(pattern.as_str()))
        {
            entry.1 -= 1;
            return Err(ProvisioningError::recoverable(node, "connection reset by peer"));
        }
        if let Some((_, code, stderr)) = state
            .failing
            .iter()
            .find(|(pattern, _, _)| command.contains(pattern.as_str()))
        {
            return Ok(CommandOutput::failed(*code, stderr.clone()));
        }

        if command.starts_with("docker swarm init") {
            state.swarm.insert(node.to_string(), "Ready".to_string());
            state.hosts_at_configure = self.cloud.as_deref().map(node_run_instances);
            return Ok(CommandOutput::ok("Swarm initialized"));
        }
        if command.contains("join-token manager") {
            return Ok(CommandOutput::ok("SWMTKN-manager\n"));
        }
        if command.contains("join-token worker") {
            return Ok(CommandOutput::ok("SWMTKN-worker\n"));
        }
        if command.starts_with("docker swarm join") {
            let status = if state.never_ready.iter().any(|n| n == node) {
                "Down"
            } else {
                "Ready"
            };
            state.swarm.insert(node.to_string(), status.to_string());
            return Ok(CommandOutput::ok("This node joined a swarm"));
        }
        if command.starts_with("docker swarm leave") {
            return match state.swarm.get_mut(node) {
                Some(status) => {
                    *status = "Down".to_string();
                    Ok(CommandOutput::ok("Node left the swarm."))
                }
                None => Ok(CommandOutput::failed(1, "This node is not part of a swarm")),
            };
        }
        if let Some(target) = command.strip_prefix("docker node rm ") {
            let target = target.trim().to_string();
            if state.kept_listed.contains(&target) {
                state.swarm.insert(target.clone(), "Down".to_string());
            } else {
                state.swarm.remove(&target);
            }
            return Ok(CommandOutput::ok(target));
        }
        if command.starts_with("docker node ls") {
            let prefix = filtered_name(command);
            let listing: String = state
                .swarm
                .iter()
                .filter(|(host, _)| host.starts_with(prefix))
                .map(|(host, status)| format!("{host}:{status}\n"))
                .collect();
            return Ok(CommandOutput::ok(listing));
        }
        Ok(CommandOutput::ok(""))
    }

    async fn copy(
        &self,
        node: &str,
        _source: &Path,
        destination: &str,
        _timeouts: RemoteTimeouts,
    ) -> ProvisioningResult<CommandOutput> {
        self.state
            .lock()
            .unwrap()
            .copies
            .push((node.to_string(), destination.to_string()));
        Ok(CommandOutput::ok(""))
    }
}
