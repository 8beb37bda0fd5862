// Copyright (c) 2025 - Cowboy AI, Inc.
//! Provisioning configuration
//!
//! All tunables of the engine live in [`ProvisioningConfig`]. Values can be
//! deserialized (every field has a default) or read from `CIM_PROVISIONING_*`
//! environment variables with [`ProvisioningConfig::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ProvisioningError, ProvisioningResult};

/// Bounds of a single convergence poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration, timeout: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            timeout,
        }
    }

    /// Same delays, different overall budget
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(default_poll_min_delay_ms()),
            Duration::from_millis(default_poll_max_delay_ms()),
            Duration::from_secs(default_poll_timeout_secs()),
        )
    }
}

/// Configuration for the provisioning engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Smallest delay between two poll attempts
    #[serde(default = "default_poll_min_delay_ms")]
    pub poll_min_delay_ms: u64,

    /// Largest delay between two poll attempts
    #[serde(default = "default_poll_max_delay_ms")]
    pub poll_max_delay_ms: u64,

    /// Budget of a resource readiness poll
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Budget for a host to reach Started
    #[serde(default = "default_host_ready_timeout_secs")]
    pub host_ready_timeout_secs: u64,

    /// Budget for the coordinator to confirm a join or a removal
    #[serde(default = "default_member_timeout_secs")]
    pub member_timeout_secs: u64,

    /// Remote connection timeout
    #[serde(default = "default_ssh_connect_timeout_secs")]
    pub ssh_connect_timeout_secs: u64,

    /// Remote command execution timeout
    #[serde(default = "default_ssh_exec_timeout_secs")]
    pub ssh_exec_timeout_secs: u64,

    /// Hosts provisioned concurrently
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Budget of a whole create or scale-out pipeline
    #[serde(default = "default_pipeline_timeout_secs")]
    pub pipeline_timeout_secs: u64,

    /// Split the cluster CIDR into a public and a private subnetwork
    #[serde(default)]
    pub build_subnetworks: bool,

    /// Local directory where scripts are rendered before upload
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Remote directory scripts are copied to
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    /// Command run on a master to decide whether it can coordinate
    #[serde(default = "default_liveness_command")]
    pub liveness_command: String,
}

fn default_poll_min_delay_ms() -> u64 {
    500
}

fn default_poll_max_delay_ms() -> u64 {
    5_000
}

fn default_poll_timeout_secs() -> u64 {
    120
}

fn default_host_ready_timeout_secs() -> u64 {
    300
}

fn default_member_timeout_secs() -> u64 {
    300
}

fn default_ssh_connect_timeout_secs() -> u64 {
    60
}

fn default_ssh_exec_timeout_secs() -> u64 {
    300
}

fn default_max_parallel() -> usize {
    4
}

fn default_pipeline_timeout_secs() -> u64 {
    1_800
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("cim-provisioning")
}

fn default_remote_dir() -> String {
    "/var/tmp".to_string()
}

fn default_liveness_command() -> String {
    "true".to_string()
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            poll_min_delay_ms: default_poll_min_delay_ms(),
            poll_max_delay_ms: default_poll_max_delay_ms(),
            poll_timeout_secs: default_poll_timeout_secs(),
            host_ready_timeout_secs: default_host_ready_timeout_secs(),
            member_timeout_secs: default_member_timeout_secs(),
            ssh_connect_timeout_secs: default_ssh_connect_timeout_secs(),
            ssh_exec_timeout_secs: default_ssh_exec_timeout_secs(),
            max_parallel: default_max_parallel(),
            pipeline_timeout_secs: default_pipeline_timeout_secs(),
            build_subnetworks: false,
            staging_dir: default_staging_dir(),
            remote_dir: default_remote_dir(),
            liveness_command: default_liveness_command(),
        }
    }
}

impl ProvisioningConfig {
    /// Load configuration from environment variables
    ///
    /// Unset variables keep their default; set but unparsable variables are a
    /// [`ProvisioningError::Configuration`] error.
    pub fn from_env() -> ProvisioningResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> ProvisioningResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            poll_min_delay_ms: parse_var(&lookup, "POLL_MIN_DELAY_MS", defaults.poll_min_delay_ms)?,
            poll_max_delay_ms: parse_var(&lookup, "POLL_MAX_DELAY_MS", defaults.poll_max_delay_ms)?,
            poll_timeout_secs: parse_var(&lookup, "POLL_TIMEOUT_SECS", defaults.poll_timeout_secs)?,
            host_ready_timeout_secs: parse_var(
                &lookup,
                "HOST_READY_TIMEOUT_SECS",
                defaults.host_ready_timeout_secs,
            )?,
            member_timeout_secs: parse_var(
                &lookup,
                "MEMBER_TIMEOUT_SECS",
                defaults.member_timeout_secs,
            )?,
            ssh_connect_timeout_secs: parse_var(
                &lookup,
                "SSH_CONNECT_TIMEOUT_SECS",
                defaults.ssh_connect_timeout_secs,
            )?,
            ssh_exec_timeout_secs: parse_var(
                &lookup,
                "SSH_EXEC_TIMEOUT_SECS",
                defaults.ssh_exec_timeout_secs,
            )?,
            max_parallel: parse_var(&lookup, "MAX_PARALLEL", defaults.max_parallel)?,
            pipeline_timeout_secs: parse_var(
                &lookup,
                "PIPELINE_TIMEOUT_SECS",
                defaults.pipeline_timeout_secs,
            )?,
            build_subnetworks: parse_var(
                &lookup,
                "BUILD_SUBNETWORKS",
                defaults.build_subnetworks,
            )?,
            staging_dir: lookup(&env_key("STAGING_DIR"))
                .map(PathBuf::from)
                .unwrap_or(defaults.staging_dir),
            remote_dir: lookup(&env_key("REMOTE_DIR")).unwrap_or(defaults.remote_dir),
            liveness_command: lookup(&env_key("LIVENESS_COMMAND"))
                .unwrap_or(defaults.liveness_command),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> ProvisioningResult<()> {
        if self.max_parallel == 0 {
            return Err(ProvisioningError::Configuration(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        if self.poll_min_delay_ms == 0 {
            return Err(ProvisioningError::Configuration(
                "poll_min_delay_ms must be positive".to_string(),
            ));
        }
        if self.poll_max_delay_ms < self.poll_min_delay_ms {
            return Err(ProvisioningError::Configuration(format!(
                "poll_max_delay_ms ({}) is smaller than poll_min_delay_ms ({})",
                self.poll_max_delay_ms, self.poll_min_delay_ms
            )));
        }
        Ok(())
    }

    fn policy(&self, timeout_secs: u64) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.poll_min_delay_ms),
            Duration::from_millis(self.poll_max_delay_ms),
            Duration::from_secs(timeout_secs),
        )
    }

    /// Policy for resource readiness (network, subnet, volume, address)
    pub fn resource_poll(&self) -> PollPolicy {
        self.policy(self.poll_timeout_secs)
    }

    /// Policy for a host reaching Started
    pub fn host_ready_poll(&self) -> PollPolicy {
        self.policy(self.host_ready_timeout_secs)
    }

    /// Policy for membership confirmation against the coordinator
    pub fn membership_poll(&self) -> PollPolicy {
        self.policy(self.member_timeout_secs)
    }

    /// Policy for retrying remote commands after transport failures
    pub fn remote_retry_poll(&self) -> PollPolicy {
        self.policy(self.ssh_exec_timeout_secs)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }

    pub fn ssh_exec_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_exec_timeout_secs)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline_timeout_secs)
    }
}

fn env_key(name: &str) -> String {
    format!("CIM_PROVISIONING_{name}")
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> ProvisioningResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let key = env_key(name);
    match lookup(&key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| {
            ProvisioningError::Configuration(format!("{key}='{raw}' is invalid: {e}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = ProvisioningConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ProvisioningConfig::default());
        assert_eq!(config.ssh_connect_timeout(), Duration::from_secs(60));
        assert_eq!(config.ssh_exec_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_variables_override_defaults() {
        let config = ProvisioningConfig::from_lookup(lookup_from(&[
            ("CIM_PROVISIONING_MAX_PARALLEL", "8"),
            ("CIM_PROVISIONING_BUILD_SUBNETWORKS", "true"),
            ("CIM_PROVISIONING_LIVENESS_COMMAND", "docker info"),
        ]))
        .unwrap();

        assert_eq!(config.max_parallel, 8);
        assert!(config.build_subnetworks);
        assert_eq!(config.liveness_command, "docker info");
    }

    #[test]
    fn test_invalid_variable_is_configuration_error() {
        let err = ProvisioningConfig::from_lookup(lookup_from(&[(
            "CIM_PROVISIONING_POLL_TIMEOUT_SECS",
            "soon",
        )]))
        .unwrap_err();

        assert!(matches!(err, ProvisioningError::Configuration(_)));
        assert!(err.to_string().contains("CIM_PROVISIONING_POLL_TIMEOUT_SECS"));
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let err = ProvisioningConfig::from_lookup(lookup_from(&[(
            "CIM_PROVISIONING_MAX_PARALLEL",
            "0",
        )]))
        .unwrap_err();
        assert!(matches!(err, ProvisioningError::Configuration(_)));
    }

    #[test]
    fn test_deserialize_partial_document() {
        let config: ProvisioningConfig =
            serde_json::from_str(r#"{"max_parallel": 2, "member_timeout_secs": 10}"#).unwrap();
        assert_eq!(config.max_parallel, 2);
        assert_eq!(config.membership_poll().timeout, Duration::from_secs(10));
        assert_eq!(config.poll_min_delay_ms, 500);
    }
}
