// Copyright (c) 2025 - Cowboy AI, Inc.
//! Feature installation boundary
//!
//! Blueprints ask for software (a container runtime, for instance) to be
//! present on hosts without knowing how it gets there. A [`FeatureInstaller`]
//! checks, adds and removes named features and reports one [`StepOutcome`]
//! per step and host.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{ProvisioningError, ProvisioningResult};
use crate::remote::{RemoteSession, ShellWord};

/// Where a feature is installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallTarget {
    /// One host, by hostname
    Host { name: String },
    /// Every listed host of a cluster
    Cluster { name: String, hosts: Vec<String> },
}

impl InstallTarget {
    pub fn host(name: impl Into<String>) -> Self {
        InstallTarget::Host { name: name.into() }
    }

    pub fn hosts(&self) -> Vec<&str> {
        match self {
            InstallTarget::Host { name } => vec![name.as_str()],
            InstallTarget::Cluster { hosts, .. } => hosts.iter().map(String::as_str).collect(),
        }
    }
}

/// Installer switches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSettings {
    /// Skip the preliminary check when adding
    #[serde(default)]
    pub skip_check: bool,
    /// Keep going on other hosts after a failure
    #[serde(default)]
    pub continue_on_error: bool,
}

/// Outcome of one step on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: String,
    pub host: String,
    pub success: bool,
    pub output: String,
}

/// Per-step outcomes of an installer action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallResults {
    pub steps: Vec<StepOutcome>,
}

impl InstallResults {
    pub fn push(&mut self, outcome: StepOutcome) {
        self.steps.push(outcome);
    }

    /// True when every recorded step succeeded
    pub fn successful(&self) -> bool {
        self.steps.iter().all(|s| s.success)
    }

    /// One message per failed step, `step@host: output`
    pub fn error_messages(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| !s.success)
            .map(|s| format!("{}@{}: {}", s.step, s.host, s.output.trim()))
            .collect()
    }
}

/// Checks, adds and removes features on hosts
#[async_trait]
pub trait FeatureInstaller: Send + Sync {
    async fn check(
        &self,
        feature: &str,
        target: &InstallTarget,
        variables: &HashMap<String, String>,
        settings: &InstallSettings,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<InstallResults>;

    async fn add(
        &self,
        feature: &str,
        target: &InstallTarget,
        variables: &HashMap<String, String>,
        settings: &InstallSettings,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<InstallResults>;

    async fn remove(
        &self,
        feature: &str,
        target: &InstallTarget,
        variables: &HashMap<String, String>,
        settings: &InstallSettings,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<InstallResults>;
}

/// Shell commands implementing one feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureCommands {
    pub check: String,
    pub add: String,
    pub remove: String,
}

/// Installer driving features through plain shell commands
///
/// The call's variables are exported, quoted, ahead of the command, which
/// reads them as ordinary shell variables (`"$cidr"`).
pub struct CommandFeatureInstaller {
    session: RemoteSession,
    features: BTreeMap<String, FeatureCommands>,
}

impl CommandFeatureInstaller {
    /// Installer knowing the `docker` feature
    pub fn new(session: RemoteSession) -> Self {
        let mut features = BTreeMap::new();
        features.insert(
            "docker".to_string(),
            FeatureCommands {
                check: "docker info >/dev/null 2>&1".to_string(),
                add: "curl -fsSL https://get.docker.com | sudo sh && sudo systemctl enable --now docker"
                    .to_string(),
                remove: "sudo apt-get purge -y docker-ce docker-ce-cli containerd.io".to_string(),
            },
        );
        Self { session, features }
    }

    pub fn with_feature(mut self, name: impl Into<String>, commands: FeatureCommands) -> Self {
        self.features.insert(name.into(), commands);
        self
    }

    fn commands(&self, feature: &str) -> ProvisioningResult<&FeatureCommands> {
        self.features
            .get(feature)
            .ok_or_else(|| ProvisioningError::unsupported(format!("feature '{feature}'")))
    }

    async fn run_step(
        &self,
        step: &str,
        command: &str,
        target: &InstallTarget,
        variables: &HashMap<String, String>,
        settings: &InstallSettings,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<InstallResults> {
        let command = with_variables(command, variables)?;
        let mut results = InstallResults::default();
        for host in target.hosts() {
            let output = self.session.run_with_retry(host, &command, cancel).await?;
            let success = output.success();
            debug!(%host, step, success, "feature step");
            results.push(StepOutcome {
                step: step.to_string(),
                host: host.to_string(),
                success,
                output: if success { output.stdout } else { output.stderr },
            });
            if !success && !settings.continue_on_error {
                break;
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl FeatureInstaller for CommandFeatureInstaller {
    async fn check(
        &self,
        feature: &str,
        target: &InstallTarget,
        variables: &HashMap<String, String>,
        settings: &InstallSettings,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<InstallResults> {
        let commands = self.commands(feature)?;
        self.run_step("check", &commands.check, target, variables, settings, cancel)
            .await
    }

    async fn add(
        &self,
        feature: &str,
        target: &InstallTarget,
        variables: &HashMap<String, String>,
        settings: &InstallSettings,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<InstallResults> {
        let commands = self.commands(feature)?;
        if !settings.skip_check {
            let present = self
                .run_step("check", &commands.check, target, variables, settings, cancel)
                .await?;
            if present.successful() {
                info!(feature, "feature already present");
                return Ok(present);
            }
        }
        info!(feature, "adding feature");
        self.run_step("add", &commands.add, target, variables, settings, cancel)
            .await
    }

    async fn remove(
        &self,
        feature: &str,
        target: &InstallTarget,
        variables: &HashMap<String, String>,
        settings: &InstallSettings,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<InstallResults> {
        let commands = self.commands(feature)?;
        info!(feature, "removing feature");
        self.run_step("remove", &commands.remove, target, variables, settings, cancel)
            .await
    }
}

/// Prefix `command` with one quoted `export` per variable, in name order
fn with_variables(command: &str, variables: &HashMap<String, String>) -> ProvisioningResult<String> {
    let ordered: BTreeMap<&String, &String> = variables.iter().collect();
    let mut prefix = String::new();
    for (name, value) in ordered {
        let valid = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(ProvisioningError::Precondition(format!(
                "'{name}' is not a shell variable name"
            )));
        }
        prefix.push_str(&format!("export {name}={}; ", ShellWord::new(value.as_str())));
    }
    Ok(format!("{prefix}{command}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisioningConfig;
    use crate::remote::{CommandOutput, RemoteExecutor, RemoteTimeouts};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    /// Answers `check` commands with a fixed exit code
    struct Scripted {
        check_exit: i32,
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteExecutor for Scripted {
        async fn run(
            &self,
            _node: &str,
            command: &str,
            _timeouts: RemoteTimeouts,
        ) -> ProvisioningResult<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            if command.starts_with("docker info") {
                Ok(CommandOutput {
                    exit_code: self.check_exit,
                    stdout: String::new(),
                    stderr: "not installed".to_string(),
                })
            } else {
                Ok(CommandOutput::ok("ok"))
            }
        }

        async fn copy(
            &self,
            _node: &str,
            _source: &Path,
            _destination: &str,
            _timeouts: RemoteTimeouts,
        ) -> ProvisioningResult<CommandOutput> {
            Ok(CommandOutput::ok(""))
        }
    }

    fn installer(check_exit: i32) -> (CommandFeatureInstaller, Arc<Scripted>) {
        let executor = Arc::new(Scripted {
            check_exit,
            commands: Mutex::new(Vec::new()),
        });
        let session = RemoteSession::new(executor.clone(), &ProvisioningConfig::default());
        (CommandFeatureInstaller::new(session), executor)
    }

    #[tokio::test]
    async fn test_add_skips_when_present() {
        let (installer, executor) = installer(0);
        let results = installer
            .add(
                "docker",
                &InstallTarget::host("node-1"),
                &HashMap::new(),
                &InstallSettings::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(results.successful());
        assert_eq!(executor.commands.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_installs_when_missing() {
        let (installer, executor) = installer(1);
        let results = installer
            .add(
                "docker",
                &InstallTarget::host("node-1"),
                &HashMap::new(),
                &InstallSettings::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(results.successful());
        assert_eq!(results.steps[0].step, "add");
        assert_eq!(executor.commands.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_check_reports_errors_per_host() {
        let (installer, _) = installer(1);
        let target = InstallTarget::Cluster {
            name: "alpha".to_string(),
            hosts: vec!["alpha-node-1".to_string(), "alpha-node-2".to_string()],
        };
        let settings = InstallSettings {
            continue_on_error: true,
            ..InstallSettings::default()
        };

        let results = installer
            .check("docker", &target, &HashMap::new(), &settings, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!results.successful());
        assert_eq!(
            results.error_messages(),
            vec![
                "check@alpha-node-1: not installed".to_string(),
                "check@alpha-node-2: not installed".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_feature_is_unsupported() {
        let (installer, _) = installer(0);
        let err = installer
            .check(
                "kubernetes",
                &InstallTarget::host("node-1"),
                &HashMap::new(),
                &InstallSettings::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_install_runs_nothing() {
        let (installer, executor) = installer(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = installer
            .add(
                "docker",
                &InstallTarget::host("node-1"),
                &HashMap::new(),
                &InstallSettings::default(),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisioningError::Cancelled { .. }));
        assert!(executor.commands.lock().unwrap().is_empty());
    }

    #[test]
    fn test_variables_are_exported_quoted_in_order() {
        let mut vars = HashMap::new();
        vars.insert("cidr".to_string(), "10.0.0.0/16".to_string());
        vars.insert("admin".to_string(), "x'; reboot; '{{cidr}}".to_string());

        let command = with_variables("ufw allow from \"$cidr\"", &vars).unwrap();
        assert_eq!(
            command,
            "export admin='x'\\''; reboot; '\\''{{cidr}}'; export cidr='10.0.0.0/16'; ufw allow from \"$cidr\""
        );
    }

    #[test]
    fn test_invalid_variable_name_is_rejected() {
        let mut vars = HashMap::new();
        vars.insert("a;b".to_string(), "1".to_string());
        let err = with_variables("true", &vars).unwrap_err();
        assert!(matches!(err, ProvisioningError::Precondition(_)));
    }
}
