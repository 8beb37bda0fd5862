// Copyright (c) 2025 - Cowboy AI, Inc.
//! Error types for provisioning operations
//!
//! Every fallible operation in the crate returns [`ProvisioningResult`]. The
//! taxonomy separates failures the convergence poller may retry
//! ([`ProvisioningError::RecoverableRemote`]) from everything else, and keeps
//! the whole cause chain of a failed composite build visible through
//! [`ProvisioningError::Composite`].

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::state_machine::TransitionError;

/// Kind of resource an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    Subnetwork,
    Host,
    Volume,
    VirtualIp,
    Node,
    Master,
    Cluster,
    Tenant,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Network => "network",
            ResourceKind::Subnetwork => "subnetwork",
            ResourceKind::Host => "host",
            ResourceKind::Volume => "volume",
            ResourceKind::VirtualIp => "virtual ip",
            ResourceKind::Node => "node",
            ResourceKind::Master => "master",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Tenant => "tenant",
        };
        f.write_str(name)
    }
}

/// Coarse classification of a [`ProvisioningError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Precondition,
    NotFound,
    Unsupported,
    RecoverableRemote,
    FatalRemote,
    Timeout,
    PartialTimeout,
    Cancelled,
    InvalidTransition,
    Configuration,
    Serialization,
}

/// Errors that can occur while provisioning or operating a cluster
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// Missing tenant or invalid input; never retried
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Resource is absent
    #[error("{kind} '{reference}' not found")]
    NotFound { kind: ResourceKind, reference: String },

    /// Capability not offered by the provider
    #[error("Operation '{operation}' is not supported by this provider")]
    Unsupported { operation: String },

    /// Transient transport or command failure, eligible for retry
    #[error("Transient failure on '{target}': {message}")]
    RecoverableRemote { target: String, message: String },

    /// Remote call went through but the result is terminal
    #[error("Fatal failure on '{target}': {message}")]
    FatalRemote { target: String, message: String },

    /// A convergence poll or a whole pipeline exhausted its budget
    ///
    /// `attempts` counts the checks of a convergence poll. A pipeline that
    /// ran out of time with no member reports 0.
    #[error("Operation '{operation}' timed out after {elapsed:?} ({attempts} attempts)")]
    Timeout {
        operation: String,
        elapsed: Duration,
        attempts: u32,
    },

    /// A pipeline exhausted its budget after some nodes became members
    #[error(
        "Pipeline timed out after {elapsed:?}: members [{}], incomplete [{}]",
        members.join(", "),
        incomplete.join(", ")
    )]
    PartialTimeout {
        elapsed: Duration,
        members: Vec<String>,
        incomplete: Vec<String>,
    },

    /// The cancellation token fired
    #[error("Operation '{operation}' was cancelled")]
    Cancelled { operation: String },

    /// A saga step failed; carries rollback failures as consequences
    #[error("{}", format_composite(resource, step, source, consequences))]
    Composite {
        resource: String,
        step: String,
        source: Box<ProvisioningError>,
        consequences: Vec<ProvisioningError>,
    },

    /// Failure attributed to a specific cluster node
    #[error("Node '{node}': {source}")]
    Node {
        node: String,
        source: Box<ProvisioningError>,
    },

    /// Membership state machine rejected a transition
    #[error("Invalid membership transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn format_composite(
    resource: &str,
    step: &str,
    source: &ProvisioningError,
    consequences: &[ProvisioningError],
) -> String {
    let mut message = format!("Building '{resource}' failed at step '{step}': {source}");
    if !consequences.is_empty() {
        let rollback: Vec<String> = consequences.iter().map(ToString::to_string).collect();
        message.push_str(&format!(
            " (rollback consequences: {})",
            rollback.join("; ")
        ));
    }
    message
}

/// Result type for provisioning operations
pub type ProvisioningResult<T> = Result<T, ProvisioningError>;

impl ProvisioningError {
    /// Shorthand for [`ProvisioningError::NotFound`]
    pub fn not_found(kind: ResourceKind, reference: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            reference: reference.into(),
        }
    }

    /// Shorthand for [`ProvisioningError::RecoverableRemote`]
    pub fn recoverable(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RecoverableRemote {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Shorthand for [`ProvisioningError::FatalRemote`]
    pub fn fatal(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FatalRemote {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Shorthand for [`ProvisioningError::Cancelled`]
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Shorthand for [`ProvisioningError::Unsupported`]
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Attribute this error to a node, keeping the original as source
    pub fn for_node(self, node: impl Into<String>) -> Self {
        Self::Node {
            node: node.into(),
            source: Box::new(self),
        }
    }

    /// Classify the error. Wrappers report the kind of what they wrap.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Precondition(_) => ErrorKind::Precondition,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::RecoverableRemote { .. } => ErrorKind::RecoverableRemote,
            Self::FatalRemote { .. } => ErrorKind::FatalRemote,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::PartialTimeout { .. } => ErrorKind::PartialTimeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Composite { source, .. } | Self::Node { source, .. } => source.kind(),
            Self::InvalidTransition(_) => ErrorKind::InvalidTransition,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Whether the convergence poller may retry after this error
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::RecoverableRemote
    }

    /// Whether this is a NotFound error (possibly wrapped)
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// The innermost error behind Composite and Node wrappers
    pub fn root_cause(&self) -> &ProvisioningError {
        match self {
            Self::Composite { source, .. } | Self::Node { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Rollback failures recorded on a Composite error
    pub fn consequences(&self) -> &[ProvisioningError] {
        match self {
            Self::Composite { consequences, .. } => consequences,
            Self::Node { source, .. } => source.consequences(),
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for ProvisioningError {
    fn from(err: serde_json::Error) -> Self {
        ProvisioningError::Serialization(err.to_string())
    }
}

impl From<askama::Error> for ProvisioningError {
    fn from(err: askama::Error) -> Self {
        ProvisioningError::Serialization(format!("script template: {err}"))
    }
}
