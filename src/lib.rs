// Copyright (c) 2025 - Cowboy AI, Inc.
//! Convergent cluster provisioning for the Composable Information Machine
//!
//! This crate provisions and operates multi-node clusters on top of cloud
//! providers hidden behind the [`stack::StackAdapter`] contract. Composite
//! resources are built by [`saga::ResourceSaga`]s that roll back on failure,
//! readiness is awaited with [`convergence::poll_until`], and the
//! [`cluster::ClusterController`] drives a flavor's
//! [`blueprint::ClusterBlueprint`] while tracking every node through the
//! membership state machine.

pub mod blueprint;
pub mod cluster;
pub mod config;
pub mod convergence;
pub mod domain;
pub mod errors;
pub mod features;
pub mod properties;
pub mod remote;
pub mod saga;
pub mod stack;
pub mod state_machine;
pub mod tenant;

// Re-export commonly used types
pub use blueprint::{ClusterBlueprint, Flavor, NodePresence, Topology};
pub use cluster::{ClusterController, ClusterIdentity, ClusterState, Complexity, NodeRole};
pub use config::{PollPolicy, ProvisioningConfig};
pub use errors::{ProvisioningError, ProvisioningResult};
pub use remote::{CommandOutput, RemoteExecutor, RemoteSession, RemoteTimeouts};
pub use stack::StackAdapter;
pub use tenant::TenantRegistry;
