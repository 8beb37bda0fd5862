// Copyright (c) 2025 - Cowboy AI, Inc.
//! Cluster orchestration
//!
//! [`ClusterController`] turns a [`ClusterIdentity`] and its flavor's
//! blueprint into provisioned, joined nodes, and keeps one [`NodeRecord`]
//! per node.

pub mod controller;
pub mod identity;
pub mod node;

pub use controller::{ClusterController, ClusterDefaults, DEFAULTS_SECTION};
pub use identity::{ClusterIdentity, ClusterState, Complexity, KeyPair, NodeRole};
pub use node::{NodeRecord, NodeView};
