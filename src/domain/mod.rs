// Copyright (c) 2025 - Cowboy AI, Inc.
//! Provisioning Domain Value Objects
//!
//! Validated values shared by the stack model and the cluster controller.
//!
//! - [`Hostname`] - single-label node names (RFC 1123)
//! - [`Cidr`] - IPv4 networks, with the subnet split used for public/private
//!   subnetworks

pub mod hostname;
pub mod network;

pub use hostname::{Hostname, HostnameError};
pub use network::{Cidr, NetworkError};
