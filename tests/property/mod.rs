// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests Module
//!
//! This module contains property-based tests using proptest to verify the
//! rollback and convergence guarantees of the provisioning engine.

mod poller_bounds;
mod saga_rollback;
