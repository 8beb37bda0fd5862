// Copyright (c) 2025 - Cowboy AI, Inc.
//! Single-writer registry for composite-resource builds
//!
//! Two concurrent sagas building the same resource would race on the
//! provider. A [`SagaLease`] is held for the duration of a build; asking for a
//! second lease on the same name fails with a precondition error.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::errors::{ProvisioningError, ProvisioningResult};

/// Tracks which composite resources are currently being built
#[derive(Debug, Clone, Default)]
pub struct SagaRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SagaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive right to build or delete `resource`
    pub fn acquire(&self, resource: &str) -> ProvisioningResult<SagaLease> {
        let mut active = lock(&self.active);
        if !active.insert(resource.to_string()) {
            return Err(ProvisioningError::Precondition(format!(
                "'{resource}' is already being built or deleted"
            )));
        }
        debug!(saga = resource, "lease acquired");
        Ok(SagaLease {
            resource: resource.to_string(),
            active: self.active.clone(),
        })
    }

    /// Whether a lease on `resource` is currently held
    pub fn is_active(&self, resource: &str) -> bool {
        lock(&self.active).contains(resource)
    }
}

/// Exclusive hold on a resource name, released on drop
#[derive(Debug)]
pub struct SagaLease {
    resource: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl SagaLease {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for SagaLease {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.resource);
        debug!(saga = %self.resource, "lease released");
    }
}

fn lock(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    // a panic while holding the lock cannot leave the set half-updated
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
