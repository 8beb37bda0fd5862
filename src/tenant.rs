// Copyright (c) 2025 - Cowboy AI, Inc.
//! Tenants
//!
//! A tenant is one set of provider credentials, materialised as a single
//! [`StackAdapter`]. Every cluster operation starts by asking the registry
//! for the active tenant, so a missing tenant fails before anything touches
//! a provider.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::info;

use crate::errors::{ProvisioningError, ProvisioningResult, ResourceKind};
use crate::stack::StackAdapter;

/// The active tenant and its adapter
#[derive(Clone)]
pub struct Tenant {
    pub name: String,
    pub stack: Arc<dyn StackAdapter>,
}

#[derive(Default)]
struct Tenants {
    known: BTreeMap<String, Arc<dyn StackAdapter>>,
    current: Option<String>,
}

/// Known tenants and the one currently selected
#[derive(Default)]
pub struct TenantRegistry {
    tenants: RwLock<Tenants>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tenants> {
        self.tenants.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tenants> {
        self.tenants.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register (or replace) the adapter of `name`
    pub fn register(&self, name: impl Into<String>, stack: Arc<dyn StackAdapter>) {
        let name = name.into();
        info!(tenant = %name, provider = %stack.provider(), "tenant registered");
        self.write().known.insert(name, stack);
    }

    /// Select the active tenant
    pub fn set_current(&self, name: &str) -> ProvisioningResult<()> {
        let mut tenants = self.write();
        if !tenants.known.contains_key(name) {
            return Err(ProvisioningError::not_found(ResourceKind::Tenant, name));
        }
        tenants.current = Some(name.to_string());
        Ok(())
    }

    /// The active tenant
    ///
    /// # Errors
    ///
    /// `Precondition` when no tenant is selected.
    pub fn current(&self) -> ProvisioningResult<Tenant> {
        let tenants = self.read();
        let name = tenants
            .current
            .as_ref()
            .ok_or_else(|| ProvisioningError::Precondition("no tenant set".to_string()))?;
        let stack = tenants
            .known
            .get(name)
            .cloned()
            .ok_or_else(|| ProvisioningError::not_found(ResourceKind::Tenant, name.as_str()))?;
        Ok(Tenant {
            name: name.clone(),
            stack,
        })
    }

    /// Registered tenant names, sorted
    pub fn list(&self) -> Vec<String> {
        self.read().known.keys().cloned().collect()
    }
}
