// Copyright (c) 2025 - Cowboy AI, Inc.
//! Cluster property bag
//!
//! Shared cluster metadata (sizing defaults, flavor state, node counters) is
//! kept as named JSON sections. Each section has its own
//! [`tokio::sync::RwLock`], so concurrent pipelines contend only when they touch
//! the same section.
//!
//! ```rust
//! # use cim_provisioning::properties::PropertyBag;
//! # use std::collections::BTreeMap;
//! # tokio_test::block_on(async {
//! let bag = PropertyBag::new();
//! bag.lock_for_write("counters")
//!     .await
//!     .then_use(|counters: &mut BTreeMap<String, u32>| {
//!         *counters.entry("masters".into()).or_default() += 1;
//!         Ok(())
//!     })
//!     .unwrap();
//! let masters = bag
//!     .inspect("counters", |c: &BTreeMap<String, u32>| c.get("masters").copied())
//!     .await
//!     .unwrap();
//! assert_eq!(masters, Some(1));
//! # });
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::errors::ProvisioningResult;

/// Named, independently locked JSON sections
#[derive(Debug, Default)]
pub struct PropertyBag {
    sections: Mutex<HashMap<String, Arc<RwLock<Value>>>>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    fn section(&self, key: &str) -> Arc<RwLock<Value>> {
        let mut sections = self
            .sections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sections
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Value::Null)))
            .clone()
    }

    /// Take the write lock of `key`
    ///
    /// The lock is held by the returned handle until
    /// [`PropertyWriteHandle::then_use`] returns or the handle is dropped.
    pub async fn lock_for_write(&self, key: &str) -> PropertyWriteHandle {
        let guard = self.section(key).write_owned().await;
        PropertyWriteHandle {
            key: key.to_string(),
            guard,
        }
    }

    /// Read `key` as `T` under the read lock. Absent sections read as `T::default()`.
    pub async fn inspect<T, R, F>(&self, key: &str, reader: F) -> ProvisioningResult<R>
    where
        T: DeserializeOwned + Default,
        F: FnOnce(&T) -> R,
    {
        let section = self.section(key);
        let guard = section.read().await;
        let value: T = decode(&guard)?;
        Ok(reader(&value))
    }

    /// Drop `key` once its current writer is done, returning the last value
    ///
    /// A later access starts from an empty section.
    pub async fn remove(&self, key: &str) -> Option<Value> {
        let section = self
            .sections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key)?;
        let value = std::mem::take(&mut *section.write().await);
        (!value.is_null()).then_some(value)
    }

    /// Copy of every non-empty section
    pub async fn snapshot(&self) -> BTreeMap<String, Value> {
        let sections: Vec<(String, Arc<RwLock<Value>>)> = {
            let map = self
                .sections
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut out = BTreeMap::new();
        for (key, section) in sections {
            let value = section.read().await.clone();
            if !value.is_null() {
                out.insert(key, value);
            }
        }
        out
    }
}

/// Exclusive access to one section
#[derive(Debug)]
pub struct PropertyWriteHandle {
    key: String,
    guard: OwnedRwLockWriteGuard<Value>,
}

impl PropertyWriteHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Apply a typed mutation and release the lock.
    ///
    /// The section is written back only when the mutator succeeds; on error
    /// the stored value is left as it was.
    pub fn then_use<T, R, F>(mut self, mutator: F) -> ProvisioningResult<R>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> ProvisioningResult<R>,
    {
        let mut value: T = decode(&self.guard)?;
        let out = mutator(&mut value)?;
        *self.guard = serde_json::to_value(&value)?;
        Ok(out)
    }
}

fn decode<T: DeserializeOwned + Default>(value: &Value) -> ProvisioningResult<T> {
    if value.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(value.clone())?)
}
