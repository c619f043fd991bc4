// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable key/value storage behind a narrow adapter trait.
//!
//! The core never talks to a concrete store; everything goes through
//! [`Storage`]. Key spaces are fixed: `device:<id>`,
//! `topology:<tenant>:<site>`, `command:<id>`,
//! `workflow_result:<wf>:<session>`, `workflow_def:<id>`, `intent_config`.
//!
//! [`MemoryStorage`] is the in-process implementation used by default wiring
//! and tests. Embedded stores plug in from outside the crate.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::error::StorageError;

/// Key under which the intent classifier config snapshot is stored.
pub const INTENT_CONFIG_KEY: &str = "intent_config";

/// Builds the storage key for a device record.
#[must_use]
pub fn device_key(device_id: &str) -> String {
    format!("device:{device_id}")
}

/// Builds the storage key for a site's topology graph.
#[must_use]
pub fn topology_key(tenant: &str, site: &str) -> String {
    format!("topology:{tenant}:{site}")
}

/// Builds the storage key for a command audit row.
#[must_use]
pub fn command_key(command_id: &str) -> String {
    format!("command:{command_id}")
}

/// Builds the storage key for a workflow execution result.
#[must_use]
pub fn workflow_result_key(workflow_id: &str, session_id: &str) -> String {
    format!("workflow_result:{workflow_id}:{session_id}")
}

/// Builds the storage key for a stored workflow definition.
#[must_use]
pub fn workflow_def_key(workflow_id: &str) -> String {
    format!("workflow_def:{workflow_id}")
}

/// Narrow storage interface the core consumes.
///
/// Implementations must be safe for concurrent use. `set_ttl` support is
/// optional at the backend level; [`MemoryStorage`] implements it natively,
/// and backends without native expiry may emulate it or ignore the duration.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reads a value; `Ok(None)` is a miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Writes a value.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Writes a value that expires after `ttl`.
    async fn set_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StorageError>;

    /// Deletes a key; deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Visits every live `(key, value)` pair under `prefix`.
    ///
    /// Iteration order is unspecified.
    async fn iterate<'a>(
        &'a self,
        prefix: &str,
        visit: &'a mut (dyn for<'b, 'c> FnMut(&'b str, &'c [u8]) + Send + 'a),
    ) -> Result<(), StorageError>;
}

/// Entry in the in-memory store.
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// In-memory [`Storage`] implementation with native TTL support.
///
/// Expired entries are dropped lazily on read and swept opportunistically on
/// write, so the map does not grow unboundedly under TTL churn.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live (unexpired) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Whether the store holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all expired entries now.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.write().retain(|_, e| !e.is_expired(now));
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                None => return Ok(None),
                Some(_) => {}
            }
        }
        // The entry exists but has expired; drop it.
        self.entries.write().remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StorageError> {
        let mut entries = self.entries.write();
        let now = Instant::now();
        entries.retain(|_, e| !e.is_expired(now));
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(now + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn iterate<'a>(
        &'a self,
        prefix: &str,
        visit: &'a mut (dyn for<'b, 'c> FnMut(&'b str, &'c [u8]) + Send + 'a),
    ) -> Result<(), StorageError> {
        let now = Instant::now();
        let entries = self.entries.read();
        for (key, entry) in entries.iter() {
            if key.starts_with(prefix) && !entry.is_expired(now) {
                visit(key, &entry.value);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = MemoryStorage::new();
        store.set("device:dev01", b"payload".to_vec()).await.unwrap();
        assert_eq!(
            store.get("device:dev01").await.unwrap(),
            Some(b"payload".to_vec())
        );
        assert_eq!(store.get("device:missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = MemoryStorage::new();
        store.set("k", b"v".to_vec()).await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        // Deleting again is fine.
        store.delete("k").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let store = MemoryStorage::new();
        store
            .set_ttl("k", b"v".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn iterate_filters_by_prefix() {
        let store = MemoryStorage::new();
        store.set("device:a", b"1".to_vec()).await.unwrap();
        store.set("device:b", b"2".to_vec()).await.unwrap();
        store.set("command:x", b"3".to_vec()).await.unwrap();

        let mut seen = Vec::new();
        store
            .iterate("device:", &mut |key, _| seen.push(key.to_string()))
            .await
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["device:a", "device:b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn iterate_skips_expired() {
        let store = MemoryStorage::new();
        store.set("p:live", b"1".to_vec()).await.unwrap();
        store
            .set_ttl("p:dead", b"2".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let mut seen = Vec::new();
        store
            .iterate("p:", &mut |key, _| seen.push(key.to_string()))
            .await
            .unwrap();
        assert_eq!(seen, vec!["p:live"]);
    }

    #[test]
    fn key_builders() {
        assert_eq!(device_key("dev01"), "device:dev01");
        assert_eq!(topology_key("demo", "home"), "topology:demo:home");
        assert_eq!(command_key("abc"), "command:abc");
        assert_eq!(
            workflow_result_key("wan_diag", "s-1"),
            "workflow_result:wan_diag:s-1"
        );
        assert_eq!(workflow_def_key("wan_diag"), "workflow_def:wan_diag");
    }
}
