//! Key-value store backend.
//!
//! Entries are keyed `"{cluster_id}-{grain_id}"` and hold the JSON
//! serialization of a [`GrainAddress`]. Registration is set-if-not-exists;
//! unregistration is a transactional delete that only fires when the stored
//! value still equals the caller's serialized address, so a newer
//! registration is never removed by a stale one. Values carry no version, so
//! every entry reports [`VersionTag::NONE`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::DirectoryBackend;
use crate::error::{BackendError, StoreError};
use crate::model::{GrainAddress, VersionTag};

/// Minimal client surface of a key-value store.
#[async_trait]
pub trait KeyValueClient: fmt::Debug + Send + Sync {
    /// Create the keyspace if needed.
    async fn ensure_keyspace(&self) -> Result<(), StoreError>;

    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` only if `key` is absent. Returns `true` if written.
    async fn set_if_not_exists(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Delete `key` only if its value equals `expected`, atomically.
    /// Returns `true` if deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
}

/// Directory backend over a [`KeyValueClient`].
#[derive(Debug, Clone)]
pub struct KeyValueGrainDirectory {
    cluster_id: String,
    client: Arc<dyn KeyValueClient>,
}

impl KeyValueGrainDirectory {
    /// Create a backend storing entries for `cluster_id`.
    pub fn new(cluster_id: impl Into<String>, client: Arc<dyn KeyValueClient>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            client,
        }
    }

    /// Storage key of a grain.
    pub fn key(&self, grain_id: &str) -> String {
        format!("{}-{}", self.cluster_id, grain_id)
    }
}

#[async_trait]
impl DirectoryBackend for KeyValueGrainDirectory {
    async fn initialize(&self) -> Result<(), BackendError> {
        Ok(self.client.ensure_keyspace().await?)
    }

    async fn register(
        &self,
        address: &GrainAddress,
    ) -> Result<(GrainAddress, VersionTag), BackendError> {
        let key = self.key(&address.grain_id);
        let value = serde_json::to_string(address)?;
        if self.client.set_if_not_exists(&key, &value).await? {
            return Ok((address.clone(), VersionTag::NONE));
        }
        match self.client.get(&key).await? {
            Some(stored) => Ok((serde_json::from_str(&stored)?, VersionTag::NONE)),
            // Deleted between the two calls; the caller retries.
            None => Err(StoreError::Unavailable(format!("{key} vanished during registration")).into()),
        }
    }

    async fn unregister(
        &self,
        address: &GrainAddress,
        _version: VersionTag,
    ) -> Result<(), BackendError> {
        let key = self.key(&address.grain_id);
        let expected = serde_json::to_string(address)?;
        if !self.client.delete_if_equals(&key, &expected).await? {
            tracing::debug!(key = %key, "KeyValue: unregister condition not met, nothing removed");
        }
        Ok(())
    }

    async fn lookup(
        &self,
        grain_id: &str,
    ) -> Result<Option<(GrainAddress, VersionTag)>, BackendError> {
        match self.client.get(&self.key(grain_id)).await? {
            Some(stored) => Ok(Some((serde_json::from_str(&stored)?, VersionTag::NONE))),
            None => Ok(None),
        }
    }
}

/// In-memory [`KeyValueClient`] with fault injection.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    keyspace: Mutex<Option<HashMap<String, String>>>,
    ensure_calls: AtomicU32,
    fail_next: AtomicU32,
}

impl InMemoryKeyValueStore {
    /// Create a store without a keyspace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Successful `ensure_keyspace` calls so far.
    pub fn ensure_keyspace_calls(&self) -> u32 {
        self.ensure_calls.load(Ordering::SeqCst)
    }

    /// Raw value stored under `key`.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.keyspace.lock().as_ref()?.get(key).cloned()
    }

    fn inject_fault(&self) -> Result<(), StoreError> {
        let fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn with_keyspace<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, String>) -> T,
    ) -> Result<T, StoreError> {
        self.inject_fault()?;
        let mut keyspace = self.keyspace.lock();
        let keyspace = keyspace
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("keyspace does not exist".to_string()))?;
        Ok(f(keyspace))
    }
}

#[async_trait]
impl KeyValueClient for InMemoryKeyValueStore {
    async fn ensure_keyspace(&self) -> Result<(), StoreError> {
        self.inject_fault()?;
        self.keyspace.lock().get_or_insert_with(HashMap::new);
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_keyspace(|keyspace| keyspace.get(key).cloned())
    }

    async fn set_if_not_exists(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.with_keyspace(|keyspace| {
            if keyspace.contains_key(key) {
                false
            } else {
                keyspace.insert(key.to_string(), value.to_string());
                true
            }
        })
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.with_keyspace(|keyspace| {
            if keyspace.get(key).map(String::as_str) == Some(expected) {
                keyspace.remove(key);
                true
            } else {
                false
            }
        })
    }
}
