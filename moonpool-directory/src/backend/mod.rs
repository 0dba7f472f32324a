//! Pluggable directory backends backed by external durable stores.
//!
//! A [`DirectoryBackend`] only has to provide the store's native
//! conditional-write primitives:
//!
//! - `register` is insert-if-absent; on conflict it returns what is stored,
//! - `unregister` deletes only when the stored value still matches,
//! - `lookup` is a side-effect free read.
//!
//! Stores with row versions (e-tags) report them as a [`VersionTag`];
//! stores without report [`VersionTag::NONE`].
//!
//! [`PluggableGrainDirectory`] turns any backend into a [`GrainDirectory`]:
//! lazy one-time initialization, bounded retry of transient failures and
//! mapping to [`OperationResult`].

mod kv;
mod table;

pub use kv::{InMemoryKeyValueStore, KeyValueClient, KeyValueGrainDirectory};
pub use table::{
    sanitize_row_key, InMemoryTableStore, TableClient, TableEntity, TableGrainDirectory,
};

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::config::DirectoryConfig;
use crate::directory::GrainDirectory;
use crate::error::{BackendError, DirectoryError};
use crate::model::{ActivationAddress, DirectoryEntry, GrainAddress, OperationResult, VersionTag};

/// Contract of an external directory store.
#[async_trait]
pub trait DirectoryBackend: fmt::Debug + Send + Sync {
    /// Create the physical container (table, keyspace) if it does not exist.
    async fn initialize(&self) -> Result<(), BackendError>;

    /// Insert `address` if its grain has no entry; return what is stored
    /// and its version.
    async fn register(
        &self,
        address: &GrainAddress,
    ) -> Result<(GrainAddress, VersionTag), BackendError>;

    /// Delete `address` if it is still the stored entry. A `version` other
    /// than [`VersionTag::NONE`] must also match the stored version, where
    /// the store keeps one.
    async fn unregister(
        &self,
        address: &GrainAddress,
        version: VersionTag,
    ) -> Result<(), BackendError>;

    /// Read the stored entry of a grain and its version.
    async fn lookup(
        &self,
        grain_id: &str,
    ) -> Result<Option<(GrainAddress, VersionTag)>, BackendError>;
}

/// Fixed-delay bounded retry for transient backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DirectoryConfig::default())
    }
}

impl RetryPolicy {
    /// The backend retry settings of `config`.
    pub fn from_config(config: &DirectoryConfig) -> Self {
        Self {
            max_attempts: config.backend_max_attempts(),
            delay: config.backend_retry_delay(),
        }
    }

    async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, DirectoryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(DirectoryError::Backend(e)),
                Err(e) if attempt >= max_attempts => {
                    tracing::warn!(operation, attempts = attempt, error = %e, "Backend: retries exhausted");
                    return Err(DirectoryError::RetriesExhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    tracing::debug!(operation, attempt, error = %e, "Backend: transient failure, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}

/// [`GrainDirectory`] over a [`DirectoryBackend`].
#[derive(Debug)]
pub struct PluggableGrainDirectory<B> {
    backend: B,
    retry: RetryPolicy,
    initialized: OnceCell<()>,
}

impl<B: DirectoryBackend> PluggableGrainDirectory<B> {
    /// Wrap `backend` with the default retry policy.
    pub fn new(backend: B) -> Self {
        Self::with_retry(backend, RetryPolicy::default())
    }

    /// Wrap `backend` with an explicit retry policy.
    pub fn with_retry(backend: B, retry: RetryPolicy) -> Self {
        Self {
            backend,
            retry,
            initialized: OnceCell::new(),
        }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Initialize the backend once. Later calls return immediately; a failed
    /// initialization is attempted again on the next call.
    pub async fn ensure_initialized(&self) -> Result<(), DirectoryError> {
        self.initialized
            .get_or_try_init(|| async {
                self.retry
                    .run("initialize", || self.backend.initialize())
                    .await?;
                tracing::info!(backend = ?self.backend, "Backend: initialized");
                Ok::<(), DirectoryError>(())
            })
            .await
            .map(|_| ())
    }

    async fn try_register(
        &self,
        address: &ActivationAddress,
    ) -> Result<(ActivationAddress, VersionTag), DirectoryError> {
        self.ensure_initialized().await?;
        let record = GrainAddress::from(address);
        let (stored, version) = self
            .retry
            .run("register", || self.backend.register(&record))
            .await?;
        Ok((ActivationAddress::try_from(&stored)?, version))
    }

    async fn try_unregister(
        &self,
        address: &ActivationAddress,
        version: VersionTag,
    ) -> Result<(), DirectoryError> {
        self.ensure_initialized().await?;
        let record = GrainAddress::from(address);
        self.retry
            .run("unregister", || self.backend.unregister(&record, version))
            .await
    }
}

#[async_trait]
impl<B: DirectoryBackend> GrainDirectory for PluggableGrainDirectory<B> {
    async fn register(&self, entry: DirectoryEntry) -> OperationResult {
        let address = match entry.to_address() {
            Ok(address) => address,
            Err(e) => {
                return OperationResult::Failure {
                    entry,
                    cause: e.into(),
                }
            }
        };
        match self.try_register(&address).await {
            Ok((stored, version)) if stored == address => OperationResult::Success {
                entry: DirectoryEntry::from_address(&stored, version),
            },
            Ok((stored, version)) => {
                tracing::debug!(grain = %address.grain, winner = %stored.silo, "Backend: registration redirected");
                OperationResult::Redirect {
                    entry,
                    actual: DirectoryEntry::from_address(&stored, version),
                }
            }
            Err(cause) => OperationResult::Failure { entry, cause },
        }
    }

    async fn unregister(&self, entry: DirectoryEntry) -> OperationResult {
        let result = match entry.to_address() {
            Ok(address) => self.try_unregister(&address, entry.version()).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => OperationResult::Success { entry },
            Err(cause) => OperationResult::Failure { entry, cause },
        }
    }

    async fn lookup(&self, grain_id: &str) -> Result<Option<DirectoryEntry>, DirectoryError> {
        self.ensure_initialized().await?;
        let stored = self
            .retry
            .run("lookup", || self.backend.lookup(grain_id))
            .await?;
        stored
            .map(|(record, version)| -> Result<DirectoryEntry, DirectoryError> {
                let address = ActivationAddress::try_from(&record)?;
                Ok(DirectoryEntry::from_address(&address, version))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::StoreError;
    use crate::model::{ActivationId, GrainId, SiloAddress};

    fn entry(host: u8, activation: u128) -> DirectoryEntry {
        let address = ActivationAddress::new(
            GrainId::parse("user/42").expect("grain"),
            SiloAddress::parse(&format!("10.0.0.{host}:100@1")).expect("silo"),
            ActivationId::new(activation),
        );
        DirectoryEntry::from_address(&address, VersionTag::NONE)
    }

    fn kv_directory(store: &Arc<InMemoryKeyValueStore>) -> PluggableGrainDirectory<KeyValueGrainDirectory> {
        PluggableGrainDirectory::with_retry(
            KeyValueGrainDirectory::new("cluster", store.clone()),
            RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(100),
            },
        )
    }

    #[tokio::test]
    async fn test_initialization_is_lazy_and_once() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let directory = kv_directory(&store);
        assert_eq!(store.ensure_keyspace_calls(), 0);

        directory.lookup("user/42").await.expect("lookup");
        directory.register(entry(1, 1)).await;
        directory.ensure_initialized().await.expect("init");
        assert_eq!(store.ensure_keyspace_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let directory = kv_directory(&store);
        directory.ensure_initialized().await.expect("init");

        store.fail_next(2);
        assert!(directory.register(entry(1, 1)).await.is_success());
        assert!(directory.lookup("user/42").await.expect("lookup").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_is_typed_failure() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let directory = kv_directory(&store);
        directory.ensure_initialized().await.expect("init");

        store.fail_next(3);
        match directory.register(entry(1, 1)).await {
            OperationResult::Failure {
                cause: DirectoryError::RetriesExhausted { attempts, last },
                ..
            } => {
                assert_eq!(attempts, 3);
                assert!(matches!(last, BackendError::Store(StoreError::Unavailable(_))));
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }
        assert!(directory.lookup("user/42").await.expect("lookup").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_initialization_is_retried_later() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let directory = kv_directory(&store);

        store.fail_next(3);
        assert!(directory.ensure_initialized().await.is_err());
        directory.ensure_initialized().await.expect("second init");
        assert_eq!(store.ensure_keyspace_calls(), 1);
    }

    #[tokio::test]
    async fn test_register_redirects_to_stored_value() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let directory = kv_directory(&store);

        assert!(directory.register(entry(1, 0xA)).await.is_success());
        match directory.register(entry(2, 0xB)).await {
            OperationResult::Redirect { entry: mine, actual } => {
                assert_eq!(mine, entry(2, 0xB));
                assert_eq!(actual, entry(1, 0xA));
            }
            other => panic!("expected redirect, got {other:?}"),
        }
    }
}
