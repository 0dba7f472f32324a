//! Table store backend.
//!
//! Rows are keyed `(partition key = cluster id, row key = sanitized grain id)`
//! with `SiloAddress`, `GrainId` and `ActivationId` columns. Registration is
//! an insert that fails on an existing row, in which case the stored row is
//! read back and returned. Unregistration reads the row and deletes it with
//! the row's e-tag only if the activation matches; an e-tag mismatch means
//! someone else changed the row first and counts as already unregistered.
//! Row e-tags surface as the entry's [`VersionTag`].

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::DirectoryBackend;
use crate::error::{BackendError, StoreError};
use crate::model::{GrainAddress, VersionTag};

/// One directory row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntity {
    /// Cluster id.
    pub partition_key: String,
    /// Sanitized grain id.
    pub row_key: String,
    /// Encoded silo address.
    pub silo_address: String,
    /// Encoded grain id, unsanitized.
    pub grain_id: String,
    /// Encoded activation id.
    pub activation_id: String,
}

impl TableEntity {
    fn to_grain_address(&self) -> GrainAddress {
        GrainAddress {
            silo_address: self.silo_address.clone(),
            grain_id: self.grain_id.clone(),
            activation_id: self.activation_id.clone(),
        }
    }
}

/// Minimal client surface of a table store.
#[async_trait]
pub trait TableClient: fmt::Debug + Send + Sync {
    /// Create the table if needed.
    async fn create_table_if_not_exists(&self) -> Result<(), StoreError>;

    /// Insert a row; [`StoreError::AlreadyExists`] if the key is taken.
    /// Returns the new row's e-tag.
    async fn insert(&self, entity: TableEntity) -> Result<String, StoreError>;

    /// Read a row and its e-tag.
    async fn read(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<(TableEntity, String)>, StoreError>;

    /// Delete a row if its e-tag is still `etag`;
    /// [`StoreError::ConditionNotSatisfied`] otherwise.
    async fn delete(&self, partition_key: &str, row_key: &str, etag: &str) -> Result<(), StoreError>;
}

/// Escape characters table stores reject in keys.
///
/// `/`, `\`, `#`, `?`, control characters and `%` itself become `%XX` per
/// UTF-8 byte. Escaping `%` keeps the mapping injective.
pub fn sanitize_row_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        if matches!(c, '%' | '/' | '\\' | '#' | '?') || c.is_control() {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                // Writing to a String cannot fail.
                let _ = write!(out, "%{byte:02X}");
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Directory backend over a [`TableClient`].
#[derive(Debug, Clone)]
pub struct TableGrainDirectory {
    cluster_id: String,
    client: Arc<dyn TableClient>,
}

impl TableGrainDirectory {
    /// Create a backend storing rows in `cluster_id`'s partition.
    pub fn new(cluster_id: impl Into<String>, client: Arc<dyn TableClient>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            client,
        }
    }

    async fn read(&self, grain_id: &str) -> Result<Option<(TableEntity, String)>, StoreError> {
        self.client
            .read(&self.cluster_id, &sanitize_row_key(grain_id))
            .await
    }
}

#[async_trait]
impl DirectoryBackend for TableGrainDirectory {
    async fn initialize(&self) -> Result<(), BackendError> {
        Ok(self.client.create_table_if_not_exists().await?)
    }

    async fn register(
        &self,
        address: &GrainAddress,
    ) -> Result<(GrainAddress, VersionTag), BackendError> {
        let entity = TableEntity {
            partition_key: self.cluster_id.clone(),
            row_key: sanitize_row_key(&address.grain_id),
            silo_address: address.silo_address.clone(),
            grain_id: address.grain_id.clone(),
            activation_id: address.activation_id.clone(),
        };
        match self.client.insert(entity).await {
            Ok(etag) => Ok((address.clone(), VersionTag::from_etag(&etag))),
            Err(StoreError::AlreadyExists) => match self.read(&address.grain_id).await? {
                Some((stored, etag)) => {
                    Ok((stored.to_grain_address(), VersionTag::from_etag(&etag)))
                }
                None => Err(StoreError::Unavailable(format!(
                    "row for {} vanished during registration",
                    address.grain_id
                ))
                .into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn unregister(
        &self,
        address: &GrainAddress,
        version: VersionTag,
    ) -> Result<(), BackendError> {
        let Some((stored, etag)) = self.read(&address.grain_id).await? else {
            return Ok(());
        };
        if stored.activation_id != address.activation_id {
            return Ok(());
        }
        if version != VersionTag::NONE && version != VersionTag::from_etag(&etag) {
            tracing::debug!(grain = %address.grain_id, %version, etag = %etag, "Backend: unregister with stale e-tag");
            return Err(StoreError::ConditionNotSatisfied.into());
        }
        match self
            .client
            .delete(&stored.partition_key, &stored.row_key, &etag)
            .await
        {
            Ok(()) | Err(StoreError::ConditionNotSatisfied) | Err(StoreError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn lookup(
        &self,
        grain_id: &str,
    ) -> Result<Option<(GrainAddress, VersionTag)>, BackendError> {
        Ok(self
            .read(grain_id)
            .await?
            .map(|(entity, etag)| (entity.to_grain_address(), VersionTag::from_etag(&etag))))
    }
}

type Rows = HashMap<(String, String), (TableEntity, String)>;

/// In-memory [`TableClient`] with fault injection.
#[derive(Debug, Default)]
pub struct InMemoryTableStore {
    table: Mutex<Option<Rows>>,
    etags: AtomicU64,
    fail_next: AtomicU32,
}

impl InMemoryTableStore {
    /// Create a store without a table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Overwrite a row, giving it a new e-tag, as a concurrent writer would.
    pub fn overwrite(&self, entity: TableEntity) {
        let etag = self.next_etag();
        if let Some(rows) = self.table.lock().as_mut() {
            rows.insert(
                (entity.partition_key.clone(), entity.row_key.clone()),
                (entity, etag),
            );
        }
    }

    fn next_etag(&self) -> String {
        format!("W/\"{}\"", self.etags.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn inject_fault(&self) -> Result<(), StoreError> {
        match self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(StoreError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut Rows) -> T) -> Result<T, StoreError> {
        self.inject_fault()?;
        let mut table = self.table.lock();
        let rows = table
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("table does not exist".to_string()))?;
        Ok(f(rows))
    }
}

#[async_trait]
impl TableClient for InMemoryTableStore {
    async fn create_table_if_not_exists(&self) -> Result<(), StoreError> {
        self.inject_fault()?;
        self.table.lock().get_or_insert_with(HashMap::new);
        Ok(())
    }

    async fn insert(&self, entity: TableEntity) -> Result<String, StoreError> {
        let etag = self.next_etag();
        self.with_table(|rows| {
            let key = (entity.partition_key.clone(), entity.row_key.clone());
            if rows.contains_key(&key) {
                return Err(StoreError::AlreadyExists);
            }
            rows.insert(key, (entity, etag.clone()));
            Ok(etag)
        })?
    }

    async fn read(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<(TableEntity, String)>, StoreError> {
        self.with_table(|rows| {
            rows.get(&(partition_key.to_string(), row_key.to_string()))
                .cloned()
        })
    }

    async fn delete(&self, partition_key: &str, row_key: &str, etag: &str) -> Result<(), StoreError> {
        self.with_table(|rows| {
            let key = (partition_key.to_string(), row_key.to_string());
            match rows.get(&key) {
                None => Err(StoreError::NotFound),
                Some((_, current)) if current != etag => Err(StoreError::ConditionNotSatisfied),
                Some(_) => {
                    rows.remove(&key);
                    Ok(())
                }
            }
        })?
    }
}
