//! The directory contract: register, unregister and look up grain entries.
//!
//! [`GrainDirectory`] is produced either by the in-cluster partition table
//! ([`DirectoryPartition`](crate::DirectoryPartition)) or by a pluggable
//! backend ([`PluggableGrainDirectory`](crate::PluggableGrainDirectory)), and
//! consumed by the locator façade.
//!
//! # Register semantics
//!
//! - No entry for the grain: the entry is stored, [`OperationResult::Success`].
//! - An entry exists: nothing is overwritten and the stored entry comes back
//!   as [`OperationResult::Redirect`]. First writer wins.
//!
//! # Unregister semantics
//!
//! Removes the stored entry only if its activation matches the caller's.
//! A missing entry or a different activation is a successful no-op.

use std::fmt;

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::DirectoryError;
use crate::model::{DirectoryEntry, OperationResult};

/// Directory of grain registrations.
///
/// Batch variants operate element-wise: one result per input, each element
/// succeeding or failing independently. A batch is not a transaction.
#[async_trait]
pub trait GrainDirectory: fmt::Debug + Send + Sync {
    /// Register an activation. See the module docs for conflict handling.
    async fn register(&self, entry: DirectoryEntry) -> OperationResult;

    /// Conditionally remove an activation.
    async fn unregister(&self, entry: DirectoryEntry) -> OperationResult;

    /// Look up the current entry for a grain id.
    ///
    /// A grain that was never registered is `Ok(None)`, not an error.
    async fn lookup(&self, grain_id: &str) -> Result<Option<DirectoryEntry>, DirectoryError>;

    /// Register every entry, one result per input in input order.
    async fn register_many(&self, entries: Vec<DirectoryEntry>) -> Vec<OperationResult> {
        join_all(entries.into_iter().map(|entry| self.register(entry))).await
    }

    /// Unregister every entry, one result per input in input order.
    async fn unregister_many(&self, entries: Vec<DirectoryEntry>) -> Vec<OperationResult> {
        join_all(entries.into_iter().map(|entry| self.unregister(entry))).await
    }

    /// Look up every grain id, one result per input in input order.
    async fn lookup_many(
        &self,
        grain_ids: &[String],
    ) -> Vec<Result<Option<DirectoryEntry>, DirectoryError>> {
        join_all(grain_ids.iter().map(|id| self.lookup(id))).await
    }
}
