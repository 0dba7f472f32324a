//! # Moonpool Grain Directory
//!
//! Location service for moonpool virtual actors (grains): for every grain id
//! it records which silo hosts the grain's activation, and keeps at most one
//! activation alive for single-activation grains.
//!
//! This crate provides:
//! - **Partitioned directory**: every silo owns a slice of the key space on a
//!   consistent-hash ring and holds the authoritative entries for it
//! - **Handoff**: on membership change, entries move to their new owner and
//!   duplicate activations are destroyed
//! - **Pluggable backends**: table-store and key-value reference backends
//!   behind a retrying adapter
//! - **Locator**: one API over both families, with an LRU + TTL cache
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use moonpool_directory::{
//!     ActivationAddress, ActivationId, DirectoryConfig, GrainId, InMemoryActivationCatalog,
//!     InProcessTransport, LocalGrainDirectory, MembershipSnapshot, SiloAddress,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(InProcessTransport::new());
//! let silo = SiloAddress::parse("10.0.0.1:11111@1")?;
//! let directory = LocalGrainDirectory::new(
//!     silo.clone(),
//!     &DirectoryConfig::default(),
//!     transport.clone(),
//!     Arc::new(InMemoryActivationCatalog::new()),
//! );
//! transport.add(&directory);
//! directory.apply_membership(MembershipSnapshot::with_active([silo.clone()]));
//!
//! let address = ActivationAddress::new(GrainId::parse("user/42")?, silo, ActivationId::new_random());
//! let registered = directory.register(address.clone(), true, 0).await?;
//! assert_eq!(registered.address, address);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Grain ids, silo and activation addresses, directory entries.
pub mod model;

/// Error types for every layer.
pub mod error;

/// Directory configuration.
pub mod config;

/// Entry-level directory contract.
pub mod directory;

/// Authoritative in-memory partition table.
pub mod partition;

/// Cluster membership and the partition ring.
pub mod membership;

/// Grain type to directory routing.
pub mod resolver;

/// Location cache.
pub mod cache;

/// Ownership handoff on membership change.
pub mod handoff;

/// Per-silo in-cluster directory.
pub mod local;

/// External-store directory backends.
pub mod backend;

/// Locator façade.
pub mod locator;

/// Single-process cluster plumbing.
pub mod cluster;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use model::{
    ActivationAddress, ActivationId, AddressAndTag, AddressesAndTag, DirectoryEntry,
    GrainAddress, GrainId, GrainType, OperationResult, SiloAddress, VersionTag,
};

pub use error::{BackendError, ConfigError, DirectoryError, ParseError, StoreError};

pub use config::{DirectoryConfig, DirectoryConfigBuilder};

pub use directory::GrainDirectory;

pub use partition::DirectoryPartition;

pub use membership::{
    ClusterMember, DirectoryMembership, MembershipSnapshot, MembershipVersion, PartitionRing,
    SiloStatus, SiloStatusOracle,
};

pub use resolver::{GrainDirectoryResolver, GrainDirectoryResolverBuilder};

pub use cache::GrainDirectoryCache;

pub use handoff::HandoffManager;

pub use local::{ActivationSource, DirectoryTransport, LocalActivation, LocalGrainDirectory};

pub use backend::{
    sanitize_row_key, DirectoryBackend, InMemoryKeyValueStore, InMemoryTableStore,
    KeyValueClient, KeyValueGrainDirectory, PluggableGrainDirectory, RetryPolicy, TableClient,
    TableEntity, TableGrainDirectory,
};

pub use locator::{
    CachedGrainLocator, GrainLocator, GrainLocatorSelector, InClusterGrainLocator,
    UnregistrationCause,
};

pub use cluster::{InMemoryActivationCatalog, InProcessTransport};
