//! One register/unregister/lookup surface over both directory families.
//!
//! [`InClusterGrainLocator`] answers from the silos' own partitions,
//! [`CachedGrainLocator`] from a pluggable [`GrainDirectory`](crate::GrainDirectory)
//! picked by the resolver. [`GrainLocatorSelector`] routes each call to one
//! of them by grain type.

mod cached;
mod in_cluster;

pub use cached::CachedGrainLocator;
pub use in_cluster::InClusterGrainLocator;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::DirectoryError;
use crate::model::{ActivationAddress, AddressAndTag, AddressesAndTag, GrainId, GrainType};
use crate::resolver::GrainDirectoryResolver;

/// Why an activation is being unregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregistrationCause {
    /// The activation deactivated normally, or is being forced out.
    Force,
    /// A call reached a silo that no longer hosts the activation.
    ///
    /// Cached entries are dropped only if they still name this activation.
    NonexistentActivation,
}

/// Grain location service seen by the runtime.
#[async_trait]
pub trait GrainLocator: fmt::Debug + Send + Sync {
    /// Register an activation; returns the authoritative registration.
    async fn register(&self, address: ActivationAddress) -> Result<AddressAndTag, DirectoryError>;

    /// Unregister an activation. Unregistering something absent is not an error.
    async fn unregister(
        &self,
        address: &ActivationAddress,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError>;

    /// Unregister several activations. Every one is attempted; the first
    /// failure is returned.
    async fn unregister_many(
        &self,
        addresses: Vec<ActivationAddress>,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        let results = join_all(addresses.iter().map(|a| self.unregister(a, cause))).await;
        results.into_iter().collect()
    }

    /// Find where a grain is activated.
    async fn lookup(&self, grain: &GrainId) -> Result<Option<AddressesAndTag>, DirectoryError>;

    /// Answer without leaving the process or waiting. `None` is a miss,
    /// not proof that the grain has no activation.
    fn try_local_lookup(&self, grain: &GrainId) -> Option<AddressesAndTag>;

    /// Forget cached knowledge of `address`'s activation.
    fn invalidate_cache(&self, address: &ActivationAddress);
}

/// Routes every call to the locator serving the grain's type.
#[derive(Debug)]
pub struct GrainLocatorSelector {
    resolver: Arc<GrainDirectoryResolver>,
    in_cluster: Arc<InClusterGrainLocator>,
    cached: Arc<CachedGrainLocator>,
}

impl GrainLocatorSelector {
    /// Combine both locators behind `resolver`'s routing.
    pub fn new(
        resolver: Arc<GrainDirectoryResolver>,
        in_cluster: Arc<InClusterGrainLocator>,
        cached: Arc<CachedGrainLocator>,
    ) -> Self {
        Self {
            resolver,
            in_cluster,
            cached,
        }
    }

    /// The locator serving `grain_type`.
    pub fn select(&self, grain_type: &GrainType) -> &dyn GrainLocator {
        if self.resolver.is_in_cluster(grain_type) {
            self.in_cluster.as_ref()
        } else {
            self.cached.as_ref()
        }
    }
}

#[async_trait]
impl GrainLocator for GrainLocatorSelector {
    async fn register(&self, address: ActivationAddress) -> Result<AddressAndTag, DirectoryError> {
        self.select(address.grain.grain_type())
            .register(address)
            .await
    }

    async fn unregister(
        &self,
        address: &ActivationAddress,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        self.select(address.grain.grain_type())
            .unregister(address, cause)
            .await
    }

    async fn unregister_many(
        &self,
        addresses: Vec<ActivationAddress>,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        let (in_cluster, pluggable): (Vec<_>, Vec<_>) = addresses
            .into_iter()
            .partition(|a| self.resolver.is_in_cluster(a.grain.grain_type()));
        let (a, b) = futures::join!(
            self.in_cluster.unregister_many(in_cluster, cause),
            self.cached.unregister_many(pluggable, cause),
        );
        a.and(b)
    }

    async fn lookup(&self, grain: &GrainId) -> Result<Option<AddressesAndTag>, DirectoryError> {
        self.select(grain.grain_type()).lookup(grain).await
    }

    fn try_local_lookup(&self, grain: &GrainId) -> Option<AddressesAndTag> {
        self.select(grain.grain_type()).try_local_lookup(grain)
    }

    fn invalidate_cache(&self, address: &ActivationAddress) {
        self.select(address.grain.grain_type())
            .invalidate_cache(address)
    }
}
