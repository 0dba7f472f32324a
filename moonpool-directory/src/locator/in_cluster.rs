use std::sync::Arc;

use async_trait::async_trait;

use super::{GrainLocator, UnregistrationCause};
use crate::cache::GrainDirectoryCache;
use crate::config::DirectoryConfig;
use crate::error::DirectoryError;
use crate::local::LocalGrainDirectory;
use crate::model::{ActivationAddress, AddressAndTag, AddressesAndTag, GrainId};

/// Locator over the silo's in-cluster directory.
///
/// Grains owned by this silo are answered from its partition; locations of
/// grains owned elsewhere are cached.
#[derive(Debug)]
pub struct InClusterGrainLocator {
    directory: Arc<LocalGrainDirectory>,
    cache: GrainDirectoryCache,
}

impl InClusterGrainLocator {
    /// Create a locator with a cache sized from `config`.
    pub fn new(directory: Arc<LocalGrainDirectory>, config: &DirectoryConfig) -> Self {
        Self {
            directory,
            cache: GrainDirectoryCache::from_config(config),
        }
    }

    /// The underlying directory.
    pub fn directory(&self) -> &Arc<LocalGrainDirectory> {
        &self.directory
    }

    /// The cache of foreign-owned locations.
    pub fn cache(&self) -> &GrainDirectoryCache {
        &self.cache
    }

    /// Register an activation of a grain that allows several concurrent
    /// activations.
    pub async fn register_multi(
        &self,
        address: ActivationAddress,
    ) -> Result<AddressAndTag, DirectoryError> {
        self.directory.register(address, false, 0).await
    }

    fn forget(&self, address: &ActivationAddress, cause: UnregistrationCause) {
        match cause {
            UnregistrationCause::Force => {
                self.cache.remove(&address.grain);
            }
            UnregistrationCause::NonexistentActivation => {
                self.cache.invalidate(address);
            }
        }
    }
}

#[async_trait]
impl GrainLocator for InClusterGrainLocator {
    async fn register(&self, address: ActivationAddress) -> Result<AddressAndTag, DirectoryError> {
        let grain = address.grain.clone();
        let registered = self.directory.register(address, true, 0).await?;
        if !self.directory.is_owner(&grain) {
            self.cache.add_or_update(
                &grain,
                vec![(
                    registered.address.silo.clone(),
                    registered.address.activation,
                )],
                registered.version,
            );
        }
        Ok(registered)
    }

    async fn unregister(
        &self,
        address: &ActivationAddress,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        let result = self.directory.unregister(address.clone(), 0).await;
        self.forget(address, cause);
        result
    }

    async fn unregister_many(
        &self,
        addresses: Vec<ActivationAddress>,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        if addresses.is_empty() {
            return Ok(());
        }
        for address in &addresses {
            self.forget(address, cause);
        }
        self.directory.unregister_many(addresses, 0).await
    }

    async fn lookup(&self, grain: &GrainId) -> Result<Option<AddressesAndTag>, DirectoryError> {
        if self.directory.is_owner(grain) {
            return self.directory.lookup(grain, 0).await;
        }
        if let Some(cached) = self.cache.lookup(grain) {
            return Ok(Some(cached));
        }
        let found = self.directory.lookup(grain, 0).await?;
        if let Some(found) = &found {
            self.cache.add_addresses(found);
        }
        Ok(found)
    }

    fn try_local_lookup(&self, grain: &GrainId) -> Option<AddressesAndTag> {
        if self.directory.is_owner(grain) {
            self.directory.local_lookup(grain)
        } else {
            self.cache.lookup(grain)
        }
    }

    fn invalidate_cache(&self, address: &ActivationAddress) {
        self.cache.invalidate(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryActivationCatalog, InProcessTransport};
    use crate::membership::MembershipSnapshot;
    use crate::model::{ActivationId, SiloAddress};

    fn silo(n: u8) -> SiloAddress {
        SiloAddress::parse(&format!("10.0.0.{n}:100@1")).expect("silo")
    }

    fn two_silos() -> Vec<Arc<LocalGrainDirectory>> {
        let transport = Arc::new(InProcessTransport::new());
        let snapshot = MembershipSnapshot::with_active([silo(1), silo(2)]);
        (1..=2)
            .map(|n| {
                let directory = LocalGrainDirectory::new(
                    silo(n),
                    &DirectoryConfig::default(),
                    transport.clone(),
                    Arc::new(InMemoryActivationCatalog::new()),
                );
                transport.add(&directory);
                directory.apply_membership(snapshot.clone());
                directory
            })
            .collect()
    }

    /// A grain owned by `owner` among the two silos.
    fn grain_owned_by(directory: &LocalGrainDirectory, owner: &SiloAddress) -> GrainId {
        (0..)
            .map(|i| GrainId::new("user", i.to_string()).expect("grain"))
            .find(|g| directory.owner(g).as_ref() == Some(owner))
            .expect("some grain maps to each silo")
    }

    #[tokio::test]
    async fn test_foreign_grains_are_cached() {
        let directories = two_silos();
        let locator = InClusterGrainLocator::new(directories[0].clone(), &DirectoryConfig::default());
        let grain = grain_owned_by(&directories[0], &silo(2));
        let address = ActivationAddress::new(grain.clone(), silo(1), ActivationId::new(7));

        locator.register(address.clone()).await.expect("register");
        assert!(directories[1].partition().lookup_activations(&grain).is_some());
        let cached = locator.try_local_lookup(&grain).expect("cached");
        assert_eq!(cached.primary(), Some(&address));

        locator
            .unregister(&address, UnregistrationCause::Force)
            .await
            .expect("unregister");
        assert!(locator.try_local_lookup(&grain).is_none());
        assert!(locator.lookup(&grain).await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn test_owned_grains_bypass_cache() {
        let directories = two_silos();
        let locator = InClusterGrainLocator::new(directories[0].clone(), &DirectoryConfig::default());
        let grain = grain_owned_by(&directories[0], &silo(1));
        let address = ActivationAddress::new(grain.clone(), silo(1), ActivationId::new(1));

        locator.register(address.clone()).await.expect("register");
        assert!(locator.cache().is_empty());
        assert_eq!(
            locator.try_local_lookup(&grain).and_then(|f| f.primary().cloned()),
            Some(address)
        );
    }

    #[tokio::test]
    async fn test_nonexistent_activation_keeps_newer_cache_entry() {
        let directories = two_silos();
        let locator = InClusterGrainLocator::new(directories[0].clone(), &DirectoryConfig::default());
        let grain = grain_owned_by(&directories[0], &silo(2));
        let current = ActivationAddress::new(grain.clone(), silo(2), ActivationId::new(2));
        let stale = ActivationAddress::new(grain.clone(), silo(1), ActivationId::new(1));

        locator.register(current.clone()).await.expect("register");
        locator
            .unregister(&stale, UnregistrationCause::NonexistentActivation)
            .await
            .expect("unregister");
        assert!(locator.try_local_lookup(&grain).is_some());
    }
}
