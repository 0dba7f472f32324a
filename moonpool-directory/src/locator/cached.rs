use std::sync::Arc;

use async_trait::async_trait;

use super::{GrainLocator, UnregistrationCause};
use crate::cache::GrainDirectoryCache;
use crate::config::DirectoryConfig;
use crate::directory::GrainDirectory;
use crate::error::DirectoryError;
use crate::model::{
    ActivationAddress, AddressAndTag, AddressesAndTag, DirectoryEntry, GrainId, GrainType,
    OperationResult, VersionTag,
};
use crate::resolver::GrainDirectoryResolver;

/// Locator over pluggable directories, fronted by a cache.
#[derive(Debug)]
pub struct CachedGrainLocator {
    resolver: Arc<GrainDirectoryResolver>,
    cache: GrainDirectoryCache,
}

impl CachedGrainLocator {
    /// Create a locator with a cache sized from `config`.
    pub fn new(resolver: Arc<GrainDirectoryResolver>, config: &DirectoryConfig) -> Self {
        Self {
            resolver,
            cache: GrainDirectoryCache::from_config(config),
        }
    }

    /// The location cache.
    pub fn cache(&self) -> &GrainDirectoryCache {
        &self.cache
    }

    fn directory(&self, grain_type: &GrainType) -> Result<Arc<dyn GrainDirectory>, DirectoryError> {
        self.resolver
            .resolve(grain_type)
            .ok_or_else(|| DirectoryError::NoDirectory(grain_type.to_string()))
    }
}

#[async_trait]
impl GrainLocator for CachedGrainLocator {
    async fn register(&self, address: ActivationAddress) -> Result<AddressAndTag, DirectoryError> {
        let directory = self.directory(address.grain.grain_type())?;
        let result = directory
            .register(DirectoryEntry::from_address(&address, VersionTag::NONE))
            .await;
        if let OperationResult::Redirect { actual, .. } = &result {
            tracing::debug!(grain = %address.grain, winner = %actual.activation_address, "Locator: registration lost");
        }
        let registered = result.into_authoritative()?.to_address_and_tag()?;
        self.cache.add_or_update(
            &registered.address.grain,
            vec![(
                registered.address.silo.clone(),
                registered.address.activation,
            )],
            registered.version,
        );
        Ok(registered)
    }

    async fn unregister(
        &self,
        address: &ActivationAddress,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        let directory = self.directory(address.grain.grain_type())?;
        let result = directory
            .unregister(DirectoryEntry::from_address(address, VersionTag::NONE))
            .await;
        match cause {
            UnregistrationCause::Force => {
                self.cache.remove(&address.grain);
            }
            UnregistrationCause::NonexistentActivation => {
                self.cache.invalidate(address);
            }
        }
        match result {
            OperationResult::Failure { cause, .. } => Err(cause),
            OperationResult::Success { .. } | OperationResult::Redirect { .. } => Ok(()),
        }
    }

    async fn lookup(&self, grain: &GrainId) -> Result<Option<AddressesAndTag>, DirectoryError> {
        if let Some(cached) = self.cache.lookup(grain) {
            return Ok(Some(cached));
        }
        let directory = self.directory(grain.grain_type())?;
        let Some(entry) = directory.lookup(&grain.to_string()).await? else {
            return Ok(None);
        };
        let found = entry.to_addresses_and_tag()?;
        self.cache.add_addresses(&found);
        Ok(Some(found))
    }

    fn try_local_lookup(&self, grain: &GrainId) -> Option<AddressesAndTag> {
        self.cache.lookup(grain)
    }

    fn invalidate_cache(&self, address: &ActivationAddress) {
        self.cache.invalidate(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryKeyValueStore, KeyValueGrainDirectory, PluggableGrainDirectory};
    use crate::model::{ActivationId, SiloAddress};

    fn address(host: u8, activation: u128) -> ActivationAddress {
        ActivationAddress::new(
            GrainId::parse("order/42").expect("grain"),
            SiloAddress::parse(&format!("10.0.0.{host}:100@1")).expect("silo"),
            ActivationId::new(activation),
        )
    }

    fn locator() -> CachedGrainLocator {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let resolver = GrainDirectoryResolver::builder()
            .directory(
                "orders",
                Arc::new(PluggableGrainDirectory::new(KeyValueGrainDirectory::new(
                    "cluster", store,
                ))),
            )
            .grain_type(GrainType::new("order"), "orders")
            .build()
            .expect("resolver");
        CachedGrainLocator::new(Arc::new(resolver), &DirectoryConfig::default())
    }

    #[tokio::test]
    async fn test_register_caches_winner() {
        let locator = locator();
        let first = locator.register(address(1, 1)).await.expect("first");
        let second = locator.register(address(2, 2)).await.expect("second");
        assert_eq!(first.address, address(1, 1));
        assert_eq!(second.address, address(1, 1));
        assert_eq!(
            locator
                .try_local_lookup(&address(1, 1).grain)
                .and_then(|f| f.primary().cloned()),
            Some(address(1, 1))
        );
    }

    #[tokio::test]
    async fn test_unregister_evicts_cache() {
        let locator = locator();
        locator.register(address(1, 1)).await.expect("register");
        locator
            .unregister(&address(1, 1), UnregistrationCause::Force)
            .await
            .expect("unregister");
        assert!(locator.try_local_lookup(&address(1, 1).grain).is_none());
        assert!(locator
            .lookup(&address(1, 1).grain)
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn test_lookup_fills_cache() {
        let locator = locator();
        locator.register(address(1, 1)).await.expect("register");
        locator.cache().clear();

        let found = locator.lookup(&address(1, 1).grain).await.expect("lookup");
        assert_eq!(found.and_then(|f| f.primary().cloned()), Some(address(1, 1)));
        assert_eq!(locator.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_type_is_typed_error() {
        let locator = locator();
        let stray = ActivationAddress::new(
            GrainId::parse("user/1").expect("grain"),
            SiloAddress::parse("10.0.0.1:100@1").expect("silo"),
            ActivationId::new(1),
        );
        assert!(matches!(
            locator.register(stray).await,
            Err(DirectoryError::NoDirectory(_))
        ));
    }
}
