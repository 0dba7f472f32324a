//! Single-process cluster plumbing.
//!
//! [`InProcessTransport`] delivers directory calls straight to the target
//! silo's [`LocalGrainDirectory`] in the same process, and
//! [`InMemoryActivationCatalog`] stands in for a silo's activation layer.
//! Together they run a whole multi-silo directory inside one test or
//! simulation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::error::DirectoryError;
use crate::local::{ActivationSource, DirectoryTransport, LocalActivation, LocalGrainDirectory};
use crate::model::{ActivationAddress, AddressAndTag, AddressesAndTag, GrainId, SiloAddress};

/// Routes directory calls to silos living in the same process.
#[derive(Debug, Default)]
pub struct InProcessTransport {
    silos: RwLock<HashMap<SiloAddress, Weak<LocalGrainDirectory>>>,
    unreachable: RwLock<HashSet<SiloAddress>>,
}

impl InProcessTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `directory` reachable at its silo address.
    pub fn add(&self, directory: &Arc<LocalGrainDirectory>) {
        self.silos
            .write()
            .insert(directory.local_silo().clone(), Arc::downgrade(directory));
    }

    /// Remove a silo, as if its process died.
    pub fn remove(&self, silo: &SiloAddress) {
        self.silos.write().remove(silo);
    }

    /// Make calls to `silo` fail (or succeed again) without removing it.
    pub fn set_reachable(&self, silo: &SiloAddress, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(silo);
        } else {
            unreachable.insert(silo.clone());
        }
    }

    fn target(&self, silo: &SiloAddress) -> Result<Arc<LocalGrainDirectory>, DirectoryError> {
        if self.unreachable.read().contains(silo) {
            return Err(DirectoryError::Transport(format!("{silo} is unreachable")));
        }
        self.silos
            .read()
            .get(silo)
            .and_then(Weak::upgrade)
            .ok_or_else(|| DirectoryError::SiloUnavailable(silo.clone()))
    }
}

#[async_trait]
impl DirectoryTransport for InProcessTransport {
    async fn register(
        &self,
        target: &SiloAddress,
        address: ActivationAddress,
        single_activation: bool,
        hops: u8,
    ) -> Result<AddressAndTag, DirectoryError> {
        self.target(target)?
            .register(address, single_activation, hops)
            .await
    }

    async fn unregister(
        &self,
        target: &SiloAddress,
        addresses: Vec<ActivationAddress>,
        hops: u8,
    ) -> Result<(), DirectoryError> {
        self.target(target)?.unregister_many(addresses, hops).await
    }

    async fn lookup(
        &self,
        target: &SiloAddress,
        grain: GrainId,
        hops: u8,
    ) -> Result<Option<AddressesAndTag>, DirectoryError> {
        self.target(target)?.lookup(&grain, hops).await
    }

    async fn accept_existing_registrations(
        &self,
        target: &SiloAddress,
        single: Vec<ActivationAddress>,
        multi: Vec<ActivationAddress>,
    ) -> Result<(), DirectoryError> {
        self.target(target)?
            .accept_existing_registrations(single, multi)
            .map(|_| ())
    }

    async fn delete_activations(
        &self,
        target: &SiloAddress,
        addresses: Vec<ActivationAddress>,
    ) -> Result<(), DirectoryError> {
        self.target(target)?.delete_activations(addresses).await
    }
}

/// In-memory set of the activations hosted on one silo.
///
/// Destroyed activations are removed and remembered, so tests can check
/// which duplicates were torn down.
#[derive(Debug, Default)]
pub struct InMemoryActivationCatalog {
    hosted: Mutex<Vec<LocalActivation>>,
    destroyed: Mutex<Vec<ActivationAddress>>,
}

impl InMemoryActivationCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new activation.
    pub fn add(&self, address: ActivationAddress, single_activation: bool) {
        self.hosted.lock().push(LocalActivation {
            address,
            single_activation,
        });
    }

    /// Forget an activation (normal deactivation).
    pub fn remove(&self, address: &ActivationAddress) -> bool {
        let mut hosted = self.hosted.lock();
        let before = hosted.len();
        hosted.retain(|a| a.address != *address);
        hosted.len() != before
    }

    /// `true` if the activation is hosted here.
    pub fn contains(&self, address: &ActivationAddress) -> bool {
        self.hosted.lock().iter().any(|a| a.address == *address)
    }

    /// Every hosted activation address.
    pub fn addresses(&self) -> Vec<ActivationAddress> {
        self.hosted.lock().iter().map(|a| a.address.clone()).collect()
    }

    /// Activations destroyed as registration-race losers.
    pub fn destroyed(&self) -> Vec<ActivationAddress> {
        self.destroyed.lock().clone()
    }
}

#[async_trait]
impl ActivationSource for InMemoryActivationCatalog {
    fn local_activations(&self) -> Vec<LocalActivation> {
        self.hosted.lock().clone()
    }

    async fn destroy_activations(&self, addresses: Vec<ActivationAddress>) {
        for address in addresses {
            if self.remove(&address) {
                tracing::debug!(activation = %address, "Catalog: destroyed duplicate activation");
                self.destroyed.lock().push(address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectoryConfig;
    use crate::membership::MembershipSnapshot;
    use crate::model::ActivationId;

    fn silo(n: u8) -> SiloAddress {
        SiloAddress::parse(&format!("10.0.0.{n}:100@1")).expect("silo")
    }

    fn address(host: u8, activation: u128) -> ActivationAddress {
        ActivationAddress::new(
            GrainId::parse("user/42").expect("grain"),
            silo(host),
            ActivationId::new(activation),
        )
    }

    #[tokio::test]
    async fn test_catalog_destroy_records_only_hosted() {
        let catalog = InMemoryActivationCatalog::new();
        catalog.add(address(1, 1), true);
        catalog
            .destroy_activations(vec![address(1, 1), address(1, 2)])
            .await;
        assert!(!catalog.contains(&address(1, 1)));
        assert_eq!(catalog.destroyed(), vec![address(1, 1)]);
    }

    #[tokio::test]
    async fn test_unknown_and_unreachable_targets() {
        let transport = Arc::new(InProcessTransport::new());
        let err = transport
            .lookup(&silo(9), GrainId::parse("user/1").expect("grain"), 0)
            .await
            .expect_err("unknown silo");
        assert!(matches!(err, DirectoryError::SiloUnavailable(_)));

        let directory = LocalGrainDirectory::new(
            silo(1),
            &DirectoryConfig::default(),
            transport.clone(),
            Arc::new(InMemoryActivationCatalog::new()),
        );
        transport.add(&directory);
        directory.apply_membership(MembershipSnapshot::with_active([silo(1)]));

        transport.set_reachable(&silo(1), false);
        let err = transport
            .lookup(&silo(1), GrainId::parse("user/1").expect("grain"), 0)
            .await
            .expect_err("unreachable");
        assert!(matches!(err, DirectoryError::Transport(_)));

        transport.set_reachable(&silo(1), true);
        assert!(transport
            .lookup(&silo(1), GrainId::parse("user/1").expect("grain"), 0)
            .await
            .expect("reachable")
            .is_none());
    }
}
