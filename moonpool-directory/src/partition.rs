//! Authoritative in-memory table for the grains this silo owns.
//!
//! The partition is a [`DashMap`] keyed by [`GrainId`]. Each mutation runs
//! inside that key's shard lock via the entry API, so registration is atomic
//! per key while unrelated keys proceed in parallel. Reads never wait on a
//! global lock.
//!
//! Every successful mutation stamps the entry with a fresh [`VersionTag`]
//! drawn from a partition-wide counter, so tags strictly increase.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::directory::GrainDirectory;
use crate::error::DirectoryError;
use crate::model::{
    ActivationAddress, ActivationId, AddressAndTag, AddressesAndTag, DirectoryEntry, GrainId,
    OperationResult, SiloAddress, VersionTag,
};

#[derive(Debug, Clone)]
struct PartitionEntry {
    activations: Vec<(SiloAddress, ActivationId)>,
    single_activation: bool,
    version: VersionTag,
}

impl PartitionEntry {
    fn addresses(&self, grain: &GrainId) -> AddressesAndTag {
        AddressesAndTag {
            addresses: self
                .activations
                .iter()
                .map(|(silo, activation)| {
                    ActivationAddress::new(grain.clone(), silo.clone(), *activation)
                })
                .collect(),
            version: self.version,
        }
    }
}

/// Authoritative store for one silo's share of the grain key space.
#[derive(Debug, Default)]
pub struct DirectoryPartition {
    entries: DashMap<GrainId, PartitionEntry>,
    version: AtomicU64,
}

impl DirectoryPartition {
    /// Create an empty partition.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> VersionTag {
        VersionTag(self.version.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register an activation.
    ///
    /// For a single-activation grain the first registration wins: when an
    /// entry exists it is returned untouched and the caller compares its
    /// activation id with the one it submitted. Multi-activation grains
    /// accumulate activations and return the submitted address.
    pub fn register_activation(
        &self,
        address: &ActivationAddress,
        single_activation: bool,
    ) -> AddressAndTag {
        match self.entries.entry(address.grain.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.single_activation || single_activation {
                    if let Some((silo, activation)) = entry.activations.first() {
                        return AddressAndTag {
                            address: ActivationAddress::new(
                                address.grain.clone(),
                                silo.clone(),
                                *activation,
                            ),
                            version: entry.version,
                        };
                    }
                }
                let pair = (address.silo.clone(), address.activation);
                if !entry.activations.contains(&pair) {
                    entry.activations.push(pair);
                    entry.version = self.next_version();
                }
                AddressAndTag {
                    address: address.clone(),
                    version: entry.version,
                }
            }
            Entry::Vacant(vacant) => {
                let version = self.next_version();
                vacant.insert(PartitionEntry {
                    activations: vec![(address.silo.clone(), address.activation)],
                    single_activation,
                    version,
                });
                tracing::debug!(grain = %address.grain, silo = %address.silo, %version, "Partition: registered");
                AddressAndTag {
                    address: address.clone(),
                    version,
                }
            }
        }
    }

    /// All registered activations of a grain.
    pub fn lookup_activations(&self, grain: &GrainId) -> Option<AddressesAndTag> {
        self.entries
            .get(grain)
            .map(|entry| entry.addresses(grain))
            .filter(|found| !found.addresses.is_empty())
    }

    /// Remove an activation if it is the one registered.
    ///
    /// Returns `true` when something was removed. A missing grain or a
    /// different activation leaves the partition unchanged.
    pub fn unregister_activation(&self, address: &ActivationAddress) -> bool {
        matches!(self.unregister_at(address, VersionTag::NONE), Ok(true))
    }

    /// Like [`unregister_activation`](Self::unregister_activation), but only
    /// while the entry still carries `expected`. [`VersionTag::NONE`] skips
    /// the tag check.
    pub fn unregister_at(
        &self,
        address: &ActivationAddress,
        expected: VersionTag,
    ) -> Result<bool, DirectoryError> {
        let Entry::Occupied(mut occupied) = self.entries.entry(address.grain.clone()) else {
            return Ok(false);
        };
        let entry = occupied.get_mut();
        if expected != VersionTag::NONE && expected != entry.version {
            return Err(DirectoryError::StaleVersion {
                grain: address.grain.to_string(),
                presented: expected,
                current: entry.version,
            });
        }
        let before = entry.activations.len();
        entry
            .activations
            .retain(|(_, activation)| *activation != address.activation);
        if entry.activations.len() == before {
            return Ok(false);
        }
        if entry.activations.is_empty() {
            occupied.remove();
        } else {
            entry.version = self.next_version();
        }
        tracing::debug!(grain = %address.grain, activation = %address.activation, "Partition: unregistered");
        Ok(true)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Remove every activation hosted on one of `silos`.
    ///
    /// Returns the number of activations removed.
    pub fn unregister_silos(&self, silos: &[SiloAddress]) -> usize {
        self.retain_activations(|_, silo| !silos.contains(silo))
    }

    /// Keep only the activations for which `keep(grain, silo)` holds.
    ///
    /// Returns the number of activations removed. Grains left without any
    /// activation disappear from the partition.
    pub fn retain_activations<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&GrainId, &SiloAddress) -> bool,
    {
        let mut removed = 0;
        self.entries.retain(|grain, entry| {
            let before = entry.activations.len();
            entry.activations.retain(|(silo, _)| keep(grain, silo));
            let dropped = before - entry.activations.len();
            if dropped > 0 && !entry.activations.is_empty() {
                entry.version = self.next_version();
            }
            removed += dropped;
            !entry.activations.is_empty()
        });
        removed
    }

    /// Every registered activation, flagged with its single-activation bit.
    pub fn activations(&self) -> Vec<(ActivationAddress, bool)> {
        self.entries
            .iter()
            .flat_map(|item| {
                let single = item.single_activation;
                item.addresses(item.key())
                    .addresses
                    .into_iter()
                    .map(move |address| (address, single))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Number of grains with at least one registration.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no grain is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl GrainDirectory for DirectoryPartition {
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
        let stored = self.register_activation(&address, true);
        let actual = DirectoryEntry::from_address(&stored.address, stored.version);
        if stored.address.activation == address.activation {
            OperationResult::Success { entry: actual }
        } else {
            OperationResult::Redirect { entry, actual }
        }
    }

    /// Matches on activation id; a non-empty tag must also be current.
    async fn unregister(&self, entry: DirectoryEntry) -> OperationResult {
        let result = entry
            .to_address()
            .map_err(DirectoryError::from)
            .and_then(|address| self.unregister_at(&address, entry.version()));
        match result {
            Ok(_) => OperationResult::Success { entry },
            Err(cause) => OperationResult::Failure { entry, cause },
        }
    }

    async fn lookup(&self, grain_id: &str) -> Result<Option<DirectoryEntry>, DirectoryError> {
        let grain = GrainId::parse(grain_id)?;
        Ok(self.lookup_activations(&grain).and_then(|found| {
            found
                .primary()
                .map(|address| DirectoryEntry::from_address(address, found.version))
        }))
    }
}
