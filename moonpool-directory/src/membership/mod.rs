//! Membership view used by the directory: snapshot + ownership ring.

mod ring;
mod snapshot;

pub use ring::{grain_hash, PartitionRing};
pub use snapshot::{
    ClusterMember, MembershipChanges, MembershipSnapshot, MembershipVersion, SiloStatus,
    SiloStatusOracle,
};

use std::sync::Arc;

use parking_lot::RwLock;

use crate::model::{GrainId, SiloAddress};

/// A membership snapshot paired with the ring derived from its active silos.
#[derive(Debug, Clone, Default)]
pub struct DirectoryMembership {
    snapshot: MembershipSnapshot,
    ring: PartitionRing,
}

impl DirectoryMembership {
    /// Derive the ring for `snapshot`.
    pub fn new(snapshot: MembershipSnapshot, buckets_per_silo: usize) -> Self {
        let ring = PartitionRing::new(&snapshot.active_silos(), buckets_per_silo);
        Self { snapshot, ring }
    }

    /// The underlying snapshot.
    pub fn snapshot(&self) -> &MembershipSnapshot {
        &self.snapshot
    }

    /// The silo owning `grain`'s directory entry.
    pub fn owner(&self, grain: &GrainId) -> Option<&SiloAddress> {
        self.ring.owner(grain)
    }
}

impl SiloStatusOracle for DirectoryMembership {
    fn approximate_status(&self, silo: &SiloAddress) -> SiloStatus {
        self.snapshot.approximate_status(silo)
    }
}

/// The current [`DirectoryMembership`], swapped atomically on every update.
#[derive(Debug)]
pub struct MembershipView {
    current: RwLock<Arc<DirectoryMembership>>,
    buckets_per_silo: usize,
}

impl MembershipView {
    /// Start from an empty membership.
    pub fn new(buckets_per_silo: usize) -> Self {
        Self {
            current: RwLock::new(Arc::new(DirectoryMembership::default())),
            buckets_per_silo,
        }
    }

    /// The membership in effect now.
    pub fn current(&self) -> Arc<DirectoryMembership> {
        Arc::clone(&self.current.read())
    }

    /// Install `snapshot`, returning the previous and the new membership.
    ///
    /// A snapshot older than the installed one is ignored and `None` is
    /// returned.
    pub fn install(
        &self,
        snapshot: MembershipSnapshot,
    ) -> Option<(Arc<DirectoryMembership>, Arc<DirectoryMembership>)> {
        let next = Arc::new(DirectoryMembership::new(snapshot, self.buckets_per_silo));
        let mut current = self.current.write();
        if next.snapshot().version < current.snapshot().version {
            return None;
        }
        let previous = std::mem::replace(&mut *current, Arc::clone(&next));
        Some((previous, next))
    }
}

impl SiloStatusOracle for MembershipView {
    fn approximate_status(&self, silo: &SiloAddress) -> SiloStatus {
        self.current.read().approximate_status(silo)
    }
}
