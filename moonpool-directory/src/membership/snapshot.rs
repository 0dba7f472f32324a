//! Membership snapshots as supplied by the cluster membership service.
//!
//! The directory does not detect failures itself; it reacts to the
//! snapshots it is handed.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::SiloAddress;

/// Monotonically increasing membership version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MembershipVersion(pub u64);

impl MembershipVersion {
    /// Return the next version.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MembershipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Lifecycle status of a silo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiloStatus {
    /// Announced but not yet serving.
    Joining,
    /// Fully operational.
    Active,
    /// Draining work before leaving.
    ShuttingDown,
    /// Crashed or gone.
    Dead,
}

impl fmt::Display for SiloStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joining => write!(f, "Joining"),
            Self::Active => write!(f, "Active"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Dead => write!(f, "Dead"),
        }
    }
}

/// One member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Silo address.
    pub silo: SiloAddress,
    /// Current status.
    pub status: SiloStatus,
    /// Human-readable name, for logs.
    pub name: String,
}

impl ClusterMember {
    /// Create a cluster member.
    pub fn new(silo: SiloAddress, status: SiloStatus, name: impl Into<String>) -> Self {
        Self {
            silo,
            status,
            name: name.into(),
        }
    }

    /// `true` when the member can serve requests.
    pub fn is_active(&self) -> bool {
        self.status == SiloStatus::Active
    }
}

/// Immutable view of cluster membership at one version.
#[derive(Debug, Clone, Default)]
pub struct MembershipSnapshot {
    /// Known members keyed by silo address.
    pub members: HashMap<SiloAddress, ClusterMember>,
    /// Version of this snapshot.
    pub version: MembershipVersion,
}

impl MembershipSnapshot {
    /// Create an empty snapshot at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot where every given silo is active.
    pub fn with_active(silos: impl IntoIterator<Item = SiloAddress>) -> Self {
        let mut snapshot = Self::new();
        for silo in silos {
            snapshot.set_status(silo, SiloStatus::Active);
        }
        snapshot
    }

    /// Copy of this snapshot with `silo` set to `status` and the version bumped.
    pub fn updated(&self, silo: SiloAddress, status: SiloStatus) -> Self {
        let mut next = self.clone();
        next.set_status(silo, status);
        next
    }

    /// Copy of this snapshot without `silo` and with the version bumped.
    pub fn without(&self, silo: &SiloAddress) -> Self {
        let mut next = self.clone();
        next.members.remove(silo);
        next.version = next.version.next();
        next
    }

    fn set_status(&mut self, silo: SiloAddress, status: SiloStatus) {
        let name = silo.to_string();
        self.members
            .entry(silo.clone())
            .and_modify(|member| member.status = status)
            .or_insert_with(|| ClusterMember::new(silo, status, name));
        self.version = self.version.next();
    }

    /// Active silos in ascending address order.
    pub fn active_silos(&self) -> Vec<SiloAddress> {
        let mut silos: Vec<_> = self
            .members
            .values()
            .filter(|m| m.is_active())
            .map(|m| m.silo.clone())
            .collect();
        silos.sort();
        silos
    }

    /// Status of a silo, or `None` if it is unknown.
    pub fn status(&self, silo: &SiloAddress) -> Option<SiloStatus> {
        self.members.get(silo).map(|m| m.status)
    }

    /// Changes to the active set since `previous`, plus the silos that died.
    ///
    /// A silo dies when it was known and not dead in `previous` and is dead
    /// or gone now, whatever status it went through on the way.
    pub fn changes_since(&self, previous: &MembershipSnapshot) -> MembershipChanges {
        let before = previous.active_silos();
        let after = self.active_silos();
        let mut died: Vec<_> = previous
            .members
            .values()
            .filter(|m| m.status != SiloStatus::Dead)
            .filter(|m| self.approximate_status(&m.silo) == SiloStatus::Dead)
            .map(|m| m.silo.clone())
            .collect();
        died.sort();
        MembershipChanges {
            added: after.iter().filter(|s| !before.contains(s)).cloned().collect(),
            removed: before.iter().filter(|s| !after.contains(s)).cloned().collect(),
            died,
        }
    }
}

/// Difference between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChanges {
    /// Silos that are now active and were not before.
    pub added: Vec<SiloAddress>,
    /// Silos that were active and no longer are.
    pub removed: Vec<SiloAddress>,
    /// Silos that are now dead or gone and were alive before, active or not.
    pub died: Vec<SiloAddress>,
}

impl MembershipChanges {
    /// `true` when neither the active set nor the set of live silos changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.died.is_empty()
    }
}

/// Approximate, possibly stale, per-silo status.
pub trait SiloStatusOracle: Send + Sync {
    /// Best known status of `silo`; unknown silos are reported as dead.
    fn approximate_status(&self, silo: &SiloAddress) -> SiloStatus;

    /// `true` when `silo` is believed active.
    fn is_active(&self, silo: &SiloAddress) -> bool {
        self.approximate_status(silo) == SiloStatus::Active
    }
}

impl SiloStatusOracle for MembershipSnapshot {
    fn approximate_status(&self, silo: &SiloAddress) -> SiloStatus {
        self.status(silo).unwrap_or(SiloStatus::Dead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silo(n: u8) -> SiloAddress {
        SiloAddress::parse(&format!("10.0.0.{n}:100@1")).expect("silo")
    }

    #[test]
    fn test_active_silos_sorted() {
        let snapshot = MembershipSnapshot::with_active([silo(3), silo(1), silo(2)])
            .updated(silo(2), SiloStatus::Joining);
        assert_eq!(snapshot.active_silos(), vec![silo(1), silo(3)]);
        assert_eq!(snapshot.version, MembershipVersion(4));
    }

    #[test]
    fn test_unknown_silo_is_dead() {
        let snapshot = MembershipSnapshot::with_active([silo(1)]);
        assert_eq!(snapshot.approximate_status(&silo(1)), SiloStatus::Active);
        assert_eq!(snapshot.approximate_status(&silo(9)), SiloStatus::Dead);
        assert!(!snapshot.is_active(&silo(9)));
    }

    #[test]
    fn test_changes_since() {
        let before = MembershipSnapshot::with_active([silo(1), silo(2)]);
        let after = before
            .updated(silo(2), SiloStatus::Dead)
            .updated(silo(3), SiloStatus::Active);
        let changes = after.changes_since(&before);
        assert_eq!(changes.added, vec![silo(3)]);
        assert_eq!(changes.removed, vec![silo(2)]);

        assert_eq!(changes.died, vec![silo(2)]);

        assert!(after.changes_since(&after).is_empty());
        let gone = before.without(&silo(1)).changes_since(&before);
        assert_eq!(gone.removed, vec![silo(1)]);
        assert_eq!(gone.died, vec![silo(1)]);
    }

    #[test]
    fn test_death_after_shutdown_is_a_change() {
        let active = MembershipSnapshot::with_active([silo(1), silo(2)]);
        let leaving = active.updated(silo(2), SiloStatus::ShuttingDown);
        let dead = leaving.updated(silo(2), SiloStatus::Dead);

        let first = leaving.changes_since(&active);
        assert_eq!(first.removed, vec![silo(2)]);
        assert!(first.died.is_empty());

        let second = dead.changes_since(&leaving);
        assert!(second.added.is_empty() && second.removed.is_empty());
        assert_eq!(second.died, vec![silo(2)]);
        assert!(!second.is_empty());

        assert!(dead.updated(silo(2), SiloStatus::Dead).changes_since(&dead).is_empty());
    }
}
