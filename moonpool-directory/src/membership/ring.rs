//! Consistent-hash ring assigning grain ids to owning silos.
//!
//! Each active silo contributes a fixed number of virtual buckets. A grain
//! belongs to the silo holding the first bucket at or after the grain's
//! hash, wrapping around. Ownership depends only on the set of active silos
//! and the grain id, so every silo with the same snapshot computes the same
//! owner.

use xxhash_rust::xxh3::xxh3_64;

use crate::model::{GrainId, SiloAddress};

/// Stable hash of a grain id.
pub fn grain_hash(grain: &GrainId) -> u64 {
    xxh3_64(grain.to_string().as_bytes())
}

fn bucket_hash(silo: &SiloAddress, bucket: usize) -> u64 {
    xxh3_64(format!("{silo}#{bucket}").as_bytes())
}

/// Ring of virtual buckets over the active silos.
#[derive(Debug, Clone, Default)]
pub struct PartitionRing {
    buckets: Vec<(u64, SiloAddress)>,
}

impl PartitionRing {
    /// Build a ring over `silos` with `buckets_per_silo` points each.
    pub fn new(silos: &[SiloAddress], buckets_per_silo: usize) -> Self {
        let mut buckets: Vec<_> = silos
            .iter()
            .flat_map(|silo| {
                (0..buckets_per_silo).map(move |bucket| (bucket_hash(silo, bucket), silo.clone()))
            })
            .collect();
        buckets.sort();
        Self { buckets }
    }

    /// Silo owning `grain`, or `None` for an empty ring.
    pub fn owner(&self, grain: &GrainId) -> Option<&SiloAddress> {
        if self.buckets.is_empty() {
            return None;
        }
        let hash = grain_hash(grain);
        let index = self.buckets.partition_point(|(point, _)| *point < hash);
        let (_, silo) = &self.buckets[index % self.buckets.len()];
        Some(silo)
    }

    /// `true` when no silo is on the ring.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn silo(n: u8) -> SiloAddress {
        SiloAddress::parse(&format!("10.0.0.{n}:100@1")).expect("silo")
    }

    fn grains(count: usize) -> Vec<GrainId> {
        (0..count)
            .map(|n| GrainId::new("user", n.to_string()).expect("grain"))
            .collect()
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = PartitionRing::new(&[], 30);
        assert!(ring.is_empty());
        assert!(ring.owner(&grains(1)[0]).is_none());
    }

    #[test]
    fn test_owner_is_deterministic() {
        let a = PartitionRing::new(&[silo(1), silo(2), silo(3)], 30);
        let b = PartitionRing::new(&[silo(3), silo(1), silo(2)], 30);
        for grain in grains(200) {
            assert_eq!(a.owner(&grain), b.owner(&grain));
        }
    }

    #[test]
    fn test_every_silo_owns_something() {
        let silos = [silo(1), silo(2), silo(3)];
        let ring = PartitionRing::new(&silos, 30);
        let mut counts: HashMap<SiloAddress, usize> = HashMap::new();
        for grain in grains(3000) {
            let owner = ring.owner(&grain).expect("owner").clone();
            *counts.entry(owner).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        for silo in silos {
            assert!(counts[&silo] > 300, "{silo} owns too few grains: {counts:?}");
        }
    }

    #[test]
    fn test_adding_a_silo_moves_grains_only_to_it() {
        let before = PartitionRing::new(&[silo(1), silo(2)], 30);
        let after = PartitionRing::new(&[silo(1), silo(2), silo(3)], 30);
        for grain in grains(500) {
            let old = before.owner(&grain).expect("owner");
            let new = after.owner(&grain).expect("owner");
            assert!(new == old || *new == silo(3));
        }
    }
}
