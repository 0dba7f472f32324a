//! Requester-side read cache of directory lookups.
//!
//! Entries are advisory: the cache is never the system of record. An entry
//! is gone once it is older than the TTL, or once it is the least recently
//! used entry and the capacity is exceeded.
//!
//! Time comes from [`tokio::time::Instant`] so tests can pause the clock.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::DirectoryConfig;
use crate::model::{ActivationAddress, ActivationId, AddressesAndTag, GrainId, SiloAddress, VersionTag};

#[derive(Debug)]
struct CachedEntry {
    activations: Vec<(SiloAddress, ActivationId)>,
    version: VersionTag,
    inserted: Instant,
    last_access: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<GrainId, CachedEntry>,
    // access sequence number -> grain, oldest first
    recency: BTreeMap<u64, GrainId>,
    sequence: u64,
}

impl CacheState {
    fn touch(&mut self, grain: &GrainId) {
        self.sequence += 1;
        let sequence = self.sequence;
        if let Some(entry) = self.entries.get_mut(grain) {
            self.recency.remove(&entry.last_access);
            entry.last_access = sequence;
            self.recency.insert(sequence, grain.clone());
        }
    }

    fn remove(&mut self, grain: &GrainId) -> bool {
        match self.entries.remove(grain) {
            Some(entry) => {
                self.recency.remove(&entry.last_access);
                true
            }
            None => false,
        }
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let Some((_, grain)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&grain);
        }
    }
}

/// LRU + TTL cache of grain locations.
#[derive(Debug)]
pub struct GrainDirectoryCache {
    state: Mutex<CacheState>,
    capacity: usize,
    ttl: Duration,
}

impl GrainDirectoryCache {
    /// Create a cache holding at most `capacity` grains for at most `ttl` each.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity,
            ttl,
        }
    }

    /// Create a cache sized from the directory configuration.
    pub fn from_config(config: &DirectoryConfig) -> Self {
        Self::new(config.cache_size(), config.cache_ttl())
    }

    /// Insert or replace the cached activations of a grain.
    ///
    /// Replacing restarts the entry's TTL and marks it most recently used.
    pub fn add_or_update(
        &self,
        grain: &GrainId,
        activations: Vec<(SiloAddress, ActivationId)>,
        version: VersionTag,
    ) {
        let mut state = self.state.lock();
        state.remove(grain);
        state.entries.insert(
            grain.clone(),
            CachedEntry {
                activations,
                version,
                inserted: Instant::now(),
                last_access: 0,
            },
        );
        state.touch(grain);
        state.evict_to(self.capacity);
    }

    /// Cache a lookup result.
    pub fn add_addresses(&self, found: &AddressesAndTag) {
        let Some(first) = found.primary() else {
            return;
        };
        let activations = found
            .addresses
            .iter()
            .map(|a| (a.silo.clone(), a.activation))
            .collect();
        self.add_or_update(&first.grain, activations, found.version);
    }

    /// Cached activations of a grain, if present and not expired.
    pub fn lookup(&self, grain: &GrainId) -> Option<AddressesAndTag> {
        let mut state = self.state.lock();
        let expired = state.entries.get(grain)?.inserted.elapsed() >= self.ttl;
        if expired {
            state.remove(grain);
            return None;
        }
        state.touch(grain);
        state.entries.get(grain).map(|entry| AddressesAndTag {
            addresses: entry
                .activations
                .iter()
                .map(|(silo, activation)| ActivationAddress::new(grain.clone(), silo.clone(), *activation))
                .collect(),
            version: entry.version,
        })
    }

    /// Drop a grain from the cache. Returns `true` if it was cached.
    pub fn remove(&self, grain: &GrainId) -> bool {
        self.state.lock().remove(grain)
    }

    /// Drop a grain's entry only if it still refers to `address`'s activation.
    ///
    /// Used when a call discovers that an activation no longer exists: a
    /// newer entry for another activation is left alone.
    pub fn invalidate(&self, address: &ActivationAddress) -> bool {
        let mut state = self.state.lock();
        let mentions = state.entries.get(&address.grain).is_some_and(|entry| {
            entry
                .activations
                .iter()
                .any(|(_, activation)| *activation == address.activation)
        });
        mentions && state.remove(&address.grain)
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.recency.clear();
    }

    /// Number of cached grains, expired ones included until they are touched.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
