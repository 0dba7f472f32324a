//! Tunables for the grain directory.
//!
//! Every bound the directory enforces (cache size and TTL, handoff retry
//! policy, backend retry policy, ring granularity, hop limit) is an input
//! here, never derived.

use std::time::Duration;

use crate::error::ConfigError;

/// Default LRU capacity of a directory cache.
pub const DEFAULT_CACHE_SIZE: usize = 1_000_000;
/// Default absolute time-to-live of a cache entry.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(240);
/// Default delay between attempts of a failed handoff operation.
pub const DEFAULT_HANDOFF_RETRY_DELAY: Duration = Duration::from_millis(250);
/// Default number of attempts for a handoff operation before it is dropped.
pub const DEFAULT_HANDOFF_MAX_ATTEMPTS: u32 = 2;
/// Default number of registrations sent per handoff batch.
pub const DEFAULT_HANDOFF_CHUNK_SIZE: usize = 500;
/// Default number of attempts for a transient backend failure.
pub const DEFAULT_BACKEND_MAX_ATTEMPTS: u32 = 3;
/// Default delay between backend attempts.
pub const DEFAULT_BACKEND_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Default virtual buckets per silo on the partition ring.
pub const DEFAULT_BUCKETS_PER_SILO: usize = 30;
/// Default forwarding hop limit for in-cluster requests.
pub const DEFAULT_MAX_HOPS: u8 = 3;

/// Directory configuration.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use moonpool_directory::DirectoryConfig;
///
/// let config = DirectoryConfig::builder()
///     .cache_size(10_000)
///     .cache_ttl(Duration::from_secs(60))
///     .build()
///     .expect("valid config");
/// assert_eq!(config.cache_size(), 10_000);
/// assert_eq!(config.handoff_max_attempts(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    cache_size: usize,
    cache_ttl: Duration,
    handoff_retry_delay: Duration,
    handoff_max_attempts: u32,
    handoff_chunk_size: usize,
    backend_max_attempts: u32,
    backend_retry_delay: Duration,
    buckets_per_silo: usize,
    max_hops: u8,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            cache_ttl: DEFAULT_CACHE_TTL,
            handoff_retry_delay: DEFAULT_HANDOFF_RETRY_DELAY,
            handoff_max_attempts: DEFAULT_HANDOFF_MAX_ATTEMPTS,
            handoff_chunk_size: DEFAULT_HANDOFF_CHUNK_SIZE,
            backend_max_attempts: DEFAULT_BACKEND_MAX_ATTEMPTS,
            backend_retry_delay: DEFAULT_BACKEND_RETRY_DELAY,
            buckets_per_silo: DEFAULT_BUCKETS_PER_SILO,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

impl DirectoryConfig {
    /// Start building a directory configuration from the defaults.
    pub fn builder() -> DirectoryConfigBuilder {
        DirectoryConfigBuilder {
            config: Self::default(),
        }
    }

    /// LRU capacity of each directory cache.
    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    /// Absolute TTL of a cache entry.
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Fixed delay between attempts of a failed handoff operation.
    pub fn handoff_retry_delay(&self) -> Duration {
        self.handoff_retry_delay
    }

    /// Attempts per handoff operation before it is dropped.
    pub fn handoff_max_attempts(&self) -> u32 {
        self.handoff_max_attempts
    }

    /// Maximum registrations per handoff batch.
    pub fn handoff_chunk_size(&self) -> usize {
        self.handoff_chunk_size
    }

    /// Attempts per pluggable backend call.
    pub fn backend_max_attempts(&self) -> u32 {
        self.backend_max_attempts
    }

    /// Fixed delay between backend attempts.
    pub fn backend_retry_delay(&self) -> Duration {
        self.backend_retry_delay
    }

    /// Virtual buckets per silo on the partition ring.
    pub fn buckets_per_silo(&self) -> usize {
        self.buckets_per_silo
    }

    /// Forwarding hop limit.
    pub fn max_hops(&self) -> u8 {
        self.max_hops
    }
}

/// Builder for [`DirectoryConfig`].
#[derive(Debug, Clone)]
pub struct DirectoryConfigBuilder {
    config: DirectoryConfig,
}

impl DirectoryConfigBuilder {
    /// Set the cache capacity.
    pub fn cache_size(mut self, size: usize) -> Self {
        self.config.cache_size = size;
        self
    }

    /// Set the cache entry TTL.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Set the handoff retry delay.
    pub fn handoff_retry_delay(mut self, delay: Duration) -> Self {
        self.config.handoff_retry_delay = delay;
        self
    }

    /// Set the handoff attempt count.
    pub fn handoff_max_attempts(mut self, attempts: u32) -> Self {
        self.config.handoff_max_attempts = attempts;
        self
    }

    /// Set the handoff batch size.
    pub fn handoff_chunk_size(mut self, size: usize) -> Self {
        self.config.handoff_chunk_size = size;
        self
    }

    /// Set the backend attempt count.
    pub fn backend_max_attempts(mut self, attempts: u32) -> Self {
        self.config.backend_max_attempts = attempts;
        self
    }

    /// Set the backend retry delay.
    pub fn backend_retry_delay(mut self, delay: Duration) -> Self {
        self.config.backend_retry_delay = delay;
        self
    }

    /// Set the ring granularity.
    pub fn buckets_per_silo(mut self, buckets: usize) -> Self {
        self.config.buckets_per_silo = buckets;
        self
    }

    /// Set the forwarding hop limit.
    pub fn max_hops(mut self, hops: u8) -> Self {
        self.config.max_hops = hops;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] for every zero-valued size,
    /// count or TTL, aggregated into [`ConfigError::Multiple`] when there is
    /// more than one.
    pub fn build(self) -> Result<DirectoryConfig, ConfigError> {
        let c = &self.config;
        let mut errors = Vec::new();
        let mut require = |ok: bool, option: &'static str| {
            if !ok {
                errors.push(ConfigError::InvalidOption {
                    option,
                    reason: "must be greater than zero".to_string(),
                });
            }
        };

        require(c.cache_size > 0, "cache_size");
        require(!c.cache_ttl.is_zero(), "cache_ttl");
        require(c.handoff_max_attempts > 0, "handoff_max_attempts");
        require(c.handoff_chunk_size > 0, "handoff_chunk_size");
        require(c.backend_max_attempts > 0, "backend_max_attempts");
        require(c.buckets_per_silo > 0, "buckets_per_silo");
        require(c.max_hops > 0, "max_hops");

        ConfigError::from_list(errors)?;
        Ok(self.config)
    }
}
