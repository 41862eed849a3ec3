//! Directory configuration.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use moonpool_directory::{CacheConfig, DirectoryConfig};
//!
//! let config = DirectoryConfig::builder()
//!     .hop_limit(4)
//!     .lazy_deregistration_delay(Duration::from_secs(30))
//!     .cache(CacheConfig::lru(10_000))
//!     .build()
//!     .expect("valid config");
//! assert_eq!(config.hop_limit(), 4);
//! ```

use std::time::Duration;

use crate::silo::SiloAddress;

const DEFAULT_HOP_LIMIT: u32 = 6;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_LAZY_DEREGISTRATION_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_HANDOFF_CHUNK_SIZE: usize = 500;
const DEFAULT_REPLICATION_FACTOR: usize = 1;
const DEFAULT_CACHE_SIZE: usize = 1_000_000;
const DEFAULT_INITIAL_TTL: Duration = Duration::from_secs(30);
const DEFAULT_MAX_TTL: Duration = Duration::from_secs(240);
const DEFAULT_TTL_EXTENSION_FACTOR: f64 = 2.0;
const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Which cache strategy a silo uses for entries it does not own.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheConfig {
    /// Adaptive TTL cache refreshed by a background maintainer.
    Adaptive {
        /// Maximum number of cached grains.
        max_size: usize,
        /// TTL of a newly cached entry.
        initial_ttl: Duration,
        /// Upper bound of the TTL.
        max_ttl: Duration,
        /// Factor applied to the TTL whenever an entry is confirmed.
        ttl_extension_factor: f64,
        /// Pause between two maintainer scans.
        maintenance_interval: Duration,
    },
    /// Least-recently-used cache with bounded entry age.
    Lru {
        /// Maximum number of cached grains.
        max_size: usize,
        /// Entries older than this are dropped on lookup.
        max_age: Duration,
    },
}

impl CacheConfig {
    /// LRU cache of `max_size` entries with the default maximum age.
    pub fn lru(max_size: usize) -> Self {
        Self::Lru {
            max_size,
            max_age: DEFAULT_MAX_TTL,
        }
    }

    /// Maximum number of cached grains.
    pub fn max_size(&self) -> usize {
        match self {
            Self::Adaptive { max_size, .. } | Self::Lru { max_size, .. } => *max_size,
        }
    }

    fn validate(&self) -> Result<(), DirectoryConfigError> {
        if self.max_size() == 0 {
            return Err(DirectoryConfigError::ZeroCacheSize);
        }
        if let Self::Adaptive {
            initial_ttl,
            max_ttl,
            ttl_extension_factor,
            ..
        } = self
        {
            if initial_ttl > max_ttl {
                return Err(DirectoryConfigError::InitialTtlAboveMax {
                    initial_ttl: *initial_ttl,
                    max_ttl: *max_ttl,
                });
            }
            if ttl_extension_factor.is_nan() || *ttl_extension_factor < 1.0 {
                return Err(DirectoryConfigError::InvalidTtlExtensionFactor(
                    *ttl_extension_factor,
                ));
            }
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::Adaptive {
            max_size: DEFAULT_CACHE_SIZE,
            initial_ttl: DEFAULT_INITIAL_TTL,
            max_ttl: DEFAULT_MAX_TTL,
            ttl_extension_factor: DEFAULT_TTL_EXTENSION_FACTOR,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
        }
    }
}

/// Per-silo directory settings.
///
/// The lazy deregistration delay is a fixed value: it does not adapt to
/// observed latency or membership churn.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryConfig {
    hop_limit: u32,
    retry_delay: Duration,
    lazy_deregistration_delay: Duration,
    handoff_chunk_size: usize,
    replication_factor: usize,
    seed: Option<SiloAddress>,
    cache: CacheConfig,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            hop_limit: DEFAULT_HOP_LIMIT,
            retry_delay: DEFAULT_RETRY_DELAY,
            lazy_deregistration_delay: DEFAULT_LAZY_DEREGISTRATION_DELAY,
            handoff_chunk_size: DEFAULT_HANDOFF_CHUNK_SIZE,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            seed: None,
            cache: CacheConfig::default(),
        }
    }
}

impl DirectoryConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> DirectoryConfigBuilder {
        DirectoryConfigBuilder {
            config: Self::default(),
        }
    }

    /// Maximum number of times a request is forwarded.
    pub fn hop_limit(&self) -> u32 {
        self.hop_limit
    }

    /// Pause before re-resolving the owner of a forwarded request.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Grace period before an authoritative entry can be removed as a
    /// nonexistent activation.
    pub fn lazy_deregistration_delay(&self) -> Duration {
        self.lazy_deregistration_delay
    }

    /// Number of grains per handoff message.
    pub fn handoff_chunk_size(&self) -> usize {
        self.handoff_chunk_size
    }

    /// Number of successors holding a replica of this silo's partition.
    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Silo owning the membership table grain.
    pub fn seed(&self) -> Option<&SiloAddress> {
        self.seed.as_ref()
    }

    /// Cache strategy.
    pub fn cache(&self) -> &CacheConfig {
        &self.cache
    }
}

/// Builder for [`DirectoryConfig`].
#[derive(Debug, Clone)]
pub struct DirectoryConfigBuilder {
    config: DirectoryConfig,
}

impl DirectoryConfigBuilder {
    /// Set the hop limit.
    pub fn hop_limit(mut self, hop_limit: u32) -> Self {
        self.config.hop_limit = hop_limit;
        self
    }

    /// Set the retry delay.
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.config.retry_delay = retry_delay;
        self
    }

    /// Set the lazy deregistration grace period.
    pub fn lazy_deregistration_delay(mut self, delay: Duration) -> Self {
        self.config.lazy_deregistration_delay = delay;
        self
    }

    /// Set the handoff chunk size.
    pub fn handoff_chunk_size(mut self, size: usize) -> Self {
        self.config.handoff_chunk_size = size;
        self
    }

    /// Set the replication factor.
    pub fn replication_factor(mut self, factor: usize) -> Self {
        self.config.replication_factor = factor;
        self
    }

    /// Set the seed silo.
    pub fn seed(mut self, seed: SiloAddress) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Set the cache strategy.
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is zero or the cache settings are
    /// inconsistent.
    pub fn build(self) -> Result<DirectoryConfig, DirectoryConfigError> {
        let config = self.config;
        if config.hop_limit == 0 {
            return Err(DirectoryConfigError::ZeroHopLimit);
        }
        if config.handoff_chunk_size == 0 {
            return Err(DirectoryConfigError::ZeroHandoffChunkSize);
        }
        if config.replication_factor == 0 {
            return Err(DirectoryConfigError::ZeroReplicationFactor);
        }
        config.cache.validate()?;
        Ok(config)
    }
}

/// Errors from building a [`DirectoryConfig`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DirectoryConfigError {
    /// The hop limit must allow at least one forward.
    #[error("hop limit must be at least 1")]
    ZeroHopLimit,
    /// Handoff chunks must carry at least one grain.
    #[error("handoff chunk size must be at least 1")]
    ZeroHandoffChunkSize,
    /// At least one successor must hold a replica.
    #[error("replication factor must be at least 1")]
    ZeroReplicationFactor,
    /// The cache must hold at least one entry.
    #[error("cache size must be at least 1")]
    ZeroCacheSize,
    /// The adaptive cache would start above its own cap.
    #[error("initial cache TTL {initial_ttl:?} exceeds maximum TTL {max_ttl:?}")]
    InitialTtlAboveMax {
        /// Configured initial TTL.
        initial_ttl: Duration,
        /// Configured maximum TTL.
        max_ttl: Duration,
    },
    /// The TTL would shrink on refresh.
    #[error("TTL extension factor must be at least 1.0, got {0}")]
    InvalidTtlExtensionFactor(f64),
}
