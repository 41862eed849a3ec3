//! Non-authoritative cache of remote directory entries.
//!
//! A silo caches the activation lists it learned from other owners so that
//! most lookups for grains it does not own can be answered without a
//! network hop. The cache is never ground truth: the owner's partition is.
//!
//! Two strategies implement [`DirectoryCache`]:
//!
//! - [`LruDirectoryCache`]: fixed capacity, bounded age, no refresh.
//! - [`AdaptiveDirectoryCache`]: per-entry TTL that grows every time the
//!   [`CacheMaintainer`] confirms the entry with its owner.

mod adaptive;
mod lru;
mod maintainer;

use std::fmt;
use std::rc::Rc;

pub use adaptive::AdaptiveDirectoryCache;
pub use lru::LruDirectoryCache;
pub use maintainer::CacheMaintainer;

use crate::config::CacheConfig;
use crate::provider::TimeProvider;
use crate::types::{ActivationAddress, GrainId, VersionTag};

/// A cached activation list and the version it was cached at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedActivations {
    /// Activations known for the grain.
    pub activations: Vec<ActivationAddress>,
    /// Version of the owner's entry when it was cached.
    pub version: VersionTag,
}

/// Per-silo cache of grain directory entries owned by other silos.
///
/// Methods take `&self`: implementations keep their state behind a
/// `RefCell`, and no borrow outlives a call.
pub trait DirectoryCache: fmt::Debug {
    /// Insert or replace the entry for a grain.
    fn add_or_update(&self, grain: GrainId, activations: Vec<ActivationAddress>, version: VersionTag);

    /// Remove the entry for a grain. Returns whether it was present.
    fn remove(&self, grain: &GrainId) -> bool;

    /// Remove every entry.
    fn clear(&self);

    /// The cached entry for a grain.
    fn lookup(&self, grain: &GrainId) -> Option<CachedActivations>;

    /// Snapshot of all entries.
    fn entries(&self) -> Vec<(GrainId, CachedActivations)>;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Whether the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caches built from a [`CacheConfig`].
///
/// The adaptive cache is also returned on its own so the maintainer can
/// reach its refresh methods.
pub(crate) fn build_cache<T: TimeProvider + 'static>(
    config: &CacheConfig,
    time: T,
) -> (Rc<dyn DirectoryCache>, Option<Rc<AdaptiveDirectoryCache<T>>>) {
    match config {
        CacheConfig::Lru { max_size, max_age } => {
            let cache: Rc<dyn DirectoryCache> =
                Rc::new(LruDirectoryCache::new(time, *max_size, *max_age));
            (cache, None)
        }
        CacheConfig::Adaptive {
            max_size,
            initial_ttl,
            max_ttl,
            ttl_extension_factor,
            ..
        } => {
            let adaptive = Rc::new(AdaptiveDirectoryCache::new(
                time,
                *max_size,
                *initial_ttl,
                *max_ttl,
                *ttl_extension_factor,
            ));
            let cache: Rc<dyn DirectoryCache> = adaptive.clone();
            (cache, Some(adaptive))
        }
    }
}
