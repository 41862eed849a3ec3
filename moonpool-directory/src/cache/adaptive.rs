//! Cache whose entry lifetime adapts to how often entries are used.
//!
//! Every entry starts with `initial_ttl`. When the maintainer finds an
//! expired entry that was accessed since the previous scan, it validates the
//! entry with the owner; if the owner reports it unchanged the TTL is
//! multiplied by the extension factor, up to `max_ttl`. Expired entries
//! nobody looked at are dropped without a round trip.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use super::{CachedActivations, DirectoryCache};
use crate::provider::TimeProvider;
use crate::types::{ActivationAddress, GrainId, VersionTag};

#[derive(Debug, Clone)]
struct AdaptiveEntry {
    value: CachedActivations,
    refreshed_at: Duration,
    ttl: Duration,
    accesses: u64,
}

impl AdaptiveEntry {
    fn is_expired(&self, now: Duration) -> bool {
        now.saturating_sub(self.refreshed_at) >= self.ttl
    }
}

/// Adaptive TTL directory cache.
///
/// # Orleans Reference
///
/// Corresponds to Orleans' `AdaptiveGrainDirectoryCache`.
pub struct AdaptiveDirectoryCache<T: TimeProvider> {
    time: T,
    max_size: usize,
    initial_ttl: Duration,
    max_ttl: Duration,
    ttl_extension_factor: f64,
    entries: RefCell<HashMap<GrainId, AdaptiveEntry>>,
}

impl<T: TimeProvider> AdaptiveDirectoryCache<T> {
    /// Create an empty cache.
    pub fn new(
        time: T,
        max_size: usize,
        initial_ttl: Duration,
        max_ttl: Duration,
        ttl_extension_factor: f64,
    ) -> Self {
        Self {
            time,
            max_size,
            initial_ttl,
            max_ttl,
            ttl_extension_factor,
            entries: RefCell::new(HashMap::new()),
        }
    }

    /// Current TTL of an entry.
    pub fn ttl_of(&self, grain: &GrainId) -> Option<Duration> {
        self.entries.borrow().get(grain).map(|entry| entry.ttl)
    }

    /// Scan for expired entries.
    ///
    /// Expired entries with no access since the last scan are evicted.
    /// Expired entries that were accessed get their access counter reset and
    /// are returned: they must be validated with their owner.
    pub fn sweep(&self) -> Vec<(GrainId, CachedActivations)> {
        let now = self.time.now();
        let mut entries = self.entries.borrow_mut();
        let mut to_refresh = Vec::new();
        entries.retain(|grain, entry| {
            if !entry.is_expired(now) {
                return true;
            }
            if entry.accesses == 0 {
                tracing::trace!(grain = %grain, "evicting expired unaccessed cache entry");
                return false;
            }
            entry.accesses = 0;
            to_refresh.push((grain.clone(), entry.value.clone()));
            true
        });
        to_refresh
    }

    /// The owner confirmed the entry is unchanged: restart its timer with a
    /// longer TTL.
    pub fn mark_fresh(&self, grain: &GrainId) -> bool {
        let now = self.time.now();
        let mut entries = self.entries.borrow_mut();
        let Some(entry) = entries.get_mut(grain) else {
            return false;
        };
        entry.refreshed_at = now;
        entry.ttl = entry
            .ttl
            .mul_f64(self.ttl_extension_factor)
            .min(self.max_ttl);
        true
    }

    fn evict_one(entries: &mut HashMap<GrainId, AdaptiveEntry>) {
        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| entry.refreshed_at)
            .map(|(grain, _)| grain.clone());
        if let Some(grain) = oldest {
            entries.remove(&grain);
            tracing::trace!(grain = %grain, "cache full, evicted least recently refreshed entry");
        }
    }
}

impl<T: TimeProvider> fmt::Debug for AdaptiveDirectoryCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveDirectoryCache")
            .field("max_size", &self.max_size)
            .field("initial_ttl", &self.initial_ttl)
            .field("max_ttl", &self.max_ttl)
            .field("ttl_extension_factor", &self.ttl_extension_factor)
            .field("len", &self.entries.borrow().len())
            .finish()
    }
}

impl<T: TimeProvider> DirectoryCache for AdaptiveDirectoryCache<T> {
    fn add_or_update(&self, grain: GrainId, activations: Vec<ActivationAddress>, version: VersionTag) {
        let now = self.time.now();
        let mut entries = self.entries.borrow_mut();
        if !entries.contains_key(&grain) && entries.len() >= self.max_size {
            Self::evict_one(&mut entries);
        }
        entries.insert(
            grain,
            AdaptiveEntry {
                value: CachedActivations {
                    activations,
                    version,
                },
                refreshed_at: now,
                ttl: self.initial_ttl,
                accesses: 0,
            },
        );
    }

    fn remove(&self, grain: &GrainId) -> bool {
        self.entries.borrow_mut().remove(grain).is_some()
    }

    fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    /// Expired entries are still returned; only the maintainer retires them.
    fn lookup(&self, grain: &GrainId) -> Option<CachedActivations> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries.get_mut(grain)?;
        entry.accesses += 1;
        Some(entry.value.clone())
    }

    fn entries(&self) -> Vec<(GrainId, CachedActivations)> {
        self.entries
            .borrow()
            .iter()
            .map(|(grain, entry)| (grain.clone(), entry.value.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}
