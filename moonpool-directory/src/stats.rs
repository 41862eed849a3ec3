//! Directory counters.

use std::cell::Cell;
use std::fmt;

/// Operation counters of one silo's directory.
///
/// Plain `Cell`s: the directory is single-threaded and the counters are
/// only read for diagnostics.
#[derive(Debug, Default)]
pub struct DirectoryStatistics {
    local_registrations: Cell<u64>,
    remote_registrations: Cell<u64>,
    local_unregistrations: Cell<u64>,
    remote_unregistrations: Cell<u64>,
    full_lookups: Cell<u64>,
    local_lookups: Cell<u64>,
    local_hits: Cell<u64>,
    cache_lookups: Cell<u64>,
    cache_hits: Cell<u64>,
    cache_validations_sent: Cell<u64>,
    cache_validations_received: Cell<u64>,
    forwards: Cell<u64>,
}

fn bump(counter: &Cell<u64>, by: u64) {
    counter.set(counter.get().saturating_add(by));
}

/// A point-in-time copy of [`DirectoryStatistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    /// Registrations applied to the local partition.
    pub local_registrations: u64,
    /// Registrations forwarded to another owner.
    pub remote_registrations: u64,
    /// Unregistrations applied to the local partition.
    pub local_unregistrations: u64,
    /// Unregistrations forwarded to another owner.
    pub remote_unregistrations: u64,
    /// Full (possibly forwarded) lookups.
    pub full_lookups: u64,
    /// Non-forwarding lookups.
    pub local_lookups: u64,
    /// Non-forwarding lookups answered by the local partition.
    pub local_hits: u64,
    /// Non-forwarding lookups that consulted the cache.
    pub cache_lookups: u64,
    /// Non-forwarding lookups answered by the cache.
    pub cache_hits: u64,
    /// Cache validation entries sent to owners.
    pub cache_validations_sent: u64,
    /// Cache validation entries answered for other silos.
    pub cache_validations_received: u64,
    /// Requests sent to another silo.
    pub forwards: u64,
}

impl DirectoryStatistics {
    pub(crate) fn record_registration(&self, local: bool) {
        if local {
            bump(&self.local_registrations, 1);
        } else {
            bump(&self.remote_registrations, 1);
        }
    }

    pub(crate) fn record_unregistrations(&self, local: bool, count: u64) {
        if local {
            bump(&self.local_unregistrations, count);
        } else {
            bump(&self.remote_unregistrations, count);
        }
    }

    pub(crate) fn record_full_lookup(&self) {
        bump(&self.full_lookups, 1);
    }

    pub(crate) fn record_local_lookup(&self) {
        bump(&self.local_lookups, 1);
    }

    pub(crate) fn record_local_hit(&self) {
        bump(&self.local_hits, 1);
    }

    pub(crate) fn record_cache_lookup(&self, hit: bool) {
        bump(&self.cache_lookups, 1);
        if hit {
            bump(&self.cache_hits, 1);
        }
    }

    pub(crate) fn record_validations_sent(&self, count: u64) {
        bump(&self.cache_validations_sent, count);
    }

    pub(crate) fn record_validations_received(&self, count: u64) {
        bump(&self.cache_validations_received, count);
    }

    pub(crate) fn record_forward(&self) {
        bump(&self.forwards, 1);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            local_registrations: self.local_registrations.get(),
            remote_registrations: self.remote_registrations.get(),
            local_unregistrations: self.local_unregistrations.get(),
            remote_unregistrations: self.remote_unregistrations.get(),
            full_lookups: self.full_lookups.get(),
            local_lookups: self.local_lookups.get(),
            local_hits: self.local_hits.get(),
            cache_lookups: self.cache_lookups.get(),
            cache_hits: self.cache_hits.get(),
            cache_validations_sent: self.cache_validations_sent.get(),
            cache_validations_received: self.cache_validations_received.get(),
            forwards: self.forwards.get(),
        }
    }
}

impl fmt::Display for DirectoryStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.snapshot();
        let hit_ratio = if s.cache_lookups == 0 {
            0.0
        } else {
            s.cache_hits as f64 / s.cache_lookups as f64
        };
        write!(
            f,
            "registrations local={} remote={}, unregistrations local={} remote={}, \
             lookups full={} local={} local_hits={}, cache lookups={} hits={} ratio={:.2}, \
             validations sent={} received={}, forwards={}",
            s.local_registrations,
            s.remote_registrations,
            s.local_unregistrations,
            s.remote_unregistrations,
            s.full_lookups,
            s.local_lookups,
            s.local_hits,
            s.cache_lookups,
            s.cache_hits,
            hit_ratio,
            s.cache_validations_sent,
            s.cache_validations_received,
            s.forwards,
        )
    }
}
