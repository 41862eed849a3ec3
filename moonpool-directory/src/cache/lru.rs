//! Fixed-capacity, age-bounded cache.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use super::{CachedActivations, DirectoryCache};
use crate::provider::TimeProvider;
use crate::types::{ActivationAddress, GrainId, VersionTag};

#[derive(Debug)]
struct LruEntry {
    value: CachedActivations,
    inserted_at: Duration,
    last_used: u64,
}

#[derive(Debug, Default)]
struct LruState {
    entries: HashMap<GrainId, LruEntry>,
    /// Use tick -> grain, oldest first.
    recency: BTreeMap<u64, GrainId>,
    tick: u64,
}

impl LruState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, grain: &GrainId) -> Option<LruEntry> {
        let entry = self.entries.remove(grain)?;
        self.recency.remove(&entry.last_used);
        Some(entry)
    }
}

/// Least-recently-used directory cache.
///
/// Entries older than `max_age` are dropped when looked up. When the cache
/// is full, inserting evicts the least recently used entry. A miss is just a
/// miss: nothing is refreshed in the background.
pub struct LruDirectoryCache<T: TimeProvider> {
    time: T,
    max_size: usize,
    max_age: Duration,
    state: RefCell<LruState>,
}

impl<T: TimeProvider> LruDirectoryCache<T> {
    /// Create an empty cache.
    pub fn new(time: T, max_size: usize, max_age: Duration) -> Self {
        Self {
            time,
            max_size,
            max_age,
            state: RefCell::new(LruState::default()),
        }
    }
}

impl<T: TimeProvider> fmt::Debug for LruDirectoryCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruDirectoryCache")
            .field("max_size", &self.max_size)
            .field("max_age", &self.max_age)
            .field("len", &self.state.borrow().entries.len())
            .finish()
    }
}

impl<T: TimeProvider> DirectoryCache for LruDirectoryCache<T> {
    fn add_or_update(&self, grain: GrainId, activations: Vec<ActivationAddress>, version: VersionTag) {
        let now = self.time.now();
        let mut state = self.state.borrow_mut();
        state.remove(&grain);

        while state.entries.len() >= self.max_size {
            let Some((_, oldest)) = state.recency.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
            tracing::trace!(grain = %oldest, "evicted least recently used cache entry");
        }

        let tick = state.next_tick();
        state.recency.insert(tick, grain.clone());
        state.entries.insert(
            grain,
            LruEntry {
                value: CachedActivations {
                    activations,
                    version,
                },
                inserted_at: now,
                last_used: tick,
            },
        );
    }

    fn remove(&self, grain: &GrainId) -> bool {
        self.state.borrow_mut().remove(grain).is_some()
    }

    fn clear(&self) {
        let mut state = self.state.borrow_mut();
        state.entries.clear();
        state.recency.clear();
    }

    fn lookup(&self, grain: &GrainId) -> Option<CachedActivations> {
        let now = self.time.now();
        let mut state = self.state.borrow_mut();
        let inserted_at = state.entries.get(grain)?.inserted_at;
        if now.saturating_sub(inserted_at) > self.max_age {
            state.remove(grain);
            return None;
        }

        let tick = state.next_tick();
        let entry = state.entries.get_mut(grain)?;
        let previous = std::mem::replace(&mut entry.last_used, tick);
        let value = entry.value.clone();
        state.recency.remove(&previous);
        state.recency.insert(tick, grain.clone());
        Some(value)
    }

    fn entries(&self) -> Vec<(GrainId, CachedActivations)> {
        self.state
            .borrow()
            .entries
            .iter()
            .map(|(grain, entry)| (grain.clone(), entry.value.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.state.borrow().entries.len()
    }
}
