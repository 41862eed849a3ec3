//! Background refresh of the adaptive cache.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use futures::future::join_all;

use super::{AdaptiveDirectoryCache, DirectoryCache};
use crate::provider::{Providers, TimeProvider};
use crate::remote::CacheRefresh;
use crate::service::WeakDirectory;
use crate::silo::SiloAddress;
use crate::types::{GrainId, VersionTag};

/// Periodically validates expired adaptive cache entries with their owners.
///
/// Each pass:
///
/// 1. sweeps the cache: expired entries nobody read are evicted, expired
///    entries that were read are collected;
/// 2. drops collected entries the local silo now owns (or that have no
///    owner);
/// 3. batches the rest by owner and sends one `lookup_many` per owner;
/// 4. applies the answers: unchanged entries get a longer TTL, changed
///    entries are replaced, missing entries are removed.
///
/// # Orleans Reference
///
/// Corresponds to Orleans' `AdaptiveDirectoryCacheMaintainer`.
pub struct CacheMaintainer<P: Providers> {
    directory: WeakDirectory<P>,
    cache: Rc<AdaptiveDirectoryCache<P::Time>>,
    interval: Duration,
}

impl<P: Providers> CacheMaintainer<P> {
    pub(crate) fn new(
        directory: WeakDirectory<P>,
        cache: Rc<AdaptiveDirectoryCache<P::Time>>,
        interval: Duration,
    ) -> Self {
        Self {
            directory,
            cache,
            interval,
        }
    }

    /// Run passes every `interval` until the directory stops or is dropped.
    pub(crate) async fn run(self, time: P::Time) {
        loop {
            if let Err(e) = time.sleep(self.interval).await {
                tracing::debug!(error = %e, "cache maintainer timer stopped");
                return;
            }
            match self.directory.upgrade() {
                Some(directory) if directory.is_running() => {}
                _ => return,
            }
            self.run_once().await;
        }
    }

    /// One maintenance pass.
    pub async fn run_once(&self) {
        let Some(directory) = self.directory.upgrade() else {
            return;
        };
        let local = directory.local().clone();

        let expired = self.cache.sweep();
        if expired.is_empty() {
            return;
        }

        let mut batches: HashMap<SiloAddress, Vec<(GrainId, VersionTag)>> = HashMap::new();
        for (grain, cached) in expired {
            match directory.primary_for_grain(&grain) {
                Ok(Some(owner)) if owner != local => {
                    batches.entry(owner).or_default().push((grain, cached.version));
                }
                _ => {
                    self.cache.remove(&grain);
                }
            }
        }

        let requests = batches.into_iter().map(|(owner, batch)| {
            let directory = directory.clone();
            async move {
                directory.stats().record_validations_sent(batch.len() as u64);
                let result = match directory.remote(&owner) {
                    Ok(remote) => remote.lookup_many(batch).await,
                    Err(e) => Err(e),
                };
                (owner, result)
            }
        });

        for (owner, result) in join_all(requests).await {
            match result {
                Ok(answers) => self.apply(&directory, answers),
                Err(e) => {
                    tracing::warn!(owner = %owner, error = %e, "cache validation failed");
                }
            }
        }
        tracing::trace!(silo = %local, entries = self.cache.len(), "cache maintenance pass done");
    }

    fn apply(
        &self,
        directory: &crate::service::LocalDirectory<P>,
        answers: Vec<(GrainId, CacheRefresh)>,
    ) {
        for (grain, refresh) in answers {
            match refresh {
                CacheRefresh::Unchanged(_) => {
                    self.cache.mark_fresh(&grain);
                }
                CacheRefresh::Changed {
                    activations,
                    version,
                } => {
                    let viable = directory.filter_viable(activations);
                    self.cache.add_or_update(grain, viable, version);
                }
                CacheRefresh::Missing => {
                    self.cache.remove(&grain);
                }
            }
        }
    }
}

impl<P: Providers> fmt::Debug for CacheMaintainer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMaintainer")
            .field("interval", &self.interval)
            .field("cache", &self.cache)
            .finish()
    }
}
