//! The per-silo directory service.
//!
//! [`LocalDirectory`] is the entry point the rest of the runtime talks to.
//! It decides which silo owns a grain, answers for the grains it owns from
//! its [`DirectoryPartition`], forwards everything else, caches what it
//! learns, and reacts to membership changes.
//!
//! # Forwarding
//!
//! ```text
//! caller ──► A (hop 0) ──► B (hop 1) ──► C (hop 2) ... until hop_limit
//!            owner? no     owner? no, wait retry_delay,
//!                          re-resolve, forward again
//! ```
//!
//! A directory receiving a forwarded request it does not own waits
//! `retry_delay` for its ring view to settle, then either handles the
//! request or forwards it again. Requests that still have not reached an
//! owner at `hop_limit` fail with [`DirectoryError::HopLimitExceeded`].
//!
//! # Concurrency
//!
//! Everything runs on one thread. Ring, partition and cache sit behind
//! `RefCell`s that are only borrowed between two `.await` points, so every
//! partition mutation is a serialized critical section.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use futures::future::try_join_all;
use tokio::task::JoinHandle;

use crate::cache::{build_cache, AdaptiveDirectoryCache, CacheMaintainer, DirectoryCache};
use crate::catalog::ActivationCatalog;
use crate::config::{CacheConfig, DirectoryConfig};
use crate::error::DirectoryError;
use crate::handoff::{HandoffAction, HandoffChunk, HandoffManager};
use crate::membership::{MembershipView, SiloStatus, SiloStatusListener};
use crate::partition::{DirectoryPartition, GrainInfo, VersionSource};
use crate::provider::{Providers, RandomProvider, TaskProvider, TimeProvider};
use crate::remote::{CacheRefresh, DirectoryTransport, RemoteDirectoryEndpoint, RemoteGrainDirectory};
use crate::ring::DirectoryRing;
use crate::silo::SiloAddress;
use crate::stats::DirectoryStatistics;
use crate::types::{
    ActivationAddress, AddressAndTag, GrainId, LookupResult, RegistrationStatus,
    UnregistrationCause, VersionTag,
};

/// Lifecycle of a [`LocalDirectory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryStatus {
    /// Built, not serving yet.
    Created,
    /// Owns its ring range.
    Running,
    /// Handing off its partition. Grains are routed past the local silo.
    Stopping,
    /// Stopped.
    Stopped,
}

impl fmt::Display for DirectoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

struct DirectoryCore<P: Providers> {
    local: SiloAddress,
    config: DirectoryConfig,
    providers: P,
    membership: Rc<dyn MembershipView>,
    transport: Rc<dyn DirectoryTransport>,
    status: Cell<DirectoryStatus>,
    ring: RefCell<DirectoryRing>,
    partition: RefCell<DirectoryPartition>,
    cache: Rc<dyn DirectoryCache>,
    adaptive_cache: Option<Rc<AdaptiveDirectoryCache<P::Time>>>,
    handoff: HandoffManager,
    stats: DirectoryStatistics,
    catalog: RefCell<Option<Rc<dyn ActivationCatalog>>>,
    listener: RefCell<Option<Rc<dyn SiloStatusListener>>>,
    maintainer: RefCell<Option<JoinHandle<()>>>,
}

/// The grain directory of one silo.
///
/// Cheap to clone: clones share the same state.
///
/// # Usage
///
/// ```rust,ignore
/// let directory = LocalDirectory::new(silo, config, providers, membership, transport.clone());
/// transport.attach(silo.clone(), directory.endpoint());
/// directory.start();
///
/// let winner = directory.register(address, true).await?;
/// let found = directory.lookup(&grain).await?;
/// ```
///
/// # Orleans Reference
///
/// Corresponds to Orleans' `LocalGrainDirectory`.
pub struct LocalDirectory<P: Providers> {
    core: Rc<DirectoryCore<P>>,
}

impl<P: Providers> Clone for LocalDirectory<P> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

/// Non-owning handle to a [`LocalDirectory`], held by its endpoint, its
/// membership listener and its cache maintainer.
pub(crate) struct WeakDirectory<P: Providers>(Weak<DirectoryCore<P>>);

impl<P: Providers> WeakDirectory<P> {
    pub(crate) fn upgrade(&self) -> Option<LocalDirectory<P>> {
        self.0.upgrade().map(|core| LocalDirectory { core })
    }
}

impl<P: Providers> Clone for WeakDirectory<P> {
    fn clone(&self) -> Self {
        Self(Weak::clone(&self.0))
    }
}

struct MembershipListener<P: Providers> {
    directory: WeakDirectory<P>,
}

impl<P: Providers> SiloStatusListener for MembershipListener<P> {
    fn silo_status_changed(&self, silo: &SiloAddress, status: SiloStatus) {
        if let Some(directory) = self.directory.upgrade() {
            directory.silo_status_changed(silo, status);
        }
    }
}

impl<P: Providers> LocalDirectory<P> {
    /// Build the directory of `local`.
    ///
    /// The directory does not own anything until [`start`](Self::start) is
    /// called.
    pub fn new(
        local: SiloAddress,
        config: DirectoryConfig,
        providers: P,
        membership: Rc<dyn MembershipView>,
        transport: Rc<dyn DirectoryTransport>,
    ) -> Self {
        let versions = VersionSource::new(u64::from(providers.random().random::<u32>()));
        let partition = DirectoryPartition::new(
            Rc::clone(&membership),
            versions,
            config.lazy_deregistration_delay(),
        );
        let handoff = HandoffManager::new(
            local.clone(),
            config.replication_factor(),
            config.handoff_chunk_size(),
            partition.empty_like(),
        );
        let (cache, adaptive_cache) = build_cache(config.cache(), providers.time().clone());
        let mut ring = DirectoryRing::new(local.clone());
        ring.add(local.clone());

        Self {
            core: Rc::new(DirectoryCore {
                local,
                config,
                providers,
                membership,
                transport,
                status: Cell::new(DirectoryStatus::Created),
                ring: RefCell::new(ring),
                partition: RefCell::new(partition),
                cache,
                adaptive_cache,
                handoff,
                stats: DirectoryStatistics::default(),
                catalog: RefCell::new(None),
                listener: RefCell::new(None),
                maintainer: RefCell::new(None),
            }),
        }
    }

    /// Install the activation catalog hook.
    pub fn set_catalog(&self, catalog: Rc<dyn ActivationCatalog>) {
        *self.core.catalog.borrow_mut() = Some(catalog);
    }

    /// The endpoint other silos call, to attach to a transport.
    pub fn endpoint(&self) -> Rc<dyn RemoteGrainDirectory> {
        Rc::new(RemoteDirectoryEndpoint::new(
            self.core.local.clone(),
            self.downgrade(),
        ))
    }

    pub(crate) fn downgrade(&self) -> WeakDirectory<P> {
        WeakDirectory(Rc::downgrade(&self.core))
    }

    /// The local silo.
    pub fn local(&self) -> &SiloAddress {
        &self.core.local
    }

    /// The configuration.
    pub fn config(&self) -> &DirectoryConfig {
        &self.core.config
    }

    /// Lifecycle status.
    pub fn status(&self) -> DirectoryStatus {
        self.core.status.get()
    }

    /// Whether the directory owns its ring range.
    pub fn is_running(&self) -> bool {
        self.status() == DirectoryStatus::Running
    }

    /// Operation counters.
    pub fn stats(&self) -> &DirectoryStatistics {
        &self.core.stats
    }

    /// The handoff manager and the replicas it holds.
    pub fn handoff(&self) -> &HandoffManager {
        &self.core.handoff
    }

    /// The cache of entries owned by other silos.
    pub fn cache(&self) -> Rc<dyn DirectoryCache> {
        Rc::clone(&self.core.cache)
    }

    /// The adaptive cache, when configured.
    pub fn adaptive_cache(&self) -> Option<Rc<AdaptiveDirectoryCache<P::Time>>> {
        self.core.adaptive_cache.clone()
    }

    /// Copy of the local partition.
    pub fn partition_snapshot(&self) -> HashMap<GrainId, GrainInfo> {
        self.core.partition.borrow().items()
    }

    // Ring queries

    /// Silos on the ring, in ring order.
    pub fn ring_members(&self) -> Vec<SiloAddress> {
        self.core.ring.borrow().members()
    }

    /// Whether `silo` is on the local ring.
    pub fn is_silo_in_cluster(&self, silo: &SiloAddress) -> bool {
        self.core.ring.borrow().contains(silo)
    }

    /// Up to `count` predecessors of `silo`, nearest first.
    pub fn find_predecessors(&self, silo: &SiloAddress, count: usize) -> Option<Vec<SiloAddress>> {
        self.core.ring.borrow().predecessors(silo, count)
    }

    /// Up to `count` successors of `silo`, nearest first.
    pub fn find_successors(&self, silo: &SiloAddress, count: usize) -> Option<Vec<SiloAddress>> {
        self.core.ring.borrow().successors(silo, count)
    }

    /// Size of the ring range between the local silo and its successor.
    pub fn distance_to_successor(&self) -> u64 {
        self.core.ring.borrow().distance_to_successor()
    }

    /// Human-readable ring status.
    pub fn ring_status(&self) -> String {
        self.core.ring.borrow().to_string()
    }

    /// The silo this directory believes owns `grain`.
    ///
    /// While the local directory is not running, the local silo is skipped.
    /// Returns `Ok(None)` if no other silo is known.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::MissingSeed`] for the membership table grain when
    /// no seed is configured.
    pub fn primary_for_grain(&self, grain: &GrainId) -> Result<Option<SiloAddress>, DirectoryError> {
        self.resolve_owner(grain, true)
    }

    fn resolve_owner(
        &self,
        grain: &GrainId,
        exclude_if_stopping: bool,
    ) -> Result<Option<SiloAddress>, DirectoryError> {
        if grain.is_membership_table() {
            return match self.core.config.seed() {
                Some(seed) => Ok(Some(seed.clone())),
                None => Err(DirectoryError::MissingSeed {
                    grain: grain.clone(),
                }),
            };
        }
        if grain.is_system_target() {
            return Ok(Some(self.core.local.clone()));
        }

        let exclude_local = exclude_if_stopping && !self.is_running();
        let ring = self.core.ring.borrow();
        if ring.is_empty() {
            return Ok((!exclude_local).then(|| self.core.local.clone()));
        }
        Ok(ring.owner(grain.uniform_hash(), exclude_local))
    }

    fn require_owner(&self, grain: &GrainId, exclude_if_stopping: bool) -> Result<SiloAddress, DirectoryError> {
        self.resolve_owner(grain, exclude_if_stopping)?
            .ok_or_else(|| DirectoryError::Stopping {
                grain: grain.clone(),
            })
    }

    /// Where a request for `grain` at `hop_count` must go: `None` to handle
    /// it locally, `Some(owner)` to forward it.
    async fn check_if_should_forward(
        &self,
        grain: &GrainId,
        hop_count: u32,
        exclude_if_stopping: bool,
        operation: &'static str,
    ) -> Result<Option<SiloAddress>, DirectoryError> {
        let owner = self.require_owner(grain, exclude_if_stopping)?;
        if owner == self.core.local {
            return Ok(None);
        }
        if hop_count == 0 {
            return Ok(Some(owner));
        }

        tracing::debug!(
            silo = %self.core.local,
            grain = %grain,
            owner = %owner,
            hop_count,
            operation,
            "received forwarded request for a grain owned elsewhere, waiting before re-resolving"
        );
        self.core
            .providers
            .time()
            .sleep(self.core.config.retry_delay())
            .await?;

        let owner = self.require_owner(grain, exclude_if_stopping)?;
        if owner == self.core.local {
            return Ok(None);
        }
        if hop_count >= self.core.config.hop_limit() {
            tracing::warn!(
                silo = %self.core.local,
                grain = %grain,
                owner = %owner,
                hop_count,
                operation,
                "hop limit reached"
            );
            return Err(DirectoryError::HopLimitExceeded {
                grain: grain.clone(),
                owner,
                hop_count,
            });
        }
        tracing::warn!(
            silo = %self.core.local,
            grain = %grain,
            owner = %owner,
            hop_count,
            operation,
            "re-forwarding request after retry delay"
        );
        Ok(Some(owner))
    }

    pub(crate) fn remote(&self, silo: &SiloAddress) -> Result<Rc<dyn RemoteGrainDirectory>, DirectoryError> {
        self.core.transport.directory(silo)
    }

    fn forward_to(&self, owner: &SiloAddress) -> Result<Rc<dyn RemoteGrainDirectory>, DirectoryError> {
        self.core.stats.record_forward();
        self.remote(owner)
    }

    fn now(&self) -> std::time::Duration {
        self.core.providers.time().now()
    }

    fn is_viable(&self, silo: &SiloAddress) -> bool {
        self.core.membership.is_viable(silo)
    }

    pub(crate) fn filter_viable(&self, activations: Vec<ActivationAddress>) -> Vec<ActivationAddress> {
        activations
            .into_iter()
            .filter(|address| self.is_viable(&address.silo))
            .collect()
    }

    // Registration

    /// Register an activation with the grain's owner.
    ///
    /// For a single-activation grain the result is the activation the
    /// directory holds, which is not `address` if another activation won.
    /// Returns `None` if the hosting silo is no longer viable.
    pub async fn register(
        &self,
        address: ActivationAddress,
        single_activation: bool,
    ) -> Result<Option<AddressAndTag>, DirectoryError> {
        self.register_with_hops(address, single_activation, 0).await
    }

    pub(crate) async fn register_with_hops(
        &self,
        address: ActivationAddress,
        single_activation: bool,
        hop_count: u32,
    ) -> Result<Option<AddressAndTag>, DirectoryError> {
        let forward_to = self
            .check_if_should_forward(&address.grain, hop_count, true, "register")
            .await?;
        let Some(owner) = forward_to else {
            self.core.stats.record_registration(true);
            return Ok(self.register_locally(&address, single_activation));
        };

        self.core.stats.record_registration(false);
        let result = self
            .forward_to(&owner)?
            .register(address.clone(), single_activation, hop_count + 1)
            .await?;
        if hop_count == 0 {
            self.cache_registration(&address, single_activation, result.as_ref());
        }
        Ok(result)
    }

    fn register_locally(
        &self,
        address: &ActivationAddress,
        single_activation: bool,
    ) -> Option<AddressAndTag> {
        let now = self.now();
        let mut partition = self.core.partition.borrow_mut();
        if single_activation {
            partition.add_single_activation(address, RegistrationStatus::ClusterLocal, now)
        } else {
            partition.add_activation(address, now)
        }
    }

    fn cache_registration(
        &self,
        address: &ActivationAddress,
        single_activation: bool,
        result: Option<&AddressAndTag>,
    ) {
        let Some(result) = result else {
            return;
        };
        if result.address != *address || !self.is_viable(&address.silo) {
            return;
        }
        let cache = &self.core.cache;
        if single_activation {
            cache.add_or_update(address.grain.clone(), vec![address.clone()], result.version);
        } else {
            let mut activations = cache
                .lookup(&address.grain)
                .map(|cached| cached.activations)
                .unwrap_or_default();
            if !activations.contains(address) {
                activations.push(address.clone());
            }
            cache.add_or_update(address.grain.clone(), activations, result.version);
        }
    }

    /// Register a batch; one result per address, in order.
    pub(crate) async fn register_many_with_hops(
        &self,
        addresses: Vec<ActivationAddress>,
        single_activation: bool,
        hop_count: u32,
    ) -> Result<Vec<Option<AddressAndTag>>, DirectoryError> {
        try_join_all(
            addresses
                .into_iter()
                .map(|address| self.register_with_hops(address, single_activation, hop_count)),
        )
        .await
    }

    /// Seed the local cache with a placement decided on this silo.
    ///
    /// The entry carries a placeholder version, so the first validation
    /// with the owner replaces it with the owner's view.
    pub fn cache_placement_decision(&self, address: ActivationAddress) {
        match self.resolve_owner(&address.grain, true) {
            Ok(Some(owner)) if owner != self.core.local => {
                self.core
                    .cache
                    .add_or_update(address.grain.clone(), vec![address], VersionTag(0));
            }
            _ => {}
        }
    }

    // Unregistration

    /// Unregister an activation.
    ///
    /// Whether the owner removes the entry depends on `cause`, see
    /// [`UnregistrationCause`].
    pub async fn unregister(
        &self,
        address: ActivationAddress,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        self.unregister_with_hops(address, cause, 0).await
    }

    pub(crate) async fn unregister_with_hops(
        &self,
        address: ActivationAddress,
        cause: UnregistrationCause,
        hop_count: u32,
    ) -> Result<(), DirectoryError> {
        if hop_count == 0 {
            self.invalidate_cache_entry(&address);
        }
        let forward_to = self
            .check_if_should_forward(&address.grain, hop_count, true, "unregister")
            .await?;
        match forward_to {
            None => {
                self.unregister_locally(vec![address], cause);
                Ok(())
            }
            Some(owner) => {
                self.core.stats.record_unregistrations(false, 1);
                self.forward_to(&owner)?
                    .unregister(address, cause, hop_count + 1)
                    .await
            }
        }
    }

    /// Unregister a batch of activations, possibly owned by several silos.
    pub async fn unregister_many(
        &self,
        addresses: Vec<ActivationAddress>,
        cause: UnregistrationCause,
    ) -> Result<(), DirectoryError> {
        self.unregister_many_with_hops(addresses, cause, 0).await
    }

    pub(crate) async fn unregister_many_with_hops(
        &self,
        addresses: Vec<ActivationAddress>,
        cause: UnregistrationCause,
        hop_count: u32,
    ) -> Result<(), DirectoryError> {
        if hop_count == 0 {
            for address in &addresses {
                self.invalidate_cache_entry(address);
            }
        }

        let mut remote = self.split_by_owner(addresses, cause)?;
        if remote.is_empty() {
            return Ok(());
        }

        if hop_count > 0 {
            self.core
                .providers
                .time()
                .sleep(self.core.config.retry_delay())
                .await?;
            remote = self.split_by_owner(remote.into_values().flatten().collect(), cause)?;
            if hop_count >= self.core.config.hop_limit() {
                let first = remote
                    .iter()
                    .find_map(|(owner, batch)| batch.first().map(|address| (owner, address)));
                if let Some((owner, address)) = first {
                    tracing::warn!(
                        silo = %self.core.local,
                        owner = %owner,
                        hop_count,
                        "hop limit reached for batch unregistration"
                    );
                    return Err(DirectoryError::HopLimitExceeded {
                        grain: address.grain.clone(),
                        owner: owner.clone(),
                        hop_count,
                    });
                }
            }
        }

        let mut requests = Vec::with_capacity(remote.len());
        for (owner, batch) in remote {
            self.core
                .stats
                .record_unregistrations(false, batch.len() as u64);
            let target = self.forward_to(&owner)?;
            requests.push(async move { target.unregister_many(batch, cause, hop_count + 1).await });
        }
        try_join_all(requests).await?;
        Ok(())
    }

    /// Apply the locally owned part of a batch; return the rest grouped by
    /// owner.
    fn split_by_owner(
        &self,
        addresses: Vec<ActivationAddress>,
        cause: UnregistrationCause,
    ) -> Result<HashMap<SiloAddress, Vec<ActivationAddress>>, DirectoryError> {
        let mut local = Vec::new();
        let mut remote: HashMap<SiloAddress, Vec<ActivationAddress>> = HashMap::new();
        for address in addresses {
            let owner = self.require_owner(&address.grain, true)?;
            if owner == self.core.local {
                local.push(address);
            } else {
                remote.entry(owner).or_default().push(address);
            }
        }
        self.unregister_locally(local, cause);
        Ok(remote)
    }

    fn unregister_locally(&self, addresses: Vec<ActivationAddress>, cause: UnregistrationCause) {
        if addresses.is_empty() {
            return;
        }
        let now = self.now();
        let count = addresses.len() as u64;
        let mut partition = self.core.partition.borrow_mut();
        for address in addresses {
            partition.remove_activation(&address.grain, address.activation, cause, now);
        }
        self.core.stats.record_unregistrations(true, count);
    }

    /// A message reached a silo that no longer hosts `address`.
    ///
    /// When `origin` is a silo outside this cluster, its directory is told
    /// instead of the local one.
    pub async fn unregister_after_nonexistent_activation(
        &self,
        address: ActivationAddress,
        origin: Option<SiloAddress>,
    ) -> Result<(), DirectoryError> {
        if let Some(origin) = origin {
            let in_cluster = self
                .core
                .membership
                .members()
                .iter()
                .any(|member| member.silo == origin);
            if !in_cluster {
                tracing::debug!(activation = %address, origin = %origin, "routing unregistration to origin cluster");
                return self
                    .remote(&origin)?
                    .unregister(address, UnregistrationCause::NonexistentActivation, 0)
                    .await;
            }
        }
        self.unregister(address, UnregistrationCause::NonexistentActivation)
            .await
    }

    /// Remove a grain and all its activations.
    pub async fn delete_grain(&self, grain: &GrainId) -> Result<(), DirectoryError> {
        self.delete_grain_with_hops(grain.clone(), 0).await
    }

    pub(crate) async fn delete_grain_with_hops(
        &self,
        grain: GrainId,
        hop_count: u32,
    ) -> Result<(), DirectoryError> {
        let forward_to = self
            .check_if_should_forward(&grain, hop_count, true, "delete grain")
            .await?;
        match forward_to {
            None => {
                self.core.partition.borrow_mut().remove_grain(&grain);
                Ok(())
            }
            Some(owner) => {
                if hop_count == 0 {
                    self.core.cache.remove(&grain);
                }
                self.forward_to(&owner)?
                    .delete_grain(grain, hop_count + 1)
                    .await
            }
        }
    }

    // Lookup

    /// Authoritative lookup, forwarded to the owner if needed.
    ///
    /// A forwarded answer with viable activations is cached.
    pub async fn lookup(&self, grain: &GrainId) -> Result<LookupResult, DirectoryError> {
        self.lookup_with_hops(grain.clone(), 0).await
    }

    pub(crate) async fn lookup_with_hops(
        &self,
        grain: GrainId,
        hop_count: u32,
    ) -> Result<LookupResult, DirectoryError> {
        if hop_count == 0 {
            self.core.stats.record_full_lookup();
        }
        let forward_to = self
            .check_if_should_forward(&grain, hop_count, false, "lookup")
            .await?;
        let Some(owner) = forward_to else {
            return Ok(self
                .core
                .partition
                .borrow()
                .lookup(&grain)
                .unwrap_or_else(LookupResult::missing));
        };

        if hop_count == 0 && !self.is_viable(&owner) {
            return Err(DirectoryError::OwnerNotViable { grain, owner });
        }

        let mut result = self
            .forward_to(&owner)?
            .lookup(grain.clone(), hop_count + 1)
            .await?;
        if hop_count == 0 {
            result.activations = self.filter_viable(result.activations);
            if let Some(version) = result.version {
                if !result.activations.is_empty() {
                    self.core
                        .cache
                        .add_or_update(grain, result.activations.clone(), version);
                }
            }
        }
        Ok(result)
    }

    /// Best-effort lookup that never leaves the silo.
    ///
    /// Answers from the local partition for owned grains and from the cache
    /// otherwise. `None` means the caller should fall back to
    /// [`lookup`](Self::lookup).
    pub fn local_lookup(&self, grain: &GrainId) -> Option<Vec<ActivationAddress>> {
        self.core.stats.record_local_lookup();
        let owner = self.resolve_owner(grain, false).ok().flatten()?;

        if owner == self.core.local {
            let result = self.core.partition.borrow().lookup(grain)?;
            self.core.stats.record_local_hit();
            return Some(result.activations);
        }

        let viable = self
            .core
            .cache
            .lookup(grain)
            .map(|cached| self.filter_viable(cached.activations))
            .filter(|activations| !activations.is_empty());
        self.core.stats.record_cache_lookup(viable.is_some());
        viable
    }

    /// Answer cache validation requests from another silo.
    pub(crate) fn lookup_many(&self, grains: Vec<(GrainId, VersionTag)>) -> Vec<(GrainId, CacheRefresh)> {
        self.core
            .stats
            .record_validations_received(grains.len() as u64);
        let partition = self.core.partition.borrow();
        grains
            .into_iter()
            .map(|(grain, cached_version)| {
                let refresh = match partition.version_of(&grain) {
                    None => CacheRefresh::Missing,
                    Some(current) if current == cached_version => CacheRefresh::Unchanged(current),
                    Some(current) => CacheRefresh::Changed {
                        activations: partition
                            .lookup(&grain)
                            .map(|result| result.activations)
                            .unwrap_or_default(),
                        version: current,
                    },
                };
                (grain, refresh)
            })
            .collect()
    }

    /// Drop one activation from the cached entry of its grain.
    pub fn invalidate_cache_entry(&self, address: &ActivationAddress) {
        let cache = &self.core.cache;
        let Some(cached) = cache.lookup(&address.grain) else {
            return;
        };
        let before = cached.activations.len();
        let remaining: Vec<_> = cached
            .activations
            .into_iter()
            .filter(|cached| cached.activation != address.activation)
            .collect();
        if remaining.len() == before {
            return;
        }
        if remaining.is_empty() {
            cache.remove(&address.grain);
        } else {
            cache.add_or_update(address.grain.clone(), remaining, cached.version);
        }
    }

    /// Run one adaptive cache maintenance pass now.
    ///
    /// The background maintainer does the same every maintenance interval.
    /// Does nothing with an LRU cache.
    pub async fn maintain_cache(&self) {
        if let Some(cache) = &self.core.adaptive_cache {
            CacheMaintainer::new(self.downgrade(), Rc::clone(cache), self.maintenance_interval())
                .run_once()
                .await;
        }
    }

    fn maintenance_interval(&self) -> std::time::Duration {
        match self.core.config.cache() {
            CacheConfig::Adaptive {
                maintenance_interval,
                ..
            } => *maintenance_interval,
            CacheConfig::Lru { max_age, .. } => *max_age,
        }
    }

    // Handoff

    pub(crate) fn accept_handoff_partition(&self, chunk: HandoffChunk) {
        let source_on_ring = self.core.ring.borrow().contains(&chunk.source);
        if source_on_ring || !self.is_running() {
            self.core.handoff.accept_handoff_partition(chunk);
            return;
        }

        // The source already left the ring: its range is ours or a
        // neighbour's by now, so keep only what we own.
        tracing::info!(
            silo = %self.core.local,
            source = %chunk.source,
            "handoff from a silo that already left, merging owned entries"
        );
        let owned: HashMap<GrainId, GrainInfo> = chunk
            .entries
            .into_iter()
            .filter_map(|(grain, info)| info.map(|info| (grain, info)))
            .filter(|(grain, _)| {
                matches!(self.resolve_owner(grain, true), Ok(Some(owner)) if owner == self.core.local)
            })
            .collect();
        let duplicates = self.core.partition.borrow_mut().merge_items(owned);
        if !duplicates.is_empty() {
            self.run_handoff_actions(vec![HandoffAction::DeleteActivations {
                activations: duplicates,
            }]);
        }
    }

    pub(crate) fn delete_local_activations(&self, activations: Vec<ActivationAddress>) {
        let catalog = self.core.catalog.borrow().clone();
        match catalog {
            Some(catalog) => catalog.delete_activations(activations),
            None => {
                tracing::debug!(
                    count = activations.len(),
                    "no activation catalog installed, ignoring deletion request"
                );
            }
        }
    }

    fn run_handoff_actions(&self, actions: Vec<HandoffAction>) {
        for action in actions {
            let directory = self.clone();
            self.core
                .providers
                .task()
                .spawn_task("directory_handoff", async move {
                    directory.run_handoff_action(action).await;
                });
        }
    }

    async fn run_handoff_action(&self, action: HandoffAction) {
        match action {
            HandoffAction::RegisterMany {
                target,
                single,
                multi,
                remove_locally,
            } => {
                for (batch, single_activation) in [(single, true), (multi, false)] {
                    if batch.is_empty() {
                        continue;
                    }
                    let result = match self.remote(&target) {
                        Ok(remote) => {
                            remote
                                .register_many(batch.clone(), single_activation, 1)
                                .await
                        }
                        Err(e) => Err(e),
                    };
                    let registered = match result {
                        Ok(registered) => registered,
                        Err(e) => {
                            tracing::warn!(target = %target, error = %e, "handoff registration failed");
                            continue;
                        }
                    };
                    if single_activation {
                        // The target already held a different activation for
                        // these grains; the pushed one lost.
                        let losers: Vec<ActivationAddress> = batch
                            .iter()
                            .zip(&registered)
                            .filter(|(pushed, winner)| {
                                winner
                                    .as_ref()
                                    .is_some_and(|winner| winner.address != **pushed)
                            })
                            .map(|(pushed, _)| pushed.clone())
                            .collect();
                        if !losers.is_empty() {
                            tracing::info!(
                                target = %target,
                                duplicates = losers.len(),
                                "handoff registration lost to existing activations"
                            );
                            self.delete_duplicate_activations(losers).await;
                        }
                    }
                    if remove_locally {
                        let mut partition = self.core.partition.borrow_mut();
                        for address in &batch {
                            partition.remove_grain(&address.grain);
                        }
                        tracing::debug!(target = %target, grains = batch.len(), "handed off grains");
                    }
                }
            }
            HandoffAction::RemoveReplica { holder } => {
                let result = match self.remote(&holder) {
                    Ok(remote) => remote.remove_handoff_partition(self.core.local.clone()).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    tracing::warn!(holder = %holder, error = %e, "failed to remove handoff partition");
                }
            }
            HandoffAction::DeleteActivations { activations } => {
                self.delete_duplicate_activations(activations).await;
            }
        }
    }

    /// Ask each hosting silo to deactivate the given duplicates.
    async fn delete_duplicate_activations(&self, activations: Vec<ActivationAddress>) {
        let mut by_silo: HashMap<SiloAddress, Vec<ActivationAddress>> = HashMap::new();
        for address in activations {
            by_silo.entry(address.silo.clone()).or_default().push(address);
        }
        for (silo, batch) in by_silo {
            if silo == self.core.local {
                self.delete_local_activations(batch);
                continue;
            }
            let result = match self.remote(&silo) {
                Ok(remote) => remote.delete_activations(batch).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(silo = %silo, error = %e, "failed to request duplicate deletion");
            }
        }
    }

    // Membership

    fn silo_status_changed(&self, silo: &SiloAddress, status: SiloStatus) {
        if *silo == self.core.local {
            match status {
                SiloStatus::ShuttingDown if self.is_running() => {
                    let directory = self.clone();
                    self.core
                        .providers
                        .task()
                        .spawn_task("directory_stop", async move {
                            if let Err(e) = directory.stop().await {
                                tracing::error!(error = %e, "directory stop failed");
                            }
                        });
                }
                SiloStatus::Dead => self.stop_without_handoff(),
                _ => {}
            }
            return;
        }

        if status.is_terminating() {
            self.remove_server(silo, status);
        } else if status == SiloStatus::Active {
            self.add_server(silo);
        }
    }

    fn add_server(&self, silo: &SiloAddress) {
        if !self.core.ring.borrow_mut().add(silo.clone()) {
            return;
        }
        tracing::info!(silo = %self.core.local, added = %silo, "silo added to directory ring");

        let actions = {
            let ring = self.core.ring.borrow();
            let mut partition = self.core.partition.borrow_mut();
            self.core.handoff.process_silo_add(silo, &ring, &mut partition, |grain| {
                self.resolve_owner(grain, true).ok().flatten()
            })
        };

        let older_generation = |host: &SiloAddress| host.is_predecessor_of(silo);
        self.adjust_local_directory(&older_generation);
        self.adjust_local_cache(&older_generation);
        self.run_handoff_actions(actions);
    }

    fn remove_server(&self, silo: &SiloAddress, status: SiloStatus) {
        if !self.core.ring.borrow().contains(silo) {
            return;
        }
        let catalog = self.core.catalog.borrow().clone();
        if let Some(catalog) = catalog {
            catalog.silo_removed(silo, status);
        }

        let actions = {
            let ring = self.core.ring.borrow();
            let mut partition = self.core.partition.borrow_mut();
            self.core.handoff.process_silo_remove(silo, &ring, &mut partition)
        };
        self.core.ring.borrow_mut().remove(silo);
        tracing::info!(silo = %self.core.local, removed = %silo, %status, "silo removed from directory ring");

        let gone = |host: &SiloAddress| host == silo || host.is_predecessor_of(silo);
        self.adjust_local_directory(&gone);
        self.adjust_local_cache(&gone);
        self.run_handoff_actions(actions);
    }

    fn adjust_local_directory(&self, hosted_on: &dyn Fn(&SiloAddress) -> bool) {
        let removed = self
            .core
            .partition
            .borrow_mut()
            .remove_activations_on(hosted_on);
        if removed > 0 {
            tracing::debug!(silo = %self.core.local, removed, "dropped activations of departed silos");
        }
    }

    fn adjust_local_cache(&self, hosted_on: &dyn Fn(&SiloAddress) -> bool) {
        let cache = &self.core.cache;
        for (grain, cached) in cache.entries() {
            if matches!(self.resolve_owner(&grain, true), Ok(Some(owner)) if owner == self.core.local) {
                cache.remove(&grain);
                continue;
            }
            let before = cached.activations.len();
            let kept: Vec<_> = cached
                .activations
                .into_iter()
                .filter(|address| !hosted_on(&address.silo))
                .collect();
            if kept.len() == before {
                continue;
            }
            if kept.is_empty() {
                cache.remove(&grain);
            } else {
                cache.add_or_update(grain, kept, cached.version);
            }
        }
    }

    // Lifecycle

    /// Join the ring and start serving.
    ///
    /// Adds the currently active members to the ring, subscribes to
    /// membership changes and, with the adaptive cache, starts the cache
    /// maintainer. Must be called from within a `LocalSet`.
    pub fn start(&self) {
        if self.status() != DirectoryStatus::Created {
            tracing::warn!(silo = %self.core.local, status = %self.status(), "directory already started");
            return;
        }

        {
            let mut ring = self.core.ring.borrow_mut();
            for member in self.core.membership.members() {
                if member.is_active() {
                    ring.add(member.silo);
                }
            }
        }

        let listener: Rc<dyn SiloStatusListener> = Rc::new(MembershipListener {
            directory: self.downgrade(),
        });
        self.core.membership.subscribe(Rc::downgrade(&listener));
        *self.core.listener.borrow_mut() = Some(listener);

        self.core.status.set(DirectoryStatus::Running);

        if let Some(cache) = &self.core.adaptive_cache {
            let maintainer = CacheMaintainer::new(
                self.downgrade(),
                Rc::clone(cache),
                self.maintenance_interval(),
            );
            let time = self.core.providers.time().clone();
            let handle = self
                .core
                .providers
                .task()
                .spawn_task("directory_cache_maintainer", maintainer.run(time));
            *self.core.maintainer.borrow_mut() = Some(handle);
        }

        tracing::info!(
            silo = %self.core.local,
            ring_size = self.core.ring.borrow().len(),
            "grain directory started"
        );
    }

    /// Stop gracefully, handing the local partition to the silos that keep
    /// its replica.
    ///
    /// While stopping, grains are routed past the local silo. Call this
    /// before announcing the silo as shutting down, so holders receive the
    /// final partition while the silo is still on their ring.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::StopPreparationFailed`] if a push was not
    /// acknowledged. The directory stays [`DirectoryStatus::Stopping`] and
    /// `stop` may be retried.
    pub async fn stop(&self) -> Result<(), DirectoryError> {
        if self.status() == DirectoryStatus::Stopped {
            return Ok(());
        }
        self.core.status.set(DirectoryStatus::Stopping);
        self.abort_maintainer();

        let (holders, chunks) = {
            let ring = self.core.ring.borrow();
            let items = self.core.partition.borrow().items();
            self.core.handoff.prepare_stop(&ring, items)
        };
        tracing::info!(
            silo = %self.core.local,
            holders = holders.len(),
            chunks = chunks.len(),
            "handing off partition before stop"
        );

        if let Err(e) = self.push_partition(&holders, chunks).await {
            tracing::error!(silo = %self.core.local, error = %e, "partition handoff failed");
            return Err(DirectoryError::StopPreparationFailed {
                source: Box::new(e),
            });
        }

        self.finish_stop();
        Ok(())
    }

    async fn push_partition(
        &self,
        holders: &[SiloAddress],
        chunks: Vec<HandoffChunk>,
    ) -> Result<(), DirectoryError> {
        if holders.is_empty() {
            return Ok(());
        }
        let remotes = holders
            .iter()
            .map(|holder| self.remote(holder))
            .collect::<Result<Vec<_>, _>>()?;
        for chunk in chunks {
            try_join_all(
                remotes
                    .iter()
                    .map(|remote| remote.accept_handoff_partition(chunk.clone())),
            )
            .await?;
        }
        Ok(())
    }

    /// Stop at once, without handing off the partition.
    pub fn stop_without_handoff(&self) {
        if self.status() == DirectoryStatus::Stopped {
            return;
        }
        self.abort_maintainer();
        self.finish_stop();
    }

    fn finish_stop(&self) {
        self.core.status.set(DirectoryStatus::Stopped);
        self.core.partition.borrow_mut().clear();
        self.core.cache.clear();
        self.core.handoff.clear();
        tracing::info!(silo = %self.core.local, "grain directory stopped");
    }

    fn abort_maintainer(&self) {
        if let Some(handle) = self.core.maintainer.borrow_mut().take() {
            handle.abort();
        }
    }
}

impl<P: Providers> fmt::Debug for LocalDirectory<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDirectory")
            .field("local", &self.core.local)
            .field("status", &self.core.status.get())
            .field("ring", &self.core.ring.borrow().len())
            .field("partition", &self.core.partition.borrow().len())
            .field("cache", &self.core.cache.len())
            .finish()
    }
}
