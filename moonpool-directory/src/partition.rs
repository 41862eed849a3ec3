//! Authoritative directory partition.
//!
//! A [`DirectoryPartition`] maps each grain this silo owns to its
//! [`GrainInfo`]: the set of known activations and a version tag. The same
//! structure is used for replicas of other silos' partitions held by the
//! handoff manager.
//!
//! # Design
//!
//! - Every method is synchronous. The owning directory runs on a
//!   single-threaded executor and never holds a borrow of the partition
//!   across an `.await`, so each call is a serialized critical section.
//! - Timestamps are `Duration`s from [`TimeProvider::now`](crate::TimeProvider::now),
//!   passed in by the caller.
//! - Version tags come from a per-silo [`VersionSource`] shared by the local
//!   partition and the replicas derived from it.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::membership::MembershipView;
use crate::silo::SiloAddress;
use crate::types::{
    ActivationAddress, ActivationId, AddressAndTag, GrainId, LookupResult, RegistrationStatus,
    UnregistrationCause, VersionTag,
};

/// Issues version tags for directory entries.
///
/// A counter seeded once per silo. Tags only need to differ from the
/// previous tag of the same entry, which a counter guarantees, and seeding
/// keeps tags from different silos apart.
#[derive(Debug, Clone)]
pub struct VersionSource(Rc<Cell<u64>>);

impl VersionSource {
    /// Create a source starting after `seed`.
    pub fn new(seed: u64) -> Self {
        Self(Rc::new(Cell::new(seed)))
    }

    /// Issue the next tag.
    pub fn next_tag(&self) -> VersionTag {
        let next = self.0.get().wrapping_add(1);
        self.0.set(next);
        VersionTag(next)
    }
}

/// One activation entry inside a [`GrainInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationInfo {
    /// Silo hosting the activation.
    pub silo: SiloAddress,
    /// When the entry was created, as reported by the time provider.
    pub created_at: Duration,
    /// Registration status.
    pub status: RegistrationStatus,
}

impl ActivationInfo {
    /// Create a new activation entry.
    pub fn new(silo: SiloAddress, status: RegistrationStatus, created_at: Duration) -> Self {
        Self {
            silo,
            created_at,
            status,
        }
    }

    /// Whether this entry may be removed for `cause` at time `now`.
    ///
    /// `NonexistentActivation` removals of authoritative entries wait for
    /// `grace` to elapse since creation, so an unregistration that overtakes
    /// a fresh registration does not drop it.
    pub fn is_removable(&self, cause: UnregistrationCause, now: Duration, grace: Duration) -> bool {
        match cause {
            UnregistrationCause::Force => true,
            UnregistrationCause::CacheInvalidation => self.status == RegistrationStatus::Cached,
            UnregistrationCause::NonexistentActivation => {
                self.status == RegistrationStatus::Cached
                    || now >= self.created_at.saturating_add(grace)
            }
        }
    }
}

/// All activations known for one grain.
///
/// # Invariants
///
/// - A single-activation grain holds at most one activation.
/// - `version` changes on every mutation of the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrainInfo {
    activations: BTreeMap<ActivationId, ActivationInfo>,
    version: VersionTag,
    single_activation: bool,
}

impl GrainInfo {
    /// Create an empty entry.
    pub fn new(single_activation: bool, version: VersionTag) -> Self {
        Self {
            activations: BTreeMap::new(),
            version,
            single_activation,
        }
    }

    /// Activations, ordered by id.
    pub fn activations(&self) -> &BTreeMap<ActivationId, ActivationInfo> {
        &self.activations
    }

    /// Current version tag.
    pub fn version(&self) -> VersionTag {
        self.version
    }

    /// Whether the grain is in single-activation mode.
    pub fn is_single_activation(&self) -> bool {
        self.single_activation
    }

    /// Number of activations.
    pub fn len(&self) -> usize {
        self.activations.len()
    }

    /// Whether the entry has no activation.
    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Addresses of all activations.
    pub fn addresses(&self, grain: &GrainId) -> Vec<ActivationAddress> {
        self.activations
            .iter()
            .map(|(id, info)| ActivationAddress::new(info.silo.clone(), grain.clone(), *id))
            .collect()
    }

    /// Fold `other` into this entry.
    ///
    /// Activations missing locally are added. If that leaves a
    /// single-activation grain with several activations, only the smallest
    /// activation id is kept and the dropped ones are returned so their
    /// hosts can be asked to deactivate them.
    fn merge(
        &mut self,
        grain: &GrainId,
        other: GrainInfo,
        versions: &VersionSource,
    ) -> Vec<ActivationAddress> {
        let mut modified = false;
        for (id, info) in other.activations {
            if let std::collections::btree_map::Entry::Vacant(slot) = self.activations.entry(id) {
                slot.insert(info);
                modified = true;
            }
        }
        if modified {
            self.version = versions.next_tag();
        }

        if !self.single_activation || self.activations.len() <= 1 {
            return Vec::new();
        }

        let mut dropped = std::mem::take(&mut self.activations);
        if let Some((id, info)) = dropped.pop_first() {
            self.activations.insert(id, info);
        }
        let dropped: Vec<_> = dropped
            .into_iter()
            .map(|(id, info)| ActivationAddress::new(info.silo, grain.clone(), id))
            .collect();
        tracing::warn!(
            grain = %grain,
            dropped = dropped.len(),
            "single-activation grain had several activations after merge, keeping the smallest id"
        );
        dropped
    }
}

/// A partition of the grain directory.
///
/// # Orleans Reference
///
/// Corresponds to Orleans' `GrainDirectoryPartition`.
#[derive(Debug)]
pub struct DirectoryPartition {
    grains: HashMap<GrainId, GrainInfo>,
    membership: Rc<dyn MembershipView>,
    versions: VersionSource,
    lazy_deregistration_delay: Duration,
}

impl DirectoryPartition {
    /// Create an empty partition.
    ///
    /// `lazy_deregistration_delay` is the grace period applied to
    /// `NonexistentActivation` removals of authoritative entries.
    pub fn new(
        membership: Rc<dyn MembershipView>,
        versions: VersionSource,
        lazy_deregistration_delay: Duration,
    ) -> Self {
        Self {
            grains: HashMap::new(),
            membership,
            versions,
            lazy_deregistration_delay,
        }
    }

    /// An empty partition with the same settings.
    pub fn empty_like(&self) -> Self {
        Self::new(
            self.membership.clone(),
            self.versions.clone(),
            self.lazy_deregistration_delay,
        )
    }

    /// Number of grains in the partition.
    pub fn len(&self) -> usize {
        self.grains.len()
    }

    /// Whether the partition is empty.
    pub fn is_empty(&self) -> bool {
        self.grains.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.grains.clear();
    }

    /// The entry for a grain.
    pub fn get(&self, grain: &GrainId) -> Option<&GrainInfo> {
        self.grains.get(grain)
    }

    /// A copy of every entry.
    pub fn items(&self) -> HashMap<GrainId, GrainInfo> {
        self.grains.clone()
    }

    /// Register an activation of a multi-activation grain.
    ///
    /// Returns the activation the partition holds with the entry version:
    /// `address` itself, or the existing activation if the grain is already
    /// registered as single-activation. Re-adding an activation already
    /// known on the same silo is a no-op and keeps the version. Returns
    /// `None` if the hosting silo is not viable.
    pub fn add_activation(
        &mut self,
        address: &ActivationAddress,
        now: Duration,
    ) -> Option<AddressAndTag> {
        if !self.membership.is_viable(&address.silo) {
            tracing::debug!(activation = %address, "refusing activation on non-viable silo");
            return None;
        }

        let versions = &self.versions;
        let info = self
            .grains
            .entry(address.grain.clone())
            .or_insert_with(|| GrainInfo::new(false, versions.next_tag()));

        if info.single_activation && !info.activations.contains_key(&address.activation) {
            if let Some((id, existing)) = info.activations.iter().next() {
                tracing::warn!(
                    activation = %address,
                    existing = %id,
                    "refusing second activation of a single-activation grain"
                );
                return Some(AddressAndTag {
                    address: ActivationAddress::new(existing.silo.clone(), address.grain.clone(), *id),
                    version: info.version,
                });
            }
        }

        let registered = AddressAndTag {
            address: address.clone(),
            version: info.version,
        };
        if let Some(existing) = info.activations.get(&address.activation) {
            if existing.silo == address.silo {
                return Some(registered);
            }
        }

        info.activations.insert(
            address.activation,
            ActivationInfo::new(address.silo.clone(), RegistrationStatus::ClusterLocal, now),
        );
        info.version = versions.next_tag();
        tracing::trace!(activation = %address, version = %info.version, "added activation");
        Some(AddressAndTag {
            address: address.clone(),
            version: info.version,
        })
    }

    /// Register an activation of a single-activation grain.
    ///
    /// If the grain already has an activation, that activation wins and is
    /// returned unchanged. Returns `None` if the hosting silo is not viable.
    pub fn add_single_activation(
        &mut self,
        address: &ActivationAddress,
        status: RegistrationStatus,
        now: Duration,
    ) -> Option<AddressAndTag> {
        if !self.membership.is_viable(&address.silo) {
            tracing::debug!(activation = %address, "refusing activation on non-viable silo");
            return None;
        }

        let versions = &self.versions;
        let info = self
            .grains
            .entry(address.grain.clone())
            .or_insert_with(|| GrainInfo::new(true, versions.next_tag()));
        info.single_activation = true;

        if let Some((id, existing)) = info.activations.iter().next() {
            return Some(AddressAndTag {
                address: ActivationAddress::new(existing.silo.clone(), address.grain.clone(), *id),
                version: info.version,
            });
        }

        info.activations.insert(
            address.activation,
            ActivationInfo::new(address.silo.clone(), status, now),
        );
        info.version = versions.next_tag();
        tracing::trace!(activation = %address, version = %info.version, "added single activation");
        Some(AddressAndTag {
            address: address.clone(),
            version: info.version,
        })
    }

    /// Remove one activation if `cause` allows it.
    ///
    /// The grain entry is deleted once its last activation is gone. Returns
    /// whether the activation was removed.
    pub fn remove_activation(
        &mut self,
        grain: &GrainId,
        activation: ActivationId,
        cause: UnregistrationCause,
        now: Duration,
    ) -> bool {
        let Some(info) = self.grains.get_mut(grain) else {
            return false;
        };
        let removable = info
            .activations
            .get(&activation)
            .is_some_and(|entry| entry.is_removable(cause, now, self.lazy_deregistration_delay));
        if !removable {
            tracing::trace!(grain = %grain, activation = %activation, ?cause, "activation not removable");
            return false;
        }

        info.activations.remove(&activation);
        info.version = self.versions.next_tag();
        if info.activations.is_empty() {
            self.grains.remove(grain);
        }
        tracing::trace!(grain = %grain, activation = %activation, ?cause, "removed activation");
        true
    }

    /// Remove a grain and all its activations.
    pub fn remove_grain(&mut self, grain: &GrainId) -> bool {
        self.grains.remove(grain).is_some()
    }

    /// Remove every activation hosted on a silo matching `predicate`.
    ///
    /// Returns the number of activations removed.
    pub fn remove_activations_on(&mut self, predicate: impl Fn(&SiloAddress) -> bool) -> usize {
        let mut removed = 0;
        for info in self.grains.values_mut() {
            let before = info.activations.len();
            info.activations.retain(|_, entry| !predicate(&entry.silo));
            if info.activations.len() != before {
                removed += before - info.activations.len();
                info.version = self.versions.next_tag();
            }
        }
        self.grains.retain(|_, info| !info.activations.is_empty());
        removed
    }

    /// Activations of a grain hosted on viable silos, with the entry version.
    ///
    /// Returns `None` if the partition has no entry for the grain.
    pub fn lookup(&self, grain: &GrainId) -> Option<LookupResult> {
        let info = self.grains.get(grain)?;
        let activations = info
            .addresses(grain)
            .into_iter()
            .filter(|address| self.membership.is_viable(&address.silo))
            .collect();
        Some(LookupResult {
            activations,
            version: Some(info.version),
        })
    }

    /// Version of a grain's entry.
    pub fn version_of(&self, grain: &GrainId) -> Option<VersionTag> {
        self.grains.get(grain).map(GrainInfo::version)
    }

    /// Compare-and-set the status of one activation.
    ///
    /// Returns `false` if the activation is unknown or its status is not
    /// `expected`.
    pub fn update_status_if(
        &mut self,
        grain: &GrainId,
        activation: ActivationId,
        expected: RegistrationStatus,
        new: RegistrationStatus,
    ) -> bool {
        let Some(info) = self.grains.get_mut(grain) else {
            return false;
        };
        match info.activations.get_mut(&activation) {
            Some(entry) if entry.status == expected => {
                entry.status = new;
                info.version = self.versions.next_tag();
                true
            }
            _ => false,
        }
    }

    /// Fold another partition into this one.
    ///
    /// Grains unknown locally are taken as they are; grains present in both
    /// are merged activation by activation. Returns the activations dropped
    /// to restore single-activation exclusivity.
    pub fn merge(&mut self, other: DirectoryPartition) -> Vec<ActivationAddress> {
        self.merge_items(other.grains)
    }

    pub(crate) fn merge_items(
        &mut self,
        items: HashMap<GrainId, GrainInfo>,
    ) -> Vec<ActivationAddress> {
        let mut duplicates = Vec::new();
        for (grain, info) in items {
            match self.grains.get_mut(&grain) {
                Some(existing) => {
                    tracing::debug!(grain = %grain, "grain found in both merged partitions");
                    duplicates.extend(existing.merge(&grain, info, &self.versions));
                }
                None => {
                    self.grains.insert(grain, info);
                }
            }
        }
        duplicates
    }

    /// Copy or move the entries whose grain matches `predicate` into a new
    /// partition.
    ///
    /// With `modify_origin`, matched entries are removed from `self`.
    pub fn split(
        &mut self,
        predicate: impl Fn(&GrainId) -> bool,
        modify_origin: bool,
    ) -> DirectoryPartition {
        let mut split = self.empty_like();
        if modify_origin {
            let matched: Vec<GrainId> = self
                .grains
                .keys()
                .filter(|grain| predicate(grain))
                .cloned()
                .collect();
            for grain in matched {
                if let Some(info) = self.grains.remove(&grain) {
                    split.grains.insert(grain, info);
                }
            }
        } else {
            split.grains = self
                .grains
                .iter()
                .filter(|(grain, _)| predicate(grain))
                .map(|(grain, info)| (grain.clone(), info.clone()))
                .collect();
        }
        split
    }

    /// Every activation on a viable silo, restricted to single-activation or
    /// multi-activation grains.
    pub fn to_activations(&self, single_activation: bool) -> Vec<ActivationAddress> {
        self.grains
            .iter()
            .filter(|(_, info)| info.single_activation == single_activation)
            .flat_map(|(grain, info)| info.addresses(grain))
            .filter(|address| self.membership.is_viable(&address.silo))
            .collect()
    }

    /// Replace the whole content.
    pub fn set(&mut self, items: HashMap<GrainId, GrainInfo>) {
        self.grains = items;
    }

    /// Apply a delta: `Some` replaces the entry, `None` removes it.
    pub fn update(&mut self, delta: HashMap<GrainId, Option<GrainInfo>>) {
        for (grain, info) in delta {
            match info {
                Some(info) => {
                    self.grains.insert(grain, info);
                }
                None => {
                    self.grains.remove(&grain);
                }
            }
        }
    }
}
