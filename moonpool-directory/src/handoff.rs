//! Partition replication and handoff on membership changes.
//!
//! Ownership of a ring range moves to the predecessor when a silo leaves, so
//! every silo keeps replicas of its successors' partitions and is ready to
//! take over their ranges:
//!
//! ```text
//!   A ---- B ---- C          B holds a replica of C's partition
//!          \____/            C fails -> B merges the replica and now owns
//!                                        C's former range
//! ```
//!
//! # Design
//!
//! The manager only touches in-memory state. Membership events return a list
//! of [`HandoffAction`]s describing the remote calls to make; the directory
//! runs them as background tasks. All state sits behind one `RefCell`, never
//! borrowed across an `.await`.

use std::cell::RefCell;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::partition::{DirectoryPartition, GrainInfo};
use crate::ring::DirectoryRing;
use crate::silo::SiloAddress;
use crate::types::{ActivationAddress, GrainId};

/// One message of a partition handoff.
///
/// A `full` chunk replaces the receiver's replica wholesale. A delta chunk is
/// applied on top of it: `Some` replaces an entry, `None` removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffChunk {
    /// Silo whose partition is being replicated.
    pub source: SiloAddress,
    /// Entries carried by this chunk.
    pub entries: HashMap<GrainId, Option<GrainInfo>>,
    /// Whether this chunk starts a full copy.
    pub full: bool,
}

/// Remote work produced by a membership event.
#[derive(Debug, Clone, PartialEq)]
pub enum HandoffAction {
    /// Register activations at `target`.
    RegisterMany {
        /// Silo that now owns the grains.
        target: SiloAddress,
        /// Activations of single-activation grains.
        single: Vec<ActivationAddress>,
        /// Activations of multi-activation grains.
        multi: Vec<ActivationAddress>,
        /// Remove the grains from the local partition once `target`
        /// acknowledged.
        remove_locally: bool,
    },
    /// Tell a silo to drop the replica it keeps of the local partition.
    RemoveReplica {
        /// The former replica holder.
        holder: SiloAddress,
    },
    /// Ask the hosts of these activations to deactivate them.
    DeleteActivations {
        /// Activations that lost a single-activation conflict.
        activations: Vec<ActivationAddress>,
    },
}

#[derive(Debug, Default)]
struct HandoffState {
    /// Replicas of other silos' partitions, by source silo.
    replicas: HashMap<SiloAddress, DirectoryPartition>,
    /// Silos known to hold a replica of the local partition.
    holders: Vec<SiloAddress>,
}

/// Keeps replicas of successor partitions and drives partition handoff.
///
/// # Orleans Reference
///
/// Corresponds to Orleans' `GrainDirectoryHandoffManager`.
#[derive(Debug)]
pub struct HandoffManager {
    local: SiloAddress,
    replication_factor: usize,
    chunk_size: usize,
    template: DirectoryPartition,
    state: RefCell<HandoffState>,
}

impl HandoffManager {
    /// Create a manager.
    ///
    /// `template` is an empty partition whose settings new replicas copy.
    pub fn new(
        local: SiloAddress,
        replication_factor: usize,
        chunk_size: usize,
        template: DirectoryPartition,
    ) -> Self {
        Self {
            local,
            replication_factor,
            chunk_size: chunk_size.max(1),
            template,
            state: RefCell::new(HandoffState::default()),
        }
    }

    /// Silos whose partition this silo holds a replica of.
    pub fn replica_sources(&self) -> Vec<SiloAddress> {
        let mut sources: Vec<_> = self.state.borrow().replicas.keys().cloned().collect();
        sources.sort();
        sources
    }

    /// Snapshot of the replica held for `source`.
    pub fn replica_of(&self, source: &SiloAddress) -> Option<HashMap<GrainId, GrainInfo>> {
        self.state
            .borrow()
            .replicas
            .get(source)
            .map(DirectoryPartition::items)
    }

    /// Silos known to hold a replica of the local partition.
    pub fn holders(&self) -> Vec<SiloAddress> {
        self.state.borrow().holders.clone()
    }

    /// A silo joined the ring. `ring` already contains it.
    ///
    /// If it is the new immediate successor, the part of the local partition
    /// it now owns is handed over. If it landed between two successors, the
    /// replica of its predecessor is split to build its replica.
    pub(crate) fn process_silo_add(
        &self,
        added: &SiloAddress,
        ring: &DirectoryRing,
        local_partition: &mut DirectoryPartition,
        owner_of: impl Fn(&GrainId) -> Option<SiloAddress>,
    ) -> Vec<HandoffAction> {
        tracing::debug!(silo = %self.local, added = %added, "processing silo add for handoff");
        let mut state = self.state.borrow_mut();
        let mut actions = Self::reset_holders(&mut state);

        let Some(successors) = ring.successors(&self.local, self.replication_factor) else {
            return actions;
        };
        if !successors.contains(added) {
            return actions;
        }

        if successors.first() == Some(added) {
            let moved = local_partition.split(
                |grain| matches!(owner_of(grain), Some(owner) if owner != self.local),
                false,
            );
            let single = moved.to_activations(true);
            let multi = moved.to_activations(false);
            if !single.is_empty() || !multi.is_empty() {
                tracing::info!(
                    silo = %self.local,
                    target = %added,
                    single = single.len(),
                    multi = multi.len(),
                    "handing off part of local partition to new successor"
                );
                actions.push(HandoffAction::RegisterMany {
                    target: added.clone(),
                    single,
                    multi,
                    remove_locally: true,
                });
            }
        } else if let Some(predecessor) = ring
            .predecessors(added, 1)
            .and_then(|p| p.into_iter().next())
        {
            match state.replicas.get_mut(&predecessor) {
                Some(replica) => {
                    let split = replica.split(
                        |grain| matches!(owner_of(grain), Some(owner) if owner != predecessor),
                        true,
                    );
                    tracing::debug!(
                        from = %predecessor,
                        added = %added,
                        grains = split.len(),
                        "split replica for new silo"
                    );
                    state.replicas.insert(added.clone(), split);
                }
                None => {
                    tracing::warn!(
                        silo = %self.local,
                        predecessor = %predecessor,
                        "expected to hold the partition replica of the new silo's predecessor"
                    );
                }
            }
        }

        state.replicas.retain(|source, _| {
            let keep = successors.contains(source);
            if !keep {
                tracing::debug!(source = %source, "dropping replica of former successor");
            }
            keep
        });
        actions
    }

    /// A silo is leaving the ring. `ring` still contains it.
    ///
    /// If this silo holds its replica, the replica is merged into the
    /// partition of the leaving silo's predecessor: locally when that is us,
    /// otherwise by registering the entries there.
    pub(crate) fn process_silo_remove(
        &self,
        removed: &SiloAddress,
        ring: &DirectoryRing,
        local_partition: &mut DirectoryPartition,
    ) -> Vec<HandoffAction> {
        tracing::debug!(silo = %self.local, removed = %removed, "processing silo remove for handoff");
        let mut state = self.state.borrow_mut();
        let mut actions = Self::reset_holders(&mut state);

        let Some(replica) = state.replicas.remove(removed) else {
            return actions;
        };
        let Some(predecessor) = ring
            .predecessors(removed, 1)
            .and_then(|p| p.into_iter().next())
        else {
            return actions;
        };

        if predecessor == self.local {
            tracing::info!(
                silo = %self.local,
                removed = %removed,
                grains = replica.len(),
                "merging replica of removed silo into local partition"
            );
            let duplicates = local_partition.merge(replica);
            if !duplicates.is_empty() {
                actions.push(HandoffAction::DeleteActivations {
                    activations: duplicates,
                });
            }
        } else {
            let single = replica.to_activations(true);
            let multi = replica.to_activations(false);
            tracing::info!(
                removed = %removed,
                predecessor = %predecessor,
                grains = replica.len(),
                "forwarding replica of removed silo to its predecessor"
            );
            if let Some(predecessor_replica) = state.replicas.get_mut(&predecessor) {
                predecessor_replica.merge(replica);
            }
            if !single.is_empty() || !multi.is_empty() {
                actions.push(HandoffAction::RegisterMany {
                    target: predecessor,
                    single,
                    multi,
                    remove_locally: false,
                });
            }
        }
        actions
    }

    /// Plan the handoff of the local partition before stopping.
    ///
    /// Returns the silos to push to and the chunks to push, in order. The
    /// first chunk is a full copy; the others are deltas. An empty partition
    /// still yields one empty full chunk so holders drop stale data.
    pub(crate) fn prepare_stop(
        &self,
        ring: &DirectoryRing,
        items: HashMap<GrainId, GrainInfo>,
    ) -> (Vec<SiloAddress>, Vec<HandoffChunk>) {
        let holders = {
            let mut state = self.state.borrow_mut();
            if state.holders.is_empty() {
                state.holders = ring
                    .predecessors(&self.local, self.replication_factor)
                    .unwrap_or_default();
            }
            state.holders.clone()
        };

        let mut batches = Vec::new();
        let mut current = HashMap::new();
        for (grain, info) in items {
            current.insert(grain, Some(info));
            if current.len() == self.chunk_size {
                batches.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() || batches.is_empty() {
            batches.push(current);
        }

        let chunks = batches
            .into_iter()
            .enumerate()
            .map(|(index, entries)| HandoffChunk {
                source: self.local.clone(),
                entries,
                full: index == 0,
            })
            .collect();
        (holders, chunks)
    }

    /// Store a chunk of another silo's partition.
    pub fn accept_handoff_partition(&self, chunk: HandoffChunk) {
        tracing::debug!(
            source = %chunk.source,
            entries = chunk.entries.len(),
            full = chunk.full,
            "accepting handoff partition"
        );
        let mut state = self.state.borrow_mut();
        let replica = state
            .replicas
            .entry(chunk.source.clone())
            .or_insert_with(|| {
                if !chunk.full {
                    tracing::warn!(
                        source = %chunk.source,
                        "got a partition delta without holding a full copy"
                    );
                }
                self.template.empty_like()
            });

        if chunk.full {
            replica.set(
                chunk
                    .entries
                    .into_iter()
                    .filter_map(|(grain, info)| info.map(|info| (grain, info)))
                    .collect(),
            );
        } else {
            replica.update(chunk.entries);
        }
    }

    /// Drop the replica held for `source`.
    pub fn remove_handoff_partition(&self, source: &SiloAddress) -> bool {
        tracing::debug!(source = %source, "removing handoff partition");
        self.state.borrow_mut().replicas.remove(source).is_some()
    }

    /// Forget every replica and holder.
    pub(crate) fn clear(&self) {
        let mut state = self.state.borrow_mut();
        state.replicas.clear();
        state.holders.clear();
    }

    fn reset_holders(state: &mut HandoffState) -> Vec<HandoffAction> {
        state
            .holders
            .drain(..)
            .map(|holder| HandoffAction::RemoveReplica { holder })
            .collect()
    }
}
