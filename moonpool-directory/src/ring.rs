//! Consistent-hash ring of directory members.
//!
//! Every silo sits on a 32-bit ring at its consistent hash. A grain's
//! directory entry is owned by the silo with the greatest hash that is less
//! than or equal to the grain's uniform hash; when no silo qualifies the
//! range wraps around to the silo with the largest hash.
//!
//! ```text
//!   A(10)        B(50)              C(90)
//!   |------------|------------------|----------> 2^32
//!   grain 60 -> B        grain 5 -> C (wrap)
//! ```
//!
//! The ring is a pure data structure: it is only changed by the directory
//! in response to membership events, and all queries are deterministic for
//! a given member set.

use std::fmt;

use crate::silo::SiloAddress;

const RING_SIZE: u64 = 1 << 32;

/// Sorted view of the silos participating in the directory.
#[derive(Debug, Clone)]
pub struct DirectoryRing {
    local: SiloAddress,
    /// Sorted by `(hash, silo)` so ties are broken identically everywhere.
    members: Vec<(u32, SiloAddress)>,
}

impl DirectoryRing {
    /// Create an empty ring viewed from `local`.
    pub fn new(local: SiloAddress) -> Self {
        Self {
            local,
            members: Vec::new(),
        }
    }

    /// The silo this ring is viewed from.
    pub fn local(&self) -> &SiloAddress {
        &self.local
    }

    /// Insert a silo. Returns `false` if it was already present.
    pub fn add(&mut self, silo: SiloAddress) -> bool {
        let hash = silo.consistent_hash();
        self.add_with_hash(silo, hash)
    }

    pub(crate) fn add_with_hash(&mut self, silo: SiloAddress, hash: u32) -> bool {
        if self.contains(&silo) {
            return false;
        }
        let entry = (hash, silo);
        let index = self.members.partition_point(|member| member < &entry);
        self.members.insert(index, entry);
        true
    }

    /// Remove a silo. Returns `false` if it was not present.
    pub fn remove(&mut self, silo: &SiloAddress) -> bool {
        match self.index_of(silo) {
            Some(index) => {
                self.members.remove(index);
                true
            }
            None => false,
        }
    }

    /// Whether the silo is on the ring.
    pub fn contains(&self, silo: &SiloAddress) -> bool {
        self.index_of(silo).is_some()
    }

    /// Number of silos on the ring.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Silos in ring order.
    pub fn members(&self) -> Vec<SiloAddress> {
        self.members.iter().map(|(_, silo)| silo.clone()).collect()
    }

    /// Owner of the ring position `hash`.
    ///
    /// With `exclude_local`, the local silo is skipped so callers are
    /// redirected to the next owner. Returns `None` if the ring is empty, or
    /// if the local silo is excluded and is the only member.
    pub fn owner(&self, hash: u32, exclude_local: bool) -> Option<SiloAddress> {
        let eligible = |silo: &SiloAddress| !exclude_local || *silo != self.local;

        if let Some((_, silo)) = self
            .members
            .iter()
            .rev()
            .find(|(silo_hash, silo)| *silo_hash <= hash && eligible(silo))
        {
            return Some(silo.clone());
        }

        // Wrap around: the largest eligible hash owns the range below the
        // smallest hash.
        self.members
            .iter()
            .rev()
            .map(|(_, silo)| silo)
            .find(|silo| eligible(silo))
            .cloned()
    }

    /// Up to `count` silos preceding `silo` on the ring, nearest first.
    ///
    /// Returns `None` if `silo` is not on the ring.
    pub fn predecessors(&self, silo: &SiloAddress, count: usize) -> Option<Vec<SiloAddress>> {
        let index = self.index_of(silo)?;
        let n = self.members.len();
        Some(
            (1..n)
                .map(|step| self.members[(index + n - step) % n].1.clone())
                .take(count)
                .collect(),
        )
    }

    /// Up to `count` silos following `silo` on the ring, nearest first.
    ///
    /// Returns `None` if `silo` is not on the ring.
    pub fn successors(&self, silo: &SiloAddress, count: usize) -> Option<Vec<SiloAddress>> {
        let index = self.index_of(silo)?;
        let n = self.members.len();
        Some(
            (1..n)
                .map(|step| self.members[(index + step) % n].1.clone())
                .take(count)
                .collect(),
        )
    }

    /// Clockwise distance from the local silo to its immediate successor.
    ///
    /// Zero when the local silo has no successor.
    pub fn distance_to_successor(&self) -> u64 {
        let Some(local_index) = self.index_of(&self.local) else {
            return 0;
        };
        if self.members.len() < 2 {
            return 0;
        }
        let successor_index = (local_index + 1) % self.members.len();
        ring_distance(
            self.members[local_index].0,
            self.members[successor_index].0,
        )
    }

    fn index_of(&self, silo: &SiloAddress) -> Option<usize> {
        self.members.iter().position(|(_, member)| member == silo)
    }
}

/// Clockwise distance between two ring positions.
pub(crate) fn ring_distance(from: u32, to: u32) -> u64 {
    let (from, to) = (u64::from(from), u64::from(to));
    if to >= from {
        to - from
    } else {
        RING_SIZE - (from - to)
    }
}

impl fmt::Display for DirectoryRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Silo address is {}, silo consistent hash is {:08X}.",
            self.local,
            self.local.consistent_hash()
        )?;
        writeln!(f, "Ring is:")?;
        for (hash, silo) in &self.members {
            writeln!(f, "    Silo {}, consistent hash is {:08X}", silo, hash)?;
        }
        let predecessors = self.predecessors(&self.local, 1).unwrap_or_default();
        let successors = self.successors(&self.local, 1).unwrap_or_default();
        let describe = |silos: &[SiloAddress]| {
            silos
                .iter()
                .map(|s| format!("{}/{:08X}", s, s.consistent_hash()))
                .collect::<Vec<_>>()
                .join(" -- ")
        };
        writeln!(f, "My predecessors: {}", describe(&predecessors))?;
        write!(f, "My successors: {}", describe(&successors))
    }
}
