//! Core grain directory types.
//!
//! These types form the contract between the directory and the rest of the
//! runtime: which grain, which activation, where it lives, and which version
//! of a directory entry a caller has seen.
//!
//! # Design
//!
//! - `GrainType` is a u64 derived from the grain interface name.
//! - `GrainId` is a category + `GrainType` + an opaque byte key. Its uniform
//!   hash decides which silo owns the grain's directory entry.
//! - `ActivationAddress` is the value stored in the directory: grain +
//!   hosting silo + activation.
//! - `VersionTag` is the change detector attached to every directory entry.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::silo::SiloAddress;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a. Deterministic across processes, unlike `std`'s hasher.
pub(crate) fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Identifies a grain TYPE, derived from the grain interface name.
///
/// # Convention
///
/// Use a hex constant matching the interface ID pattern:
/// ```rust
/// use moonpool_directory::GrainType;
/// const BANK_ACCOUNT: GrainType = GrainType(0xBA4E_4B00);
/// ```
#[derive(Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct GrainType(pub u64);

impl GrainType {
    /// Type reserved for the cluster membership table grain.
    pub const MEMBERSHIP_TABLE: GrainType = GrainType(0x4D45_4D42);
}

/// Whether a grain is an ordinary application grain or a node-local system
/// service.
#[derive(Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub enum GrainCategory {
    /// Application grain, placed on the ring by its hash.
    Application,
    /// Node-local system service. Every silo owns its own system targets.
    SystemTarget,
}

/// Logical identity of a grain.
///
/// Immutable. The uniform hash is computed from the category, type and key,
/// so it is stable for the lifetime of the process and identical on every
/// node.
///
/// # Examples
///
/// ```rust
/// use moonpool_directory::{GrainId, GrainType};
///
/// let player = GrainId::new(GrainType(0x504C_4159), "player-42");
/// assert!(!player.is_system_target());
/// ```
#[derive(Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct GrainId {
    category: GrainCategory,
    grain_type: GrainType,
    key: Vec<u8>,
}

impl GrainId {
    /// Create an application grain id.
    pub fn new(grain_type: GrainType, key: impl Into<Vec<u8>>) -> Self {
        Self {
            category: GrainCategory::Application,
            grain_type,
            key: key.into(),
        }
    }

    /// Create a node-local system target id.
    pub fn system_target(grain_type: GrainType, key: impl Into<Vec<u8>>) -> Self {
        Self {
            category: GrainCategory::SystemTarget,
            grain_type,
            key: key.into(),
        }
    }

    /// The bootstrap identity of the cluster membership table.
    ///
    /// Its directory entry is pinned to the configured seed silo.
    pub fn membership_table() -> Self {
        Self::system_target(GrainType::MEMBERSHIP_TABLE, Vec::new())
    }

    /// The grain category.
    pub fn category(&self) -> GrainCategory {
        self.category
    }

    /// The grain type.
    pub fn grain_type(&self) -> GrainType {
        self.grain_type
    }

    /// The opaque key bytes.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Whether this grain is a node-local system service.
    pub fn is_system_target(&self) -> bool {
        self.category == GrainCategory::SystemTarget
    }

    /// Whether this is the membership table grain.
    pub fn is_membership_table(&self) -> bool {
        self.is_system_target() && self.grain_type == GrainType::MEMBERSHIP_TABLE
    }

    /// Position of this grain on the directory ring.
    pub fn uniform_hash(&self) -> u32 {
        let mut bytes = Vec::with_capacity(9 + self.key.len());
        bytes.push(match self.category {
            GrainCategory::Application => 0,
            GrainCategory::SystemTarget => 1,
        });
        bytes.extend_from_slice(&self.grain_type.0.to_le_bytes());
        bytes.extend_from_slice(&self.key);
        fnv1a_32(&bytes)
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.category {
            GrainCategory::Application => "grain",
            GrainCategory::SystemTarget => "sys",
        };
        write!(
            f,
            "{}/{:x}/{}",
            prefix,
            self.grain_type.0,
            String::from_utf8_lossy(&self.key)
        )
    }
}

/// Unique identifier for a specific grain activation.
///
/// When a grain is activated on a silo, it gets a unique `ActivationId`.
/// Ids are totally ordered, which gives merge conflicts a deterministic
/// winner.
///
/// # Orleans Reference
///
/// Corresponds to Orleans' `ActivationId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivationId(pub u64);

impl ActivationId {
    /// Create a new activation ID from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "act-{:016x}", self.0)
    }
}

/// Full address of a grain activation: hosting silo + grain + activation.
///
/// # Orleans Reference
///
/// Corresponds to Orleans' `ActivationAddress` / `GrainAddress`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationAddress {
    /// The silo hosting this activation.
    pub silo: SiloAddress,
    /// The grain identity.
    pub grain: GrainId,
    /// Unique identifier for this specific activation.
    pub activation: ActivationId,
}

impl ActivationAddress {
    /// Create a new activation address.
    pub fn new(silo: SiloAddress, grain: GrainId, activation: ActivationId) -> Self {
        Self {
            silo,
            grain,
            activation,
        }
    }
}

impl fmt::Display for ActivationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} @ {}", self.grain, self.activation, self.silo)
    }
}

/// Version tag (ETag) of a directory entry.
///
/// Changes whenever the entry's activation set changes. Only compared for
/// equality: tags detect staleness, they do not order updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionTag(pub u64);

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "etag-{}", self.0)
    }
}

/// A registered activation together with the entry version it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAndTag {
    /// The activation the directory holds for the grain.
    pub address: ActivationAddress,
    /// Version of the grain's entry after the registration.
    pub version: VersionTag,
}

/// Result of a directory lookup.
///
/// `version` is `None` when the owner has no entry for the grain.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LookupResult {
    /// Activations currently registered on viable silos.
    pub activations: Vec<ActivationAddress>,
    /// Version of the entry, if it exists.
    pub version: Option<VersionTag>,
}

impl LookupResult {
    /// A lookup that found nothing.
    pub fn missing() -> Self {
        Self::default()
    }

    /// Whether no activation was found.
    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }
}

/// Why an activation is being removed from the directory.
///
/// The cause decides which entries may be removed, see
/// [`RegistrationStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnregistrationCause {
    /// Always removable.
    Force,
    /// Sent by a cache eviction. Only `Cached` entries are removable.
    CacheInvalidation,
    /// A message reached a silo that no longer hosts the activation.
    /// Authoritative entries are removable only once the lazy
    /// deregistration grace period has elapsed since their creation.
    NonexistentActivation,
}

/// Registration status of one activation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationStatus {
    /// Authoritative registration made in this cluster.
    ClusterLocal,
    /// Non-authoritative copy of a registration made elsewhere.
    Cached,
    /// Registration whose validity is being re-checked.
    Doubtful,
    /// Registration whose removal has been requested.
    RequestedDeletion,
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClusterLocal => write!(f, "ClusterLocal"),
            Self::Cached => write!(f, "Cached"),
            Self::Doubtful => write!(f, "Doubtful"),
            Self::RequestedDeletion => write!(f, "RequestedDeletion"),
        }
    }
}
