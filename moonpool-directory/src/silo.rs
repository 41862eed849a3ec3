//! Silo address: identifies a specific node instance in the cluster.
//!
//! A [`SiloAddress`] combines a socket address with a generation counter,
//! allowing the directory to distinguish between different incarnations of a
//! node at the same IP:port (e.g., after a restart).

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::types::fnv1a_32;

/// Identifies a specific node instance in the cluster.
///
/// Two addresses with the same endpoint but different generations are
/// distinct nodes. The consistent hash places the silo on the directory ring.
///
/// # Orleans Reference
///
/// Corresponds to Orleans' `SiloAddress` (endpoint + generation) and its
/// `GetConsistentHashCode()`.
///
/// # Examples
///
/// ```
/// use moonpool_directory::SiloAddress;
///
/// let silo = SiloAddress::new("127.0.0.1:4500".parse().unwrap(), 1);
/// assert_eq!(silo.generation(), 1);
/// assert_eq!(silo.to_string(), "127.0.0.1:4500@gen1");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiloAddress {
    endpoint: SocketAddr,
    generation: u64,
}

impl SiloAddress {
    /// Create a new silo address.
    pub fn new(endpoint: SocketAddr, generation: u64) -> Self {
        Self {
            endpoint,
            generation,
        }
    }

    /// The network endpoint of this silo.
    pub fn endpoint(&self) -> &SocketAddr {
        &self.endpoint
    }

    /// The generation counter for this silo instance.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Position of this silo on the directory ring.
    ///
    /// Stable for a given endpoint and generation, so every node computes the
    /// same ring from the same membership.
    pub fn consistent_hash(&self) -> u32 {
        fnv1a_32(self.to_string().as_bytes())
    }

    /// Whether `self` is an older incarnation of `other` (same endpoint,
    /// smaller generation).
    pub fn is_predecessor_of(&self, other: &SiloAddress) -> bool {
        self.endpoint == other.endpoint && self.generation < other.generation
    }
}

impl fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@gen{}", self.endpoint, self.generation)
    }
}
