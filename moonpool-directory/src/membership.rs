//! Membership view: which silos are in the cluster, and in which state.
//!
//! The directory consumes membership as an eventually-consistent list of
//! silos with status-change notifications. It never writes membership
//! itself; it observes it through [`MembershipView`] and reacts through
//! [`SiloStatusListener`].
//!
//! # Design
//!
//! - `MembershipView` is a trait so implementations can range from a shared
//!   in-memory list (tests, simulation) to a gossip-based protocol.
//! - [`SharedMembership`] is a simple `RefCell`-based implementation where
//!   all nodes share the same view and are notified synchronously.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

use crate::silo::SiloAddress;

/// Monotonically increasing membership version.
///
/// # Orleans Reference
///
/// Corresponds to Orleans' `MembershipVersion`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MembershipVersion(pub u64);

impl MembershipVersion {
    /// Create version 0 (initial).
    pub fn new() -> Self {
        Self(0)
    }

    /// Return the next version.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MembershipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Status of a silo in the cluster.
///
/// # Orleans Reference
///
/// Corresponds to Orleans' `SiloStatus`, without the `Created` and
/// `Stopping` internal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiloStatus {
    /// Silo is joining the cluster (announced but not yet ready to serve).
    Joining,
    /// Silo is fully operational and owns its ring range.
    Active,
    /// Silo is gracefully shutting down.
    ShuttingDown,
    /// Silo is no longer reachable (crashed or completed shutdown).
    Dead,
}

impl SiloStatus {
    /// Whether the silo is leaving or has left the cluster.
    pub fn is_terminating(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Dead)
    }
}

impl fmt::Display for SiloStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joining => write!(f, "Joining"),
            Self::Active => write!(f, "Active"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Dead => write!(f, "Dead"),
        }
    }
}

/// A single member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Address of this member.
    pub silo: SiloAddress,
    /// Current lifecycle status.
    pub status: SiloStatus,
}

impl ClusterMember {
    /// Create a new cluster member.
    pub fn new(silo: SiloAddress, status: SiloStatus) -> Self {
        Self { silo, status }
    }

    /// Check if this member is active.
    pub fn is_active(&self) -> bool {
        self.status == SiloStatus::Active
    }
}

/// Receives silo status changes.
///
/// Called synchronously by the membership view. Implementations must not
/// block; long work should be spawned.
pub trait SiloStatusListener {
    /// A silo changed status (joined, became active, is shutting down, or
    /// was declared dead).
    fn silo_status_changed(&self, silo: &SiloAddress, status: SiloStatus);
}

/// Read access to cluster membership, plus change subscription.
pub trait MembershipView: fmt::Debug {
    /// All known members, ordered by silo address.
    fn members(&self) -> Vec<ClusterMember>;

    /// Whether the silo may host activations or own directory entries.
    ///
    /// Unknown silos and dead silos are not viable.
    fn is_viable(&self, silo: &SiloAddress) -> bool;

    /// Current membership version.
    fn version(&self) -> MembershipVersion;

    /// Register a listener. Listeners are held weakly and dropped once
    /// their owner is gone.
    fn subscribe(&self, listener: Weak<dyn SiloStatusListener>);
}

/// Shared in-memory membership.
///
/// All nodes in a test or simulation can share the same
/// `Rc<SharedMembership>`, giving them a consistent view of the cluster.
/// Every change notifies subscribers synchronously, after the internal
/// borrow has been released, so listeners may read the view.
///
/// # Example
///
/// ```rust,ignore
/// let membership = SharedMembership::new();
/// membership.register_node(silo_a.clone(), SiloStatus::Active);
/// membership.register_node(silo_b.clone(), SiloStatus::Active);
///
/// // Node fails
/// membership.update_status(&silo_a, SiloStatus::Dead);
/// assert!(!membership.is_viable(&silo_a));
/// ```
#[derive(Default)]
pub struct SharedMembership {
    inner: RefCell<SharedMembershipInner>,
}

#[derive(Default)]
struct SharedMembershipInner {
    members: BTreeMap<SiloAddress, SiloStatus>,
    version: MembershipVersion,
    listeners: Vec<Weak<dyn SiloStatusListener>>,
}

impl SharedMembership {
    /// Create a new empty shared membership.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared membership pre-populated with active members.
    pub fn with_members(silos: Vec<SiloAddress>) -> Self {
        let version = MembershipVersion(silos.len() as u64);
        let members = silos
            .into_iter()
            .map(|silo| (silo, SiloStatus::Active))
            .collect();
        Self {
            inner: RefCell::new(SharedMembershipInner {
                members,
                version,
                listeners: Vec::new(),
            }),
        }
    }

    /// Register a silo with the given status, or update it if already
    /// known. Returns the new membership version.
    pub fn register_node(&self, silo: SiloAddress, status: SiloStatus) -> MembershipVersion {
        let version = {
            let mut inner = self.inner.borrow_mut();
            inner.members.insert(silo.clone(), status);
            inner.version = inner.version.next();
            inner.version
        };
        self.notify(&silo, status);
        version
    }

    /// Update the status of a silo. Returns `None` if the silo is unknown.
    pub fn update_status(&self, silo: &SiloAddress, status: SiloStatus) -> Option<MembershipVersion> {
        let version = {
            let mut inner = self.inner.borrow_mut();
            let current = inner.members.get_mut(silo)?;
            *current = status;
            inner.version = inner.version.next();
            inner.version
        };
        self.notify(silo, status);
        Some(version)
    }

    /// Status of a silo, if known.
    pub fn status(&self, silo: &SiloAddress) -> Option<SiloStatus> {
        self.inner.borrow().members.get(silo).copied()
    }

    fn notify(&self, silo: &SiloAddress, status: SiloStatus) {
        let listeners: Vec<Rc<dyn SiloStatusListener>> = {
            let mut inner = self.inner.borrow_mut();
            inner.listeners.retain(|l| l.strong_count() > 0);
            inner.listeners.iter().filter_map(Weak::upgrade).collect()
        };
        tracing::debug!(silo = %silo, status = %status, listeners = listeners.len(), "membership change");
        for listener in listeners {
            listener.silo_status_changed(silo, status);
        }
    }
}

impl fmt::Debug for SharedMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SharedMembership")
            .field("members", &inner.members)
            .field("version", &inner.version)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

impl MembershipView for SharedMembership {
    fn members(&self) -> Vec<ClusterMember> {
        self.inner
            .borrow()
            .members
            .iter()
            .map(|(silo, status)| ClusterMember::new(silo.clone(), *status))
            .collect()
    }

    fn is_viable(&self, silo: &SiloAddress) -> bool {
        matches!(
            self.inner.borrow().members.get(silo),
            Some(status) if *status != SiloStatus::Dead
        )
    }

    fn version(&self) -> MembershipVersion {
        self.inner.borrow().version
    }

    fn subscribe(&self, listener: Weak<dyn SiloStatusListener>) {
        self.inner.borrow_mut().listeners.push(listener);
    }
}
