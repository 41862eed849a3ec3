//! Error types for the grain directory.
//!
//! Partition- and cache-local conditions (missing entries, stale cache
//! entries, unexpected handoff deltas) are resolved internally and never
//! surface here. Only routing and availability failures cross the
//! component boundary.

use thiserror::Error;

use crate::provider::TimeError;
use crate::silo::SiloAddress;
use crate::types::GrainId;

/// Errors returned by directory operations.
#[derive(Debug, Clone, Error)]
pub enum DirectoryError {
    /// The request was forwarded too many times while membership was
    /// changing. Retry from scratch once membership stabilizes.
    #[error("hop limit reached for {grain}: owner is {owner}, hop count {hop_count}")]
    HopLimitExceeded {
        /// The grain being routed.
        grain: GrainId,
        /// The silo this node believes owns the grain.
        owner: SiloAddress,
        /// Hop count of the request when it was rejected.
        hop_count: u32,
    },

    /// No silo can own the grain: the local silo is stopped and knows of no
    /// other member.
    #[error("grain directory is stopping, no owner for {grain}")]
    Stopping {
        /// The grain that could not be routed.
        grain: GrainId,
    },

    /// The owner computed for the grain is not a viable silo. The local
    /// ring view is ahead of or behind membership.
    #[error("owner {owner} of {grain} is not a viable silo, retry later")]
    OwnerNotViable {
        /// The grain being looked up.
        grain: GrainId,
        /// The computed owner.
        owner: SiloAddress,
    },

    /// The membership table grain was routed without a configured seed.
    #[error("no seed silo configured to own {grain}")]
    MissingSeed {
        /// The membership table grain.
        grain: GrainId,
    },

    /// The transport has no route to the silo.
    #[error("silo {silo} is unreachable")]
    Unreachable {
        /// The unreachable silo.
        silo: SiloAddress,
    },

    /// Handing off the local partition during a graceful stop failed.
    #[error("stop preparation failed: {source}")]
    StopPreparationFailed {
        /// The error that interrupted the handoff.
        #[source]
        source: Box<DirectoryError>,
    },

    /// A provider timer failed.
    #[error("time error: {0}")]
    Time(#[from] TimeError),
}

impl DirectoryError {
    /// Whether the caller may retry the operation once membership settles.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HopLimitExceeded { .. } | Self::OwnerNotViable { .. } | Self::Unreachable { .. }
        )
    }
}
