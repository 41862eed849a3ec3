//! # Moonpool Directory
//!
//! Distributed, partitioned grain directory for moonpool virtual actors.
//!
//! Every grain has exactly one owner silo, chosen by consistent hashing over
//! the ring of active silos. The owner keeps the authoritative list of the
//! grain's activations; the other silos forward requests to it and cache
//! what they learn.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 LocalDirectory (one per silo)                │
//! │  register / unregister / lookup / local_lookup / delete      │
//! ├──────────────┬──────────────┬───────────────┬────────────────┤
//! │ DirectoryRing│ Directory    │ DirectoryCache│ HandoffManager │
//! │ owner = max  │ Partition    │ LRU or        │ replicas of    │
//! │ hash <= grain│ (owned       │ adaptive TTL  │ successors,    │
//! │              │  grains)     │ + maintainer  │ stop handoff   │
//! ├──────────────┴──────────────┴───────────────┴────────────────┤
//! │ MembershipView (status callbacks)  │ DirectoryTransport (RPC) │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::rc::Rc;
//! use moonpool_directory::{
//!     DirectoryConfig, LocalDirectory, LoopbackTransport, SharedMembership, TokioProviders,
//! };
//!
//! let membership = Rc::new(SharedMembership::with_members(vec![silo.clone()]));
//! let transport = Rc::new(LoopbackTransport::new());
//! let directory = LocalDirectory::new(
//!     silo.clone(),
//!     DirectoryConfig::default(),
//!     TokioProviders::new(),
//!     membership,
//!     transport.clone(),
//! );
//! transport.attach(silo, directory.endpoint());
//! directory.start();
//!
//! directory.register(address, true).await?;
//! ```
//!
//! All types are single-threaded (`Rc`, `RefCell`) and must run inside a
//! `tokio::task::LocalSet`.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod handoff;
pub mod membership;
pub mod partition;
pub mod provider;
pub mod remote;
pub mod ring;
pub mod service;
pub mod silo;
pub mod stats;
pub mod types;

pub use cache::{
    AdaptiveDirectoryCache, CacheMaintainer, CachedActivations, DirectoryCache, LruDirectoryCache,
};
pub use catalog::ActivationCatalog;
pub use config::{CacheConfig, DirectoryConfig, DirectoryConfigBuilder, DirectoryConfigError};
pub use error::DirectoryError;
pub use handoff::{HandoffAction, HandoffChunk, HandoffManager};
pub use membership::{
    ClusterMember, MembershipVersion, MembershipView, SharedMembership, SiloStatus,
    SiloStatusListener,
};
pub use partition::{ActivationInfo, DirectoryPartition, GrainInfo, VersionSource};
pub use provider::{
    Providers, RandomProvider, TaskProvider, TimeError, TimeProvider, TokioProviders,
    TokioRandomProvider, TokioTaskProvider, TokioTimeProvider,
};
pub use remote::{
    CacheRefresh, DirectoryTransport, LoopbackTransport, RemoteDirectoryEndpoint,
    RemoteGrainDirectory,
};
pub use ring::DirectoryRing;
pub use service::{DirectoryStatus, LocalDirectory};
pub use silo::SiloAddress;
pub use stats::{DirectoryStatistics, StatisticsSnapshot};
pub use types::{
    ActivationAddress, ActivationId, AddressAndTag, GrainCategory, GrainId, GrainType,
    LookupResult, RegistrationStatus, UnregistrationCause, VersionTag,
};
