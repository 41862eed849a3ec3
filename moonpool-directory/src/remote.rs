//! Directory-to-directory calls.
//!
//! Every forwarded operation and every handoff transfer goes through
//! [`RemoteGrainDirectory`], obtained from a [`DirectoryTransport`]. The
//! crate ships [`LoopbackTransport`], which connects directories living in
//! the same process; a networked transport implements the same trait and
//! serializes the serde-enabled payload types.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DirectoryError;
use crate::handoff::HandoffChunk;
use crate::provider::Providers;
use crate::service::WeakDirectory;
use crate::silo::SiloAddress;
use crate::types::{
    ActivationAddress, AddressAndTag, GrainId, LookupResult, UnregistrationCause, VersionTag,
};

/// Owner's answer to a cache validation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheRefresh {
    /// The cached version is still current.
    Unchanged(VersionTag),
    /// The entry changed since it was cached.
    Changed {
        /// Current activations.
        activations: Vec<ActivationAddress>,
        /// Current version.
        version: VersionTag,
    },
    /// The owner has no entry for the grain.
    Missing,
}

/// Operations one directory exposes to the others.
///
/// `hop_count` is the number of times the request has already been
/// forwarded; a directory forwarding a request passes `hop_count + 1`.
///
/// # Orleans Reference
///
/// Corresponds to Orleans' `IRemoteGrainDirectory`.
#[async_trait(?Send)]
pub trait RemoteGrainDirectory {
    /// Register one activation.
    ///
    /// Returns the activation the owner holds for the grain, which for a
    /// single-activation grain may differ from `address`, or `None` if the
    /// hosting silo is no longer viable.
    async fn register(
        &self,
        address: ActivationAddress,
        single_activation: bool,
        hop_count: u32,
    ) -> Result<Option<AddressAndTag>, DirectoryError>;

    /// Register a batch of activations, all of the same kind. Returns the
    /// registration result for each address, in order.
    async fn register_many(
        &self,
        addresses: Vec<ActivationAddress>,
        single_activation: bool,
        hop_count: u32,
    ) -> Result<Vec<Option<AddressAndTag>>, DirectoryError>;

    /// Unregister one activation.
    async fn unregister(
        &self,
        address: ActivationAddress,
        cause: UnregistrationCause,
        hop_count: u32,
    ) -> Result<(), DirectoryError>;

    /// Unregister a batch of activations.
    async fn unregister_many(
        &self,
        addresses: Vec<ActivationAddress>,
        cause: UnregistrationCause,
        hop_count: u32,
    ) -> Result<(), DirectoryError>;

    /// Look up a grain's activations.
    async fn lookup(&self, grain: GrainId, hop_count: u32) -> Result<LookupResult, DirectoryError>;

    /// Remove a grain and all its activations.
    async fn delete_grain(&self, grain: GrainId, hop_count: u32) -> Result<(), DirectoryError>;

    /// Validate cached entries against the owner's partition.
    async fn lookup_many(
        &self,
        grains: Vec<(GrainId, VersionTag)>,
    ) -> Result<Vec<(GrainId, CacheRefresh)>, DirectoryError>;

    /// Store a chunk of the sender's partition as a replica.
    async fn accept_handoff_partition(&self, chunk: HandoffChunk) -> Result<(), DirectoryError>;

    /// Drop the replica kept for `source`.
    async fn remove_handoff_partition(&self, source: SiloAddress) -> Result<(), DirectoryError>;

    /// Deactivate activations hosted on the receiving silo.
    async fn delete_activations(
        &self,
        activations: Vec<ActivationAddress>,
    ) -> Result<(), DirectoryError>;
}

/// Resolves the directory of another silo.
pub trait DirectoryTransport: fmt::Debug {
    /// The directory of `silo`.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::Unreachable`] if there is no route to the silo.
    fn directory(&self, silo: &SiloAddress) -> Result<Rc<dyn RemoteGrainDirectory>, DirectoryError>;
}

/// In-process transport connecting directories that share a thread.
///
/// Calls go straight to the target's [`RemoteDirectoryEndpoint`]. Detaching
/// a silo makes it unreachable, which is how tests simulate a crashed
/// process.
#[derive(Default)]
pub struct LoopbackTransport {
    endpoints: RefCell<HashMap<SiloAddress, Rc<dyn RemoteGrainDirectory>>>,
}

impl LoopbackTransport {
    /// Create a transport with no silo attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route calls for `silo` to `endpoint`.
    pub fn attach(&self, silo: SiloAddress, endpoint: Rc<dyn RemoteGrainDirectory>) {
        tracing::debug!(silo = %silo, "attaching directory endpoint");
        self.endpoints.borrow_mut().insert(silo, endpoint);
    }

    /// Stop routing calls for `silo`.
    pub fn detach(&self, silo: &SiloAddress) -> bool {
        tracing::debug!(silo = %silo, "detaching directory endpoint");
        self.endpoints.borrow_mut().remove(silo).is_some()
    }
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut silos: Vec<_> = self.endpoints.borrow().keys().cloned().collect();
        silos.sort();
        f.debug_struct("LoopbackTransport")
            .field("silos", &silos)
            .finish()
    }
}

impl DirectoryTransport for LoopbackTransport {
    fn directory(&self, silo: &SiloAddress) -> Result<Rc<dyn RemoteGrainDirectory>, DirectoryError> {
        self.endpoints
            .borrow()
            .get(silo)
            .cloned()
            .ok_or_else(|| DirectoryError::Unreachable { silo: silo.clone() })
    }
}

/// Serves [`RemoteGrainDirectory`] calls for one [`LocalDirectory`](crate::LocalDirectory).
///
/// Holds the directory weakly: the directory owns its transport, and the
/// transport owns the endpoints. Calls made after the directory was dropped
/// fail with [`DirectoryError::Unreachable`].
pub struct RemoteDirectoryEndpoint<P: Providers> {
    silo: SiloAddress,
    directory: WeakDirectory<P>,
}

impl<P: Providers> RemoteDirectoryEndpoint<P> {
    pub(crate) fn new(silo: SiloAddress, directory: WeakDirectory<P>) -> Self {
        Self { silo, directory }
    }

    fn directory(&self) -> Result<crate::service::LocalDirectory<P>, DirectoryError> {
        self.directory
            .upgrade()
            .ok_or_else(|| DirectoryError::Unreachable {
                silo: self.silo.clone(),
            })
    }
}

impl<P: Providers> fmt::Debug for RemoteDirectoryEndpoint<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDirectoryEndpoint")
            .field("silo", &self.silo)
            .finish()
    }
}

#[async_trait(?Send)]
impl<P: Providers> RemoteGrainDirectory for RemoteDirectoryEndpoint<P> {
    async fn register(
        &self,
        address: ActivationAddress,
        single_activation: bool,
        hop_count: u32,
    ) -> Result<Option<AddressAndTag>, DirectoryError> {
        self.directory()?
            .register_with_hops(address, single_activation, hop_count)
            .await
    }

    async fn register_many(
        &self,
        addresses: Vec<ActivationAddress>,
        single_activation: bool,
        hop_count: u32,
    ) -> Result<Vec<Option<AddressAndTag>>, DirectoryError> {
        self.directory()?
            .register_many_with_hops(addresses, single_activation, hop_count)
            .await
    }

    async fn unregister(
        &self,
        address: ActivationAddress,
        cause: UnregistrationCause,
        hop_count: u32,
    ) -> Result<(), DirectoryError> {
        self.directory()?
            .unregister_with_hops(address, cause, hop_count)
            .await
    }

    async fn unregister_many(
        &self,
        addresses: Vec<ActivationAddress>,
        cause: UnregistrationCause,
        hop_count: u32,
    ) -> Result<(), DirectoryError> {
        self.directory()?
            .unregister_many_with_hops(addresses, cause, hop_count)
            .await
    }

    async fn lookup(&self, grain: GrainId, hop_count: u32) -> Result<LookupResult, DirectoryError> {
        self.directory()?.lookup_with_hops(grain, hop_count).await
    }

    async fn delete_grain(&self, grain: GrainId, hop_count: u32) -> Result<(), DirectoryError> {
        self.directory()?.delete_grain_with_hops(grain, hop_count).await
    }

    async fn lookup_many(
        &self,
        grains: Vec<(GrainId, VersionTag)>,
    ) -> Result<Vec<(GrainId, CacheRefresh)>, DirectoryError> {
        Ok(self.directory()?.lookup_many(grains))
    }

    async fn accept_handoff_partition(&self, chunk: HandoffChunk) -> Result<(), DirectoryError> {
        self.directory()?.accept_handoff_partition(chunk);
        Ok(())
    }

    async fn remove_handoff_partition(&self, source: SiloAddress) -> Result<(), DirectoryError> {
        self.directory()?.handoff().remove_handoff_partition(&source);
        Ok(())
    }

    async fn delete_activations(
        &self,
        activations: Vec<ActivationAddress>,
    ) -> Result<(), DirectoryError> {
        self.directory()?.delete_local_activations(activations);
        Ok(())
    }
}
