//! Hook into the silo's activation catalog.

use crate::membership::SiloStatus;
use crate::silo::SiloAddress;
use crate::types::ActivationAddress;

/// The part of the runtime that hosts activations on this silo.
///
/// The directory never deactivates anything itself. It tells the catalog
/// when a silo leaves, and asks it to drop activations that lost a
/// single-activation conflict.
///
/// # Orleans Reference
///
/// Corresponds to the `Catalog` callbacks used by Orleans' `LocalGrainDirectory`.
pub trait ActivationCatalog {
    /// Deactivate these activations, all hosted on this silo.
    fn delete_activations(&self, activations: Vec<ActivationAddress>);

    /// A silo is leaving the ring. Called before the directory updates its
    /// ring.
    fn silo_removed(&self, silo: &SiloAddress, status: SiloStatus);
}
