//! Keys and values of the grain directory.

pub(crate) mod address;
pub(crate) mod entry;
pub(crate) mod ids;

pub use address::{ActivationAddress, AddressAndTag, AddressesAndTag, GrainAddress};
pub use entry::{DirectoryEntry, OperationResult, VersionTag};
pub use ids::{ActivationId, GrainId, GrainType, SiloAddress};
