//! Directory entries and operation outcomes.
//!
//! [`DirectoryEntry`] is the flat wire/storage form of one registration.
//! Its `activation_address` field packs silo and activation into one string:
//!
//! ```text
//! 1,<activation id hex>,<silo address>
//! ^ format version
//! ```
//!
//! [`OperationResult`] is the outcome of a register or unregister attempt.
//! A lost registration race is a [`OperationResult::Redirect`], not an error.

use std::fmt;

use super::address::{ActivationAddress, AddressAndTag, AddressesAndTag};
use super::ids::{ActivationId, GrainId, SiloAddress};
use crate::error::{DirectoryError, ParseError};

const ENTRY_FORMAT_VERSION: &str = "1";

/// Optimistic-concurrency token of a directory entry.
///
/// Strictly increases on every successful mutation of the partition that
/// issued it. Entries coming from backends without version tags carry
/// [`VersionTag::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VersionTag(pub u64);

impl VersionTag {
    /// Tag of an entry with no version information.
    pub const NONE: VersionTag = VersionTag(0);

    /// The next tag.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Read a tag from an e-tag string, plain (`7`) or HTTP-style (`W/"7"`).
    /// Anything non-numeric is [`VersionTag::NONE`].
    pub fn from_etag(etag: &str) -> Self {
        let bare = etag.strip_prefix("W/").unwrap_or(etag);
        let bare = bare
            .strip_prefix('"')
            .and_then(|b| b.strip_suffix('"'))
            .unwrap_or(bare);
        bare.parse().map(Self).unwrap_or(Self::NONE)
    }

    /// The e-tag string for this tag (empty for [`VersionTag::NONE`]).
    pub fn to_etag(self) -> String {
        if self == Self::NONE {
            String::new()
        } else {
            self.0.to_string()
        }
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Wire/storage form of one registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirectoryEntry {
    /// Encoded grain id.
    pub grain_id: String,
    /// Encoded activation address (`1,<activation>,<silo>`).
    pub activation_address: String,
    /// Version tag observed or assigned by the directory.
    pub etag: String,
}

impl DirectoryEntry {
    /// Create an entry from raw parts.
    pub fn new(
        grain_id: impl Into<String>,
        activation_address: impl Into<String>,
        etag: impl Into<String>,
    ) -> Self {
        Self {
            grain_id: grain_id.into(),
            activation_address: activation_address.into(),
            etag: etag.into(),
        }
    }

    /// Encode an activation address with the given version tag.
    pub fn from_address(address: &ActivationAddress, version: VersionTag) -> Self {
        Self {
            grain_id: address.grain.to_string(),
            activation_address: format!(
                "{ENTRY_FORMAT_VERSION},{},{}",
                address.activation, address.silo
            ),
            etag: version.to_etag(),
        }
    }

    /// Decode the activation address.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidEntry`] when the packed field does not
    /// have three parts or carries an unknown format version, and the
    /// specific parse error when one of the parts is malformed.
    pub fn to_address(&self) -> Result<ActivationAddress, ParseError> {
        let invalid = |reason: &str| ParseError::InvalidEntry {
            entry: self.activation_address.clone(),
            reason: reason.to_string(),
        };

        let mut parts = self.activation_address.splitn(3, ',');
        let (Some(version), Some(activation), Some(silo)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("wrong format"));
        };
        if version != ENTRY_FORMAT_VERSION {
            return Err(invalid("unknown version"));
        }

        Ok(ActivationAddress {
            grain: GrainId::parse(&self.grain_id)?,
            silo: SiloAddress::parse(silo)?,
            activation: ActivationId::parse(activation)?,
        })
    }

    /// The version tag carried by this entry.
    pub fn version(&self) -> VersionTag {
        VersionTag::from_etag(&self.etag)
    }

    /// Decode into an address plus version tag.
    pub fn to_address_and_tag(&self) -> Result<AddressAndTag, ParseError> {
        Ok(AddressAndTag {
            address: self.to_address()?,
            version: self.version(),
        })
    }

    /// Decode into a one-element address list plus version tag.
    pub fn to_addresses_and_tag(&self) -> Result<AddressesAndTag, ParseError> {
        Ok(AddressesAndTag {
            addresses: vec![self.to_address()?],
            version: self.version(),
        })
    }
}

/// Outcome of a register or unregister attempt.
///
/// Match it exhaustively: the three cases mean different things to the
/// caller and none of them is "just an error".
#[derive(Debug)]
pub enum OperationResult {
    /// The operation took effect. `entry` is what is now stored (for
    /// register) or what was removed / found absent (for unregister).
    Success {
        /// The affected entry.
        entry: DirectoryEntry,
    },
    /// Another activation already owns the key. Nothing was changed.
    Redirect {
        /// The entry the caller submitted.
        entry: DirectoryEntry,
        /// The entry that is actually stored.
        actual: DirectoryEntry,
    },
    /// The operation could not be carried out.
    Failure {
        /// The entry the caller submitted.
        entry: DirectoryEntry,
        /// Why it failed.
        cause: DirectoryError,
    },
}

impl OperationResult {
    /// The entry the caller submitted (or, on success, the stored entry).
    pub fn entry(&self) -> &DirectoryEntry {
        match self {
            Self::Success { entry } | Self::Redirect { entry, .. } | Self::Failure { entry, .. } => {
                entry
            }
        }
    }

    /// The grain id this result is about.
    pub fn grain_id(&self) -> &str {
        &self.entry().grain_id
    }

    /// The authoritative entry after the operation, if any: the stored entry
    /// for a success, the winner for a redirect, nothing for a failure.
    pub fn authoritative(&self) -> Option<&DirectoryEntry> {
        match self {
            Self::Success { entry } => Some(entry),
            Self::Redirect { actual, .. } => Some(actual),
            Self::Failure { .. } => None,
        }
    }

    /// Convert into the authoritative entry or the failure cause.
    pub fn into_authoritative(self) -> Result<DirectoryEntry, DirectoryError> {
        match self {
            Self::Success { entry } => Ok(entry),
            Self::Redirect { actual, .. } => Ok(actual),
            Self::Failure { cause, .. } => Err(cause),
        }
    }

    /// `true` for [`OperationResult::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}
