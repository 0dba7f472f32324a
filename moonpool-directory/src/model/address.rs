//! Activation addresses: which activation of which grain lives on which silo.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::entry::VersionTag;
use super::ids::{ActivationId, GrainId, SiloAddress};
use crate::error::ParseError;

/// Full address of one activation: grain identity + hosting silo + activation.
///
/// This is the value the directory stores. It tells a caller not only
/// *which* grain and *where* it lives, but *which activation* is registered,
/// so a stale registration can be told apart from the current one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationAddress {
    /// The grain this activation belongs to.
    pub grain: GrainId,
    /// The silo hosting the activation.
    pub silo: SiloAddress,
    /// Identifier of this specific activation.
    pub activation: ActivationId,
}

impl ActivationAddress {
    /// Create a new activation address.
    pub fn new(grain: GrainId, silo: SiloAddress, activation: ActivationId) -> Self {
        Self {
            grain,
            silo,
            activation,
        }
    }

    /// Same grain and same activation id (the silo is not compared).
    pub fn matches(&self, other: &ActivationAddress) -> bool {
        self.grain == other.grain && self.activation == other.activation
    }
}

impl fmt::Display for ActivationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} [{}]", self.grain, self.silo, self.activation)
    }
}

/// A single registered address together with the entry's version tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAndTag {
    /// The registered activation.
    pub address: ActivationAddress,
    /// Version of the directory entry holding it.
    pub version: VersionTag,
}

/// Every registered activation of a grain together with the entry's version.
///
/// Single-activation grains have exactly one address; multi-activation
/// grains may have several. An empty list never leaves the directory:
/// lookups return `None` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressesAndTag {
    /// Registered activations.
    pub addresses: Vec<ActivationAddress>,
    /// Version of the directory entry.
    pub version: VersionTag,
}

impl AddressesAndTag {
    /// The first registered address, which for single-activation grains is
    /// the authoritative one.
    pub fn primary(&self) -> Option<&ActivationAddress> {
        self.addresses.first()
    }
}

/// Flat, string-typed record exchanged with pluggable directory backends.
///
/// The key-value backend stores this record serialized as JSON, the table
/// backend stores its fields as columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GrainAddress {
    /// Encoded [`SiloAddress`].
    pub silo_address: String,
    /// Encoded [`GrainId`].
    pub grain_id: String,
    /// Encoded [`ActivationId`].
    pub activation_id: String,
}

impl From<&ActivationAddress> for GrainAddress {
    fn from(address: &ActivationAddress) -> Self {
        Self {
            silo_address: address.silo.to_string(),
            grain_id: address.grain.to_string(),
            activation_id: address.activation.to_string(),
        }
    }
}

impl TryFrom<&GrainAddress> for ActivationAddress {
    type Error = ParseError;

    fn try_from(address: &GrainAddress) -> Result<Self, Self::Error> {
        Ok(Self {
            grain: GrainId::parse(&address.grain_id)?,
            silo: SiloAddress::parse(&address.silo_address)?,
            activation: ActivationId::parse(&address.activation_id)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> ActivationAddress {
        ActivationAddress::new(
            GrainId::parse("user/42").expect("grain"),
            SiloAddress::parse("10.0.0.1:100@1").expect("silo"),
            ActivationId::new(0xA),
        )
    }

    #[test]
    fn test_matches_ignores_silo() {
        let a = address();
        let mut moved = a.clone();
        moved.silo = SiloAddress::parse("10.0.0.2:100@1").expect("silo");
        assert!(a.matches(&moved));
        assert_ne!(a, moved);

        let mut other = a.clone();
        other.activation = ActivationId::new(0xB);
        assert!(!a.matches(&other));
    }

    #[test]
    fn test_grain_address_json_layout() {
        let record = GrainAddress::from(&address());
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["GrainId"], "user/42");
        assert_eq!(json["SiloAddress"], "10.0.0.1:100@1");
        assert_eq!(json["ActivationId"], address().activation.to_string());
    }

    #[test]
    fn test_grain_address_converts_back() {
        let record = GrainAddress::from(&address());
        let parsed = ActivationAddress::try_from(&record).expect("convert");
        assert_eq!(parsed, address());
    }

    #[test]
    fn test_grain_address_with_garbage_fails() {
        let record = GrainAddress {
            silo_address: "not-a-silo".into(),
            grain_id: "user/42".into(),
            activation_id: "a".into(),
        };
        assert!(matches!(
            ActivationAddress::try_from(&record),
            Err(ParseError::InvalidSiloAddress(_))
        ));
    }
}
