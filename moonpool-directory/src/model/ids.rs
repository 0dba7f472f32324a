//! Identity types: grains, silos and activations.
//!
//! Every type here has a canonical string encoding (its `Display` output)
//! that round-trips through the matching `parse` function. The encodings are
//! what the directory stores and what pluggable backends persist, so they
//! must stay stable.
//!
//! | Type | Encoding | Example |
//! |------|----------|---------|
//! | [`GrainId`] | `type/key` | `user/42` |
//! | [`SiloAddress`] | `ip:port@generation` | `10.0.0.1:100@1` |
//! | [`ActivationId`] | hex, up to 32 digits | `0000…002a` |

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// The type of a grain, e.g. `user` or `bank-account`.
///
/// The directory resolver routes by grain type: every grain of the same
/// type is served by the same directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GrainType(String);

impl GrainType {
    /// Create a grain type from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The type name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GrainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Location-independent identity of a grain: type + key.
///
/// Immutable and compared structurally. This is the directory's key.
///
/// # Examples
///
/// ```
/// use moonpool_directory::GrainId;
///
/// let id = GrainId::parse("user/42").expect("valid grain id");
/// assert_eq!(id.grain_type().as_str(), "user");
/// assert_eq!(id.key(), "42");
/// assert_eq!(id.to_string(), "user/42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GrainId {
    grain_type: GrainType,
    key: String,
}

impl GrainId {
    /// Create a grain id from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidGrainId`] if the type is empty or contains
    /// a `/` (the type/key separator), or if the key is empty.
    pub fn new(grain_type: impl Into<String>, key: impl Into<String>) -> Result<Self, ParseError> {
        let grain_type = grain_type.into();
        let key = key.into();
        if grain_type.is_empty() || grain_type.contains('/') || key.is_empty() {
            return Err(ParseError::InvalidGrainId(format!("{grain_type}/{key}")));
        }
        Ok(Self {
            grain_type: GrainType(grain_type),
            key,
        })
    }

    /// Parse the `type/key` encoding. The key may itself contain `/`.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let (grain_type, key) = s
            .split_once('/')
            .ok_or_else(|| ParseError::InvalidGrainId(s.to_string()))?;
        Self::new(grain_type, key)
    }

    /// The grain type.
    pub fn grain_type(&self) -> &GrainType {
        &self.grain_type
    }

    /// The key within the type.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.grain_type, self.key)
    }
}

/// Address of a cluster member (silo).
///
/// The generation distinguishes a restarted process that reuses the same
/// network address: `10.0.0.1:100@1` and `10.0.0.1:100@2` are different
/// silos, and entries hosted on the first are stale once the second joins.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiloAddress {
    /// IP address (IPv4 or IPv6).
    pub ip: IpAddr,
    /// Port number.
    pub port: u16,
    /// Process generation at this address.
    pub generation: u32,
}

impl SiloAddress {
    /// Create a new silo address.
    pub fn new(ip: IpAddr, port: u16, generation: u32) -> Self {
        Self {
            ip,
            port,
            generation,
        }
    }

    /// Parse the `ip:port@generation` encoding.
    ///
    /// IPv6 addresses use bracket notation: `[::1]:4500@3`.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidSiloAddress(s.to_string());

        let (endpoint, generation) = s.rsplit_once('@').ok_or_else(invalid)?;
        let generation: u32 = generation.parse().map_err(|_| invalid())?;

        let (ip_str, port_str) = if let Some(rest) = endpoint.strip_prefix('[') {
            let (ip, port) = rest.split_once("]:").ok_or_else(invalid)?;
            (ip, port)
        } else {
            endpoint.rsplit_once(':').ok_or_else(invalid)?
        };
        let ip: IpAddr = ip_str.parse().map_err(|_| invalid())?;
        let port: u16 = port_str.parse().map_err(|_| invalid())?;

        Ok(Self::new(ip, port, generation))
    }

    /// Same network endpoint, ignoring the generation.
    pub fn same_endpoint(&self, other: &SiloAddress) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}@{}", ip, self.port, self.generation),
            IpAddr::V6(ip) => write!(f, "[{}]:{}@{}", ip, self.port, self.generation),
        }
    }
}

/// Identifier of one concrete activation of a grain.
///
/// A grain that is deactivated and activated again (on the same silo or
/// elsewhere) gets a fresh `ActivationId`, which is how the directory tells
/// a stale registration from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActivationId(pub u128);

impl ActivationId {
    /// Create an activation id from a raw value.
    pub fn new(id: u128) -> Self {
        Self(id)
    }

    /// Generate a random activation id.
    pub fn new_random() -> Self {
        Self(rand::random::<u128>())
    }

    /// Parse a hexadecimal activation id (1 to 32 digits, any case).
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() || s.len() > 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseError::InvalidActivationId(s.to_string()));
        }
        u128::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| ParseError::InvalidActivationId(s.to_string()))
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}
