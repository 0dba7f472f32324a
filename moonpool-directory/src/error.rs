//! Error types for the grain directory.
//!
//! Registration conflicts are not errors: a lost race is reported as
//! [`OperationResult::Redirect`](crate::OperationResult::Redirect) and a
//! mismatched unregister is a silent no-op. The types here cover everything
//! else.

use thiserror::Error;

use crate::model::{SiloAddress, VersionTag};

/// Errors decoding one of the canonical string encodings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Invalid grain id (expected `type/key`).
    #[error("Invalid grain id '{0}' (expected 'type/key')")]
    InvalidGrainId(String),

    /// Invalid silo address (expected `ip:port@generation`).
    #[error("Invalid silo address '{0}' (expected 'ip:port@generation')")]
    InvalidSiloAddress(String),

    /// Invalid activation id (expected up to 32 hex digits).
    #[error("Invalid activation id '{0}'")]
    InvalidActivationId(String),

    /// Invalid encoded activation address in a directory entry.
    #[error("Invalid directory entry '{entry}': {reason}")]
    InvalidEntry {
        /// The offending encoded field.
        entry: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Errors reported by an external store client (table or key-value store).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Insert-if-absent found an existing row/key.
    #[error("Entity already exists")]
    AlreadyExists,

    /// A conditional write found a different e-tag or value.
    #[error("Write condition not satisfied")]
    ConditionNotSatisfied,

    /// The row/key does not exist.
    #[error("Entity not found")]
    NotFound,

    /// The store could not be reached or rejected the call.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by a pluggable directory backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Store client failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Stored value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored value could not be decoded.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

impl BackendError {
    /// Whether retrying the same call may succeed.
    ///
    /// Only store unavailability is transient; decoding failures and
    /// unexpected conflicts will fail again.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Store(StoreError::Unavailable(_)))
    }
}

/// Errors surfaced by directory and locator operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Non-retriable backend failure.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Transient backend failures persisted through every retry.
    #[error("Backend call failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: BackendError,
    },

    /// A key or entry could not be decoded.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// The target silo is not active.
    #[error("Silo unavailable: {0}")]
    SiloUnavailable(SiloAddress),

    /// A forwarded request bounced between silos too many times.
    #[error("Too many hops ({hops}) routing request for {grain}")]
    TooManyHops {
        /// The grain being routed.
        grain: String,
        /// Hops taken.
        hops: u8,
    },

    /// A mutation presented a version tag the entry no longer has.
    #[error("Stale version {presented} for {grain} (current {current})")]
    StaleVersion {
        /// The grain being mutated.
        grain: String,
        /// Tag the caller presented.
        presented: VersionTag,
        /// Tag currently stored.
        current: VersionTag,
    },

    /// The directory has been stopped.
    #[error("Directory is not running")]
    NotRunning,

    /// No active silo could own the grain.
    #[error("No active silos in membership")]
    NoActiveSilos,

    /// The grain type is not served by any pluggable directory.
    #[error("No pluggable directory serves grain type '{0}'")]
    NoDirectory(String),

    /// Cross-silo call failed.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors detected while validating configuration at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A grain type (or the default) names a directory that is not registered.
    #[error("Grain type '{grain_type}' uses unknown directory '{name}'")]
    UnknownDirectory {
        /// Grain type declaring the directory (`*` for the default).
        grain_type: String,
        /// Directory name that was not found.
        name: String,
    },

    /// The same directory name was registered twice.
    #[error("Directory '{0}' registered more than once")]
    DuplicateDirectory(String),

    /// An option has an unusable value.
    #[error("Invalid option {option}: {reason}")]
    InvalidOption {
        /// Option name.
        option: &'static str,
        /// Why it is invalid.
        reason: String,
    },

    /// Several problems at once.
    #[error("{} configuration errors: {}", .0.len(), join(.0))]
    Multiple(Vec<ConfigError>),
}

impl ConfigError {
    /// Collapse a list of errors into one (or none).
    pub(crate) fn from_list(mut errors: Vec<ConfigError>) -> Result<(), ConfigError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Multiple(errors)),
        }
    }
}

fn join(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
