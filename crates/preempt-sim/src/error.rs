//! Error types for the simulation engine.

use thiserror::Error;

use crate::types::{HostId, VmId};

/// Result type for simulation operations.
pub type Result<T> = std::result::Result<T, SimError>;

/// Errors that can occur while building or running a simulation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    /// Invalid configuration, detected at construction time.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of why the configuration is invalid.
        reason: String,
    },

    /// A host ledger holds more capacity than the host supplies.
    #[error("host {host} over capacity: {in_use} in use, {capacity} total")]
    CapacityExceeded {
        /// Host whose ledger is inconsistent.
        host: HostId,
        /// Computed in-use total across all priority classes.
        in_use: f64,
        /// Total host capacity.
        capacity: f64,
    },

    /// Host not found in the pool.
    #[error("host not found: {host}")]
    HostNotFound {
        /// ID of the host that was not found.
        host: HostId,
    },

    /// VM not known to the datacenter.
    #[error("vm not found: {vm}")]
    VmNotFound {
        /// ID of the VM that was not found.
        vm: VmId,
    },

    /// Batch write to the snapshot store failed.
    #[error("persistence failed: {reason}")]
    Persistence {
        /// Description of the failure.
        reason: String,
    },

    /// Record could not be encoded or decoded.
    #[error("serialization failed: {reason}")]
    Serialization {
        /// Description of the failure.
        reason: String,
    },
}

impl SimError {
    /// Shorthand for an [`SimError::InvalidConfig`].
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns true if the simulation cannot continue after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

impl From<serde_json::Error> for SimError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            reason: err.to_string(),
        }
    }
}

impl From<std::io::Error> for SimError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence {
            reason: err.to_string(),
        }
    }
}
