//! Error types for rank control operations

use pim_ufi::DpuId;
use thiserror::Error;

/// Result type alias for rank operations
pub type Result<T> = std::result::Result<T, PimError>;

/// Errors that can occur while driving a rank
#[derive(Debug, Error)]
pub enum PimError {
    /// Allocation or operating-system failure
    #[error("System error: {reason}")]
    System {
        /// Reason for failure
        reason: String,
    },

    /// Backend communication failure; the transaction was aborted
    #[error("Driver error: {reason}")]
    Driver {
        /// Reason for failure
        reason: String,
    },

    /// Read-back retry budget exhausted; the transaction was aborted
    #[error("Timeout after {attempts} read-back attempts")]
    Timeout {
        /// Read-back attempts performed
        attempts: u32,
    },

    /// A targeted DPU is already running
    #[error("DPU {dpu} is already running")]
    AlreadyRunning {
        /// First running DPU found
        dpu: DpuId,
    },

    /// A targeted DPU is disabled
    #[error("DPU {dpu} is disabled")]
    Disabled {
        /// Disabled DPU
        dpu: DpuId,
    },

    /// One or more DPUs reached the fault state
    #[error("{} DPU(s) in fault: {}", .dpus.len(), format_dpus(.dpus))]
    Fault {
        /// Faulted DPUs
        dpus: Vec<DpuId>,
    },

    /// Invariant violation inside the control plane
    #[error("Internal error: {reason}")]
    Internal {
        /// Violated invariant
        reason: String,
    },

    /// Rank configuration rejected at allocation
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Rejected setting
        reason: String,
    },
}

fn format_dpus(dpus: &[DpuId]) -> String {
    dpus.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl PimError {
    /// Create a system error
    pub fn system(reason: impl Into<String>) -> Self {
        Self::System {
            reason: reason.into(),
        }
    }

    /// Create a driver error
    pub fn driver(reason: impl Into<String>) -> Self {
        Self::Driver {
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Errors that abort a transaction and leave the wire state to a reset.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::System { .. } | Self::Driver { .. } | Self::Timeout { .. } | Self::Internal { .. }
        )
    }
}
