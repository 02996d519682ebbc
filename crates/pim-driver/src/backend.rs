//! Backend abstraction for rank access
//!
//! The control plane never touches hardware directly. A backend moves one
//! command word per slice to the rank and reads the response words back,
//! and performs bulk memory copies. Platform-specific backends (DMA
//! interleaving, sysfs discovery) live outside this crate and plug in
//! through [`RankBackend`].

use crate::error::{PimError, Result};
use bytes::BytesMut;
use pim_ufi::DpuId;
use std::fmt::Debug;

/// Rank backend trait - the capability interface the control plane drives
///
/// Every call returns a coarse [`BackendStatus`]; the control plane maps it
/// into [`PimError`] with [`BackendStatus::into_result`].
pub trait RankBackend: Debug + Send {
    /// Write one command word per slice.
    ///
    /// `commands.len()` equals the number of slices of the rank.
    fn commit_commands(&mut self, commands: &[u64]) -> BackendStatus;

    /// Read the current response word of every slice into `results`.
    fn update_commands(&mut self, results: &mut [u64]) -> BackendStatus;

    /// Bulk copy host buffers into DPU memory.
    fn copy_to_rank(&mut self, xfer: &TransferDescriptor) -> BackendStatus;

    /// Bulk copy DPU memory into host buffers (buffers are pre-sized).
    fn copy_from_rank(&mut self, xfer: &mut TransferDescriptor) -> BackendStatus;

    /// Get backend type for debugging
    fn backend_type(&self) -> BackendType;
}

/// Coarse outcome of a backend call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    /// Call completed
    Success,
    /// Link to the rank failed
    CommunicationError,
    /// Backend-internal failure
    BackendError,
    /// Operating-system failure
    SystemError,
    /// Backend asked for a property it does not support
    InvalidProperty,
}

impl BackendStatus {
    /// Map into the control-plane error taxonomy.
    ///
    /// # Errors
    ///
    /// Returns `Driver` for communication and backend failures, `System`
    /// for OS failures and `Internal` for invalid properties.
    pub fn into_result(self, call: &str) -> Result<()> {
        match self {
            Self::Success => Ok(()),
            Self::CommunicationError => Err(PimError::driver(format!(
                "{call}: communication with rank failed"
            ))),
            Self::BackendError => Err(PimError::driver(format!("{call}: backend failure"))),
            Self::SystemError => Err(PimError::system(format!("{call}: system failure"))),
            Self::InvalidProperty => {
                Err(PimError::internal(format!("{call}: invalid backend property")))
            }
        }
    }
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// In-process rank simulator
    Simulated,

    /// Platform backend provided by the embedding application
    Hardware,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulated => write!(f, "Simulated"),
            Self::Hardware => write!(f, "Hardware"),
        }
    }
}

/// DPU memory addressed by a bulk copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegion {
    /// Working RAM (32-bit words)
    Wram,
}

/// One DPU's share of a bulk copy
#[derive(Debug, Clone)]
pub struct TransferBuffer {
    /// Target DPU
    pub dpu: DpuId,
    /// Little-endian bytes, a whole number of words
    pub data: BytesMut,
}

/// Bulk copy request handed to the backend
#[derive(Debug, Clone)]
pub struct TransferDescriptor {
    /// Memory region
    pub region: MemoryRegion,
    /// Offset in words from the start of the region
    pub offset: u32,
    /// Per-DPU buffers
    pub buffers: Vec<TransferBuffer>,
}

impl TransferDescriptor {
    /// WRAM copy starting at `offset` words.
    pub fn wram(offset: u32) -> Self {
        Self {
            region: MemoryRegion::Wram,
            offset,
            buffers: Vec::new(),
        }
    }

    /// Add a buffer for `dpu`.
    #[must_use]
    pub fn with_buffer(mut self, dpu: DpuId, data: BytesMut) -> Self {
        self.buffers.push(TransferBuffer { dpu, data });
        self
    }

    /// Total bytes moved by this descriptor.
    pub fn len_bytes(&self) -> usize {
        self.buffers.iter().map(|b| b.data.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(BackendStatus::Success.into_result("commit").is_ok());
        assert!(matches!(
            BackendStatus::CommunicationError.into_result("commit"),
            Err(PimError::Driver { .. })
        ));
        assert!(matches!(
            BackendStatus::BackendError.into_result("update"),
            Err(PimError::Driver { .. })
        ));
        assert!(matches!(
            BackendStatus::SystemError.into_result("copy"),
            Err(PimError::System { .. })
        ));
        assert!(matches!(
            BackendStatus::InvalidProperty.into_result("copy"),
            Err(PimError::Internal { .. })
        ));
    }

    #[test]
    fn descriptor_length() {
        let xfer = TransferDescriptor::wram(4)
            .with_buffer(DpuId::new(0, 0), BytesMut::zeroed(16))
            .with_buffer(DpuId::new(0, 1), BytesMut::zeroed(8));
        assert_eq!(xfer.len_bytes(), 24);
        assert_eq!(xfer.region, MemoryRegion::Wram);
    }
}
