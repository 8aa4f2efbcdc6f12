//! Error taxonomy shared by every layer of the resource core.
//!
//! Three families:
//!
//! 1. **Precondition errors** (`GpuError::UnknownBlock`, `StaleLease`, …):
//!    always returned synchronously to the caller.
//! 2. **Backend errors** ([`BackendError`]): raised by a graphics backend.
//!    The device manager and staging queue turn most of these into a
//!    fallback; GPU→CPU transfer failures are the exception and propagate.
//! 3. **Probe errors** ([`ProbeError`]): one variant per way a backend can
//!    fail to come up during selection.

use thiserror::Error;

use crate::backend::BackendKind;
use crate::memory::{BlockId, BufferKind};
use crate::sync::SyncId;
use crate::transfer::TransferId;

/// Result alias used across the workspace.
pub type GpuResult<T> = Result<T, GpuError>;

#[derive(Error, Debug)]
pub enum GpuError {
    #[error("Memory block not found: {0}")]
    UnknownBlock(BlockId),
    #[error("Memory block already freed: {0}")]
    BlockAlreadyFreed(BlockId),
    #[error("Memory block already registered: {0}")]
    DuplicateBlock(BlockId),
    #[error("Alignment {0} is not a power of two")]
    InvalidAlignment(u64),
    #[error("Invalid allocation size: {0}")]
    InvalidSize(u64),
    #[error("Cannot make room for {needed} bytes (only {available} reclaimable)")]
    InsufficientMemory { needed: u64, available: u64 },
    #[error("Defragmentation refused: {in_flight} GPU work item(s) in flight")]
    DefragmentBusy { in_flight: usize },
    #[error("Transfer {0} already in progress")]
    DuplicateTransfer(TransferId),
    #[error("Transfer of {requested} bytes exceeds staging buffer size {capacity}")]
    StagingCapacity { requested: usize, capacity: usize },
    #[error("Transfer {id} failed: {source}")]
    Transfer {
        id: TransferId,
        #[source]
        source: BackendError,
    },
    #[error("Sync point not found: {0}")]
    UnknownSyncPoint(SyncId),
    #[error("{kind} buffer released with a stale or unknown lease")]
    StaleLease { kind: BufferKind },
    #[error("Invalid buffer data: {0}")]
    InvalidBufferData(String),
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("{what} of {requested} exceeds device limit {max}")]
    LimitExceeded {
        what: &'static str,
        requested: u64,
        max: u64,
    },
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Failures raised by a concrete graphics backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend unavailable")]
    Unavailable,
    #[error("Invalid or foreign buffer handle: {0}")]
    InvalidHandle(u64),
    #[error("Buffer creation failed: {0}")]
    CreateBuffer(String),
    #[error("Upload failed: {0}")]
    Upload(String),
    #[error("Download failed: {0}")]
    Download(String),
    #[error("Draw failed: {0}")]
    Draw(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Why a backend probe did not yield a usable backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("{0} is not supported on this platform")]
    UnsupportedPlatform(BackendKind),
    #[error("No suitable {0} adapter found")]
    NoAdapter(BackendKind),
    #[error("Failed to request {kind} device: {reason}")]
    RequestDevice { kind: BackendKind, reason: String },
    #[error("{0} backend reported itself unavailable")]
    Unavailable(BackendKind),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_converts_into_gpu_error() {
        let err: GpuError = BackendError::Draw("lost device".into()).into();
        assert!(matches!(err, GpuError::Backend(BackendError::Draw(_))));
        assert_eq!(err.to_string(), "Backend error: Draw failed: lost device");
    }

    #[test]
    fn test_transfer_error_keeps_source() {
        use std::error::Error as _;
        let err = GpuError::Transfer {
            id: TransferId::new(),
            source: BackendError::Download("timeout".into()),
        };
        let source = err.source().expect("transfer error has a source");
        assert_eq!(source.to_string(), "Download failed: timeout");
    }

    #[test]
    fn test_probe_error_names_backend() {
        let err = ProbeError::NoAdapter(BackendKind::Vulkan);
        assert_eq!(err.to_string(), "No suitable vulkan adapter found");
    }
}
