//! CPU↔GPU transfer requests.
//!
//! A request is created by the caller, queued on the staging manager, gets
//! exactly one execution attempt and then leaves the active set whether it
//! succeeded or not. Retrying is the caller's business.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique id of a transfer request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TransferId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferDirection {
    CpuToGpu,
    GpuToCpu,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::CpuToGpu => f.write_str("cpu_to_gpu"),
            TransferDirection::GpuToCpu => f.write_str("gpu_to_cpu"),
        }
    }
}

/// Transfer payload.
///
/// For downloads the variant doubles as the shape the bytes are rebuilt
/// into once they arrive.
#[derive(Clone, Debug, PartialEq)]
pub enum TransferData {
    Bytes(Vec<u8>),
    Floats(Vec<f32>),
    Ints(Vec<i32>),
}

impl TransferData {
    /// Native-endian byte view of the payload.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TransferData::Bytes(b) => b,
            TransferData::Floats(f) => bytemuck::cast_slice(f),
            TransferData::Ints(i) => bytemuck::cast_slice(i),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Rebuild a payload of the same shape as `self` from raw bytes.
    ///
    /// Trailing bytes that do not complete a 4-byte element are dropped.
    pub fn reshape_from(&self, bytes: &[u8]) -> TransferData {
        match self {
            TransferData::Bytes(_) => TransferData::Bytes(bytes.to_vec()),
            TransferData::Floats(_) => {
                let whole = bytes.len() - bytes.len() % 4;
                TransferData::Floats(bytemuck::pod_collect_to_vec(&bytes[..whole]))
            }
            TransferData::Ints(_) => {
                let whole = bytes.len() - bytes.len() % 4;
                TransferData::Ints(bytemuck::pod_collect_to_vec(&bytes[..whole]))
            }
        }
    }
}

/// Completion callback, invoked once with the finished request.
pub type TransferCallback = Box<dyn FnOnce(&TransferRequest) + Send + 'static>;

/// A queued data transfer.
pub struct TransferRequest {
    pub id: TransferId,
    /// Bytes to move.
    pub size: usize,
    pub direction: TransferDirection,
    /// Higher drains first.
    pub priority: i32,
    pub data: TransferData,
    pub callback: Option<TransferCallback>,
}

impl TransferRequest {
    /// CPU→GPU request sized to its payload.
    pub fn upload(data: TransferData) -> Self {
        Self {
            id: TransferId::new(),
            size: data.byte_len(),
            direction: TransferDirection::CpuToGpu,
            priority: 0,
            data,
            callback: None,
        }
    }

    /// GPU→CPU request for `size` bytes, rebuilt into the shape of `shape`.
    pub fn download(size: usize, shape: TransferData) -> Self {
        Self {
            id: TransferId::new(),
            size,
            direction: TransferDirection::GpuToCpu,
            priority: 0,
            data: shape,
            callback: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_id(mut self, id: TransferId) -> Self {
        self.id = id;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&TransferRequest) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("direction", &self.direction)
            .field("priority", &self.priority)
            .field("data_len", &self.data.byte_len())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

// ===================================================================
// Tests
// ===================================================================
