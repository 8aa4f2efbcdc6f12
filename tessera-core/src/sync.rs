//! Synchronization-point records.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_SYNC_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique sync point id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncId(u64);

impl SyncId {
    /// Allocate the next id. Never repeats within a process.
    pub fn next() -> Self {
        Self(NEXT_SYNC_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncKind {
    Fence,
    Event,
    Semaphore,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarrierType {
    Read,
    Write,
    ReadWrite,
    All,
}

impl fmt::Display for BarrierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BarrierType::Read => "read",
            BarrierType::Write => "write",
            BarrierType::ReadWrite => "read_write",
            BarrierType::All => "all",
        };
        f.write_str(s)
    }
}

/// Opaque reference to a backend command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandBufferRef(pub u64);

#[derive(Clone, Debug, PartialEq)]
pub struct SyncPoint {
    pub id: SyncId,
    pub kind: SyncKind,
    pub barrier_type: BarrierType,
    pub is_signaled: bool,
    pub command_buffer: Option<CommandBufferRef>,
}

impl SyncPoint {
    pub fn new(kind: SyncKind, command_buffer: Option<CommandBufferRef>) -> Self {
        Self {
            id: SyncId::next(),
            kind,
            barrier_type: BarrierType::All,
            is_signaled: false,
            command_buffer,
        }
    }
}
