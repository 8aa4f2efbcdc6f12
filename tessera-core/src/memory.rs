//! Memory-block and buffer-pool records.
//!
//! These are data only. The allocator and residency manager in
//! `tessera-gpu` own every mutation.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

// ───────────────────────────────────────────────────────────────────
// Identifiers
// ───────────────────────────────────────────────────────────────────

/// Identifier of a memory block.
///
/// Allocator-issued ids look like `block-42`; residency ids are whatever
/// the caller registers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(String);

impl BlockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for BlockId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for BlockId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ───────────────────────────────────────────────────────────────────
// Memory block
// ───────────────────────────────────────────────────────────────────

/// Whether a block is currently backed by GPU-accessible storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResidencyState {
    Resident,
    Evicted,
}

/// A block of GPU-adjacent memory.
///
/// `address` is opaque bookkeeping: it is never dereferenced, only used to
/// reason about overlap and compaction.
#[derive(Clone, Debug)]
pub struct MemoryBlock {
    pub id: BlockId,
    /// Size in bytes.
    pub size: u64,
    /// Free-form usage tag (`"general"`, `"vertex"`, `"static"`, …).
    pub usage: String,
    pub alignment: u64,
    pub address: u64,
    /// `false` once deallocated; the entry lingers until defragmentation.
    pub allocated: bool,
    /// Eviction priority: higher is kept longer.
    pub priority: i32,
    pub last_accessed: Instant,
    pub access_count: u64,
    pub state: ResidencyState,
}

impl MemoryBlock {
    pub fn new(id: impl Into<BlockId>, size: u64, usage: impl Into<String>, alignment: u64) -> Self {
        Self {
            id: id.into(),
            size,
            usage: usage.into(),
            alignment,
            address: 0,
            allocated: false,
            priority: 0,
            last_accessed: Instant::now(),
            access_count: 0,
            state: ResidencyState::Resident,
        }
    }

    /// One past the last byte covered by this block.
    #[inline]
    pub fn end(&self) -> u64 {
        self.address + self.size
    }

    /// Half-open range overlap test on `[address, address + size)`.
    #[inline]
    pub fn overlaps(&self, other: &MemoryBlock) -> bool {
        self.address < other.end() && other.address < self.end()
    }

    #[inline]
    pub fn is_resident(&self) -> bool {
        self.state == ResidencyState::Resident
    }
}

// ───────────────────────────────────────────────────────────────────
// Buffer kinds and usage
// ───────────────────────────────────────────────────────────────────

/// The three pooled buffer families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferKind {
    Vertex,
    Index,
    Uniform,
}

impl BufferKind {
    pub const ALL: [BufferKind; 3] = [BufferKind::Vertex, BufferKind::Index, BufferKind::Uniform];

    pub fn as_str(self) -> &'static str {
        match self {
            BufferKind::Vertex => "vertex",
            BufferKind::Index => "index",
            BufferKind::Uniform => "uniform",
        }
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How often the CPU rewrites a buffer. Also the free-list key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferUsage {
    Static,
    #[default]
    Dynamic,
    Stream,
}

impl BufferUsage {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferUsage::Static => "static",
            BufferUsage::Dynamic => "dynamic",
            BufferUsage::Stream => "stream",
        }
    }

    /// Lenient parse: anything unrecognised is treated as dynamic.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl FromStr for BufferUsage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Ok(BufferUsage::Static),
            "dynamic" => Ok(BufferUsage::Dynamic),
            "stream" => Ok(BufferUsage::Stream),
            other => Err(format!("unknown buffer usage '{other}'")),
        }
    }
}

impl fmt::Display for BufferUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool counters for one buffer kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub created: u64,
    pub reused: u64,
    pub active: u64,
    pub leaked: u64,
}

// ===================================================================
// Tests
// ===================================================================
