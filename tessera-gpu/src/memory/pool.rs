//! Buffer pools and leases.
//!
//! ```text
//!  acquire ──▶ pop idle (reused) or create (created) ──▶ issue Lease
//!                                                          │
//!             live table: lease id ──▶ Weak<token> ◀───────┘
//!                                                          │
//!  release ──▶ end lease ──▶ push idle (or destroy) ◀──────┘
//! ```
//!
//! A lease is the record of one hand-out. The buffer carries the strong
//! token; the pool only observes it through a `Weak`. If the buffer is
//! dropped without being released, the `Weak` dies and the next leak
//! check counts it.

use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;
use serde::Serialize;
use tessera_core::{BufferKind, BufferStats, BufferUsage, GpuResult};

use crate::backend::GpuBackend;
use crate::buffers::{GpuBuffer, IndexBuffer, UniformBuffer, UniformLayout, VertexBuffer};

// ───────────────────────────────────────────────────────────────────
// Lease
// ───────────────────────────────────────────────────────────────────

/// One hand-out of a pooled buffer.
#[derive(Debug)]
pub struct Lease {
    id: u64,
    token: Arc<()>,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.id
    }
}

// ───────────────────────────────────────────────────────────────────
// Poolable buffers
// ───────────────────────────────────────────────────────────────────

/// A buffer type the allocator can pool.
pub trait PoolBuffer: Sized {
    type Elem: crate::buffers::BufferElement;
    type Data: ?Sized;

    const KIND: BufferKind;

    fn create(backend: Arc<dyn GpuBackend>, data: &Self::Data, usage: BufferUsage) -> GpuResult<Self>;

    /// Reload a reused buffer with new contents.
    fn refill(&mut self, data: &Self::Data, usage: BufferUsage) -> GpuResult<()>;

    /// Bytes `data` will occupy once uploaded.
    fn data_size(data: &Self::Data) -> u64;

    fn buffer(&self) -> &GpuBuffer<Self::Elem>;

    fn buffer_mut(&mut self) -> &mut GpuBuffer<Self::Elem>;

    fn pool(pools: &mut PoolSet) -> &mut BufferPool<Self>;
}

impl PoolBuffer for VertexBuffer {
    type Elem = f32;
    type Data = [f32];

    const KIND: BufferKind = BufferKind::Vertex;

    fn create(backend: Arc<dyn GpuBackend>, data: &[f32], usage: BufferUsage) -> GpuResult<Self> {
        VertexBuffer::new(backend, data.to_vec(), usage)
    }

    fn refill(&mut self, data: &[f32], usage: BufferUsage) -> GpuResult<()> {
        self.set_usage(usage);
        self.update_data(data)
    }

    fn data_size(data: &[f32]) -> u64 {
        std::mem::size_of_val(data) as u64
    }

    fn buffer(&self) -> &GpuBuffer<f32> {
        self
    }

    fn buffer_mut(&mut self) -> &mut GpuBuffer<f32> {
        self
    }

    fn pool(pools: &mut PoolSet) -> &mut BufferPool<Self> {
        &mut pools.vertex
    }
}

impl PoolBuffer for IndexBuffer {
    type Elem = u32;
    type Data = [u32];

    const KIND: BufferKind = BufferKind::Index;

    fn create(backend: Arc<dyn GpuBackend>, data: &[u32], usage: BufferUsage) -> GpuResult<Self> {
        IndexBuffer::new(backend, data.to_vec(), usage)
    }

    fn refill(&mut self, data: &[u32], usage: BufferUsage) -> GpuResult<()> {
        self.set_usage(usage);
        self.update_data(data)
    }

    fn data_size(data: &[u32]) -> u64 {
        std::mem::size_of_val(data) as u64
    }

    fn buffer(&self) -> &GpuBuffer<u32> {
        self
    }

    fn buffer_mut(&mut self) -> &mut GpuBuffer<u32> {
        self
    }

    fn pool(pools: &mut PoolSet) -> &mut BufferPool<Self> {
        &mut pools.index
    }
}

impl PoolBuffer for UniformBuffer {
    type Elem = f32;
    type Data = UniformLayout;

    const KIND: BufferKind = BufferKind::Uniform;

    fn create(backend: Arc<dyn GpuBackend>, data: &UniformLayout, usage: BufferUsage) -> GpuResult<Self> {
        UniformBuffer::new(backend, data, usage)
    }

    fn refill(&mut self, data: &UniformLayout, usage: BufferUsage) -> GpuResult<()> {
        self.set_usage(usage);
        self.set_layout(data)
    }

    fn data_size(data: &UniformLayout) -> u64 {
        data.iter().map(|(_, v)| v.rows() as u64 * 16).sum()
    }

    fn buffer(&self) -> &GpuBuffer<f32> {
        self
    }

    fn buffer_mut(&mut self) -> &mut GpuBuffer<f32> {
        self
    }

    fn pool(pools: &mut PoolSet) -> &mut BufferPool<Self> {
        &mut pools.uniform
    }
}

// ───────────────────────────────────────────────────────────────────
// Pool
// ───────────────────────────────────────────────────────────────────

/// Free lists keyed by usage, the live-lease table and the counters for
/// one buffer kind.
pub struct BufferPool<B> {
    free: FxHashMap<BufferUsage, Vec<B>>,
    live: FxHashMap<u64, Weak<()>>,
    next_lease: u64,
    pub(crate) stats: BufferStats,
}

impl<B: PoolBuffer> BufferPool<B> {
    pub fn new() -> Self {
        Self {
            free: FxHashMap::default(),
            live: FxHashMap::default(),
            next_lease: 1,
            stats: BufferStats::default(),
        }
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    pub fn idle_len(&self, usage: BufferUsage) -> usize {
        self.free.get(&usage).map_or(0, Vec::len)
    }

    pub fn idle_total(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    pub fn live_leases(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn pop_idle(&mut self, usage: BufferUsage) -> Option<B> {
        self.free.get_mut(&usage).and_then(Vec::pop)
    }

    pub(crate) fn push_idle(&mut self, usage: BufferUsage, buffer: B) {
        self.free.entry(usage).or_default().push(buffer);
    }

    pub(crate) fn issue_lease(&mut self) -> Lease {
        let id = self.next_lease;
        self.next_lease += 1;
        let token = Arc::new(());
        self.live.insert(id, Arc::downgrade(&token));
        Lease { id, token }
    }

    /// End a lease. `false` if it was not live here.
    ///
    /// The id alone is not enough: another pool may have handed out the
    /// same number, so the token must be the one this pool recorded.
    pub(crate) fn end_lease(&mut self, lease: Lease) -> bool {
        let ours = self
            .live
            .get(&lease.id)
            .is_some_and(|recorded| recorded.ptr_eq(&Arc::downgrade(&lease.token)));
        if ours {
            self.live.remove(&lease.id);
        }
        ours
    }

    /// Drop live leases whose buffer is gone. Returns how many.
    pub(crate) fn reconcile(&mut self) -> u64 {
        let before = self.live.len();
        self.live.retain(|_, token| token.strong_count() > 0);
        let leaked = (before - self.live.len()) as u64;
        self.stats.leaked += leaked;
        self.stats.active = self.stats.active.saturating_sub(leaked);
        leaked
    }

    /// Move every idle buffer onto `backend`; buffers that fail to move
    /// are destroyed.
    pub(crate) fn migrate(&mut self, backend: &Arc<dyn GpuBackend>) -> usize {
        let mut moved = 0;
        for list in self.free.values_mut() {
            list.retain_mut(|buf| match buf.buffer_mut().rebind_backend(backend.clone()) {
                Ok(()) => {
                    moved += 1;
                    true
                }
                Err(e) => {
                    log::warn!("Dropping idle {} buffer that failed to migrate: {}", B::KIND, e);
                    false
                }
            });
        }
        moved
    }

    /// Destroy all idle buffers and forget every lease.
    pub(crate) fn clear(&mut self) {
        for list in self.free.values_mut() {
            for mut buf in list.drain(..) {
                buf.buffer_mut().cleanup();
            }
        }
        self.free.clear();
        self.live.clear();
        self.stats = BufferStats::default();
    }
}

impl<B: PoolBuffer> Default for BufferPool<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// The three pools.
#[derive(Default)]
pub struct PoolSet {
    pub vertex: BufferPool<VertexBuffer>,
    pub index: BufferPool<IndexBuffer>,
    pub uniform: BufferPool<UniformBuffer>,
}

impl PoolSet {
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            vertex: self.vertex.stats(),
            index: self.index.stats(),
            uniform: self.uniform.stats(),
        }
    }

    pub fn sizes(&self) -> PoolSizes {
        PoolSizes {
            vertex: self.vertex.idle_total(),
            index: self.index.idle_total(),
            uniform: self.uniform.idle_total(),
        }
    }
}

/// Per-kind pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub vertex: BufferStats,
    pub index: BufferStats,
    pub uniform: BufferStats,
}

impl PoolStats {
    pub fn get(&self, kind: BufferKind) -> BufferStats {
        match kind {
            BufferKind::Vertex => self.vertex,
            BufferKind::Index => self.index,
            BufferKind::Uniform => self.uniform,
        }
    }
}

/// Idle buffers per kind, across all usages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolSizes {
    pub vertex: usize,
    pub index: usize,
    pub uniform: usize,
}

/// Result of a leak check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    /// Buffers still handed out after reconciliation.
    pub active_buffers: u64,
    /// Live leases whose buffer still exists.
    pub tracked_references: usize,
    /// Leaks found by this check.
    pub leaks_detected: u64,
    /// Leaks found since the last cleanup.
    pub total_leaked: u64,
    pub pool_sizes: PoolSizes,
}

// ===================================================================
// Tests
// ===================================================================
