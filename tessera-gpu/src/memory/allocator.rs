//! Block allocator and buffer pools.
//!
//! ```text
//!  base ─▶ ┌──────┬──────┬──────┬───────────┐
//!          │ b-1  │ b-2  │ b-3  │   free    │
//!          └──────┴──────┴──────┴───────────┘
//!                               ▲ next_free
//! ```
//!
//! Addresses are bump-allocated and never reused until `defragment`
//! compacts the live blocks back down to the base. Freed blocks stay in
//! the table so their range stays reserved.
//!
//! Defragmentation moves blocks, so it refuses to run while any
//! [`GpuWorkGuard`] is alive.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tessera_core::{
    AllocatorConfig, BlockId, BufferStats, BufferUsage, GpuError, GpuResult, MemoryBlock,
};

use super::pool::{LeakReport, PoolBuffer, PoolSet, PoolSizes, PoolStats};
use crate::backend::GpuBackend;
use crate::buffers::{IndexBuffer, UniformBuffer, UniformLayout, VertexBuffer};

/// Allocator statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AllocatorStats {
    pub total_blocks: usize,
    pub allocated_blocks: usize,
    pub freed_blocks: usize,
    pub total_memory_allocated: u64,
    pub total_memory_freed: u64,
    pub current_memory_usage: u64,
    /// `current / allocated * 100`, 0 before the first allocation.
    pub memory_efficiency: f64,
    pub buffers: PoolStats,
    pub defragmentation_ops: u64,
    pub gpu_work_in_flight: usize,
}

struct AllocatorState {
    /// Address → block.
    blocks: BTreeMap<u64, MemoryBlock>,
    /// Id → address.
    index: HashMap<BlockId, u64>,
    next_id: u64,
    next_free: u64,
    bytes_allocated: u64,
    bytes_freed: u64,
    defrag_ops: u64,
    in_flight: usize,
    pools: PoolSet,
    backend: Arc<dyn GpuBackend>,
}

pub struct MemoryAllocator {
    config: AllocatorConfig,
    state: Mutex<AllocatorState>,
}

/// Marks GPU work in flight. Defragmentation is refused while one lives.
#[must_use = "the guard only blocks defragmentation while it is alive"]
pub struct GpuWorkGuard<'a> {
    allocator: &'a MemoryAllocator,
}

impl Drop for GpuWorkGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.allocator.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

/// `None` when rounding up would run past the end of the address space.
fn align_up(value: u64, alignment: u64) -> Option<u64> {
    value.checked_add(alignment - 1).map(|v| v & !(alignment - 1))
}

impl MemoryAllocator {
    pub fn new(config: AllocatorConfig, backend: Arc<dyn GpuBackend>) -> Self {
        let base = config.base_address;
        Self {
            config,
            state: Mutex::new(AllocatorState {
                blocks: BTreeMap::new(),
                index: HashMap::new(),
                next_id: 1,
                next_free: base,
                bytes_allocated: 0,
                bytes_freed: 0,
                defrag_ops: 0,
                in_flight: 0,
                pools: PoolSet::default(),
                backend,
            }),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    // ───────────────────────────────────────────────────────────────
    // Blocks
    // ───────────────────────────────────────────────────────────────

    pub fn allocate(&self, size: u64, alignment: u64, usage: &str) -> GpuResult<MemoryBlock> {
        if size == 0 {
            return Err(GpuError::InvalidSize(size));
        }
        if !alignment.is_power_of_two() {
            return Err(GpuError::InvalidAlignment(alignment));
        }

        let mut state = self.state.lock();
        let address = align_up(state.next_free, alignment).ok_or(GpuError::InvalidAlignment(alignment))?;
        let end = address.checked_add(size).ok_or(GpuError::InvalidSize(size))?;

        let id = BlockId::new(format!("block-{}", state.next_id));
        state.next_id += 1;

        let mut block = MemoryBlock::new(id.clone(), size, usage, alignment);
        block.address = address;
        block.allocated = true;

        state.blocks.insert(address, block.clone());
        state.index.insert(id, address);
        state.next_free = end;
        state.bytes_allocated += size;

        log::debug!("Allocated {} bytes at {:#x} ({}) as {}", size, address, usage, block.id);
        Ok(block)
    }

    pub fn deallocate(&self, block: &MemoryBlock) -> GpuResult<()> {
        let mut state = self.state.lock();
        let address = *state
            .index
            .get(&block.id)
            .ok_or_else(|| GpuError::UnknownBlock(block.id.clone()))?;
        let entry = state
            .blocks
            .get_mut(&address)
            .ok_or_else(|| GpuError::UnknownBlock(block.id.clone()))?;
        if !entry.allocated {
            return Err(GpuError::BlockAlreadyFreed(block.id.clone()));
        }
        entry.allocated = false;
        let size = entry.size;
        state.bytes_freed += size;

        log::debug!("Deallocated {} ({} bytes at {:#x})", block.id, size, address);
        Ok(())
    }

    /// Current record for `id`.
    pub fn block(&self, id: &str) -> Option<MemoryBlock> {
        let state = self.state.lock();
        let address = state.index.get(id)?;
        state.blocks.get(address).cloned()
    }

    /// Compact allocated blocks down to the base address, dropping freed
    /// entries. Returns the blocks that moved, with their new addresses.
    pub fn defragment(&self) -> GpuResult<Vec<MemoryBlock>> {
        let mut state = self.state.lock();
        if state.in_flight > 0 {
            return Err(GpuError::DefragmentBusy {
                in_flight: state.in_flight,
            });
        }

        let old = std::mem::take(&mut state.blocks);
        let dropped = old.values().filter(|b| !b.allocated).count();
        state.index.clear();

        let mut next = self.config.base_address;
        let mut moved = Vec::new();
        for (_, mut block) in old.into_iter().filter(|(_, b)| b.allocated) {
            if block.address != next {
                block.address = next;
                moved.push(block.clone());
            }
            next += block.size;
            state.index.insert(block.id.clone(), block.address);
            state.blocks.insert(block.address, block);
        }
        state.next_free = next;
        state.defrag_ops += 1;

        log::info!(
            "Defragmented: {} block(s) moved, {} freed block(s) dropped, free pointer at {:#x}",
            moved.len(),
            dropped,
            next
        );
        Ok(moved)
    }

    pub fn begin_gpu_work(&self) -> GpuWorkGuard<'_> {
        self.state.lock().in_flight += 1;
        GpuWorkGuard { allocator: self }
    }

    pub fn gpu_work_in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    // ───────────────────────────────────────────────────────────────
    // Buffer pools
    // ───────────────────────────────────────────────────────────────

    pub fn allocate_vertex_buffer(&self, data: &[f32], usage: BufferUsage) -> GpuResult<VertexBuffer> {
        self.acquire::<VertexBuffer>(data, usage)
    }

    pub fn allocate_index_buffer(&self, data: &[u32], usage: BufferUsage) -> GpuResult<IndexBuffer> {
        self.acquire::<IndexBuffer>(data, usage)
    }

    pub fn allocate_uniform_buffer(&self, values: &UniformLayout, usage: BufferUsage) -> GpuResult<UniformBuffer> {
        self.acquire::<UniformBuffer>(values, usage)
    }

    fn acquire<B: PoolBuffer>(&self, data: &B::Data, usage: BufferUsage) -> GpuResult<B> {
        let mut state = self.state.lock();
        let backend = state.backend.clone();
        let reused = B::pool(&mut state.pools).pop_idle(usage);

        let mut buffer = match reused {
            Some(mut buf) => {
                let refreshed = if buf.buffer().is_on(&backend) {
                    Ok(())
                } else {
                    buf.buffer_mut().rebind_backend(backend.clone())
                };
                match refreshed.and_then(|()| buf.refill(data, usage)) {
                    Ok(()) => {
                        B::pool(&mut state.pools).stats.reused += 1;
                        log::debug!("Reused pooled {} buffer ({})", B::KIND, usage);
                        buf
                    }
                    Err(e) => {
                        log::warn!("Discarding pooled {} buffer that failed to refill: {}", B::KIND, e);
                        drop(buf);
                        let fresh = B::create(backend, data, usage)?;
                        B::pool(&mut state.pools).stats.created += 1;
                        fresh
                    }
                }
            }
            None => {
                let fresh = B::create(backend, data, usage)?;
                B::pool(&mut state.pools).stats.created += 1;
                log::debug!("Created {} buffer ({}, {} bytes)", B::KIND, usage, B::data_size(data));
                fresh
            }
        };

        let pool = B::pool(&mut state.pools);
        let lease = pool.issue_lease();
        pool.stats.active += 1;
        buffer.buffer_mut().set_lease(lease);
        Ok(buffer)
    }

    /// Return a buffer to its pool, or destroy it when the pool is full.
    ///
    /// Fails with `StaleLease` when the buffer was not handed out by this
    /// allocator or was already written off; the buffer is destroyed
    /// either way.
    pub fn release_buffer<B: PoolBuffer>(&self, mut buffer: B) -> GpuResult<()> {
        let mut state = self.state.lock();
        let backend = state.backend.clone();
        let max = self.config.max_pool_size;
        let pool = B::pool(&mut state.pools);

        let live = match buffer.buffer_mut().take_lease() {
            Some(lease) => pool.end_lease(lease),
            None => false,
        };
        if !live {
            buffer.buffer_mut().cleanup();
            return Err(GpuError::StaleLease { kind: B::KIND });
        }
        pool.stats.active = pool.stats.active.saturating_sub(1);

        let buf = buffer.buffer_mut();
        buf.unbind();
        let usage = buf.usage();
        if !buf.is_on(&backend) {
            if let Err(e) = buf.rebind_backend(backend) {
                log::warn!("Destroying released {} buffer that failed to migrate: {}", B::KIND, e);
                buf.cleanup();
                return Ok(());
            }
        }

        if pool.idle_len(usage) < max {
            pool.push_idle(usage, buffer);
            log::debug!("Released {} buffer to {} pool", B::KIND, usage);
        } else {
            buffer.buffer_mut().cleanup();
            log::debug!("{} pool for {} is full; destroyed released buffer", B::KIND, usage);
        }
        Ok(())
    }

    pub fn release_vertex_buffer(&self, buffer: VertexBuffer) -> GpuResult<()> {
        self.release_buffer(buffer)
    }

    pub fn release_index_buffer(&self, buffer: IndexBuffer) -> GpuResult<()> {
        self.release_buffer(buffer)
    }

    pub fn release_uniform_buffer(&self, buffer: UniformBuffer) -> GpuResult<()> {
        self.release_buffer(buffer)
    }

    /// Count buffers that were dropped while still handed out.
    pub fn check_for_leaks(&self) -> LeakReport {
        let mut state = self.state.lock();
        let pools = &mut state.pools;
        let leaks = pools.vertex.reconcile() + pools.index.reconcile() + pools.uniform.reconcile();
        let stats = pools.stats();
        let report = LeakReport {
            active_buffers: stats.vertex.active + stats.index.active + stats.uniform.active,
            tracked_references: pools.vertex.live_leases() + pools.index.live_leases() + pools.uniform.live_leases(),
            leaks_detected: leaks,
            total_leaked: stats.vertex.leaked + stats.index.leaked + stats.uniform.leaked,
            pool_sizes: pools.sizes(),
        };
        if leaks > 0 {
            log::warn!(
                "Detected {} leaked buffer(s): vertex={}, index={}, uniform={}",
                leaks,
                stats.vertex.leaked,
                stats.index.leaked,
                stats.uniform.leaked
            );
        }
        report
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.state.lock().pools.stats()
    }

    pub fn buffer_stats(&self, kind: tessera_core::BufferKind) -> BufferStats {
        self.pool_stats().get(kind)
    }

    pub fn pool_sizes(&self) -> PoolSizes {
        self.state.lock().pools.sizes()
    }

    pub fn get_stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        let allocated_blocks = state.blocks.values().filter(|b| b.allocated).count();
        let current = state.bytes_allocated.saturating_sub(state.bytes_freed);
        let memory_efficiency = if state.bytes_allocated > 0 {
            current as f64 / state.bytes_allocated as f64 * 100.0
        } else {
            0.0
        };
        AllocatorStats {
            total_blocks: state.blocks.len(),
            allocated_blocks,
            freed_blocks: state.blocks.len() - allocated_blocks,
            total_memory_allocated: state.bytes_allocated,
            total_memory_freed: state.bytes_freed,
            current_memory_usage: current,
            memory_efficiency,
            buffers: state.pools.stats(),
            defragmentation_ops: state.defrag_ops,
            gpu_work_in_flight: state.in_flight,
        }
    }

    /// Switch backends. Idle pooled buffers are rebuilt on the new one;
    /// buffers currently handed out move over when they are released.
    pub fn set_backend(&self, backend: Arc<dyn GpuBackend>) {
        let mut state = self.state.lock();
        state.backend = backend.clone();
        let moved =
            state.pools.vertex.migrate(&backend) + state.pools.index.migrate(&backend) + state.pools.uniform.migrate(&backend);
        log::info!("Allocator switched to {} backend ({} idle buffer(s) migrated)", backend.kind(), moved);
    }

    pub fn backend(&self) -> Arc<dyn GpuBackend> {
        self.state.lock().backend.clone()
    }

    /// Destroy pooled buffers and forget every block, lease and counter.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        state.pools.vertex.clear();
        state.pools.index.clear();
        state.pools.uniform.clear();
        state.blocks.clear();
        state.index.clear();
        state.next_id = 1;
        state.next_free = self.config.base_address;
        state.bytes_allocated = 0;
        state.bytes_freed = 0;
        state.defrag_ops = 0;
        log::debug!("Allocator cleaned up");
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use tessera_core::BufferKind;

    fn allocator() -> MemoryAllocator {
        MemoryAllocator::new(AllocatorConfig::default(), Arc::new(SoftwareBackend::new()))
    }

    #[test]
    fn test_addresses_are_aligned_and_ascending() {
        let alloc = allocator();
        let a = alloc.allocate(100, 1, "general").unwrap();
        let b = alloc.allocate(16, 64, "uniform").unwrap();
        assert_eq!(a.address, 0x1000);
        assert_eq!(b.address % 64, 0);
        assert!(b.address >= a.end());
        assert_eq!(a.id.as_str(), "block-1");
        assert_eq!(b.id.as_str(), "block-2");
    }

    #[test]
    fn test_bad_requests_are_rejected() {
        let alloc = allocator();
        assert!(matches!(alloc.allocate(0, 16, "x"), Err(GpuError::InvalidSize(0))));
        assert!(matches!(alloc.allocate(8, 3, "x"), Err(GpuError::InvalidAlignment(3))));
        assert!(matches!(alloc.allocate(8, 0, "x"), Err(GpuError::InvalidAlignment(0))));
    }

    #[test]
    fn test_double_deallocate_fails() {
        let alloc = allocator();
        let a = alloc.allocate(32, 16, "general").unwrap();
        alloc.deallocate(&a).unwrap();
        assert!(matches!(alloc.deallocate(&a), Err(GpuError::BlockAlreadyFreed(_))));
        let stranger = MemoryBlock::new("nope", 8, "general", 8);
        assert!(matches!(alloc.deallocate(&stranger), Err(GpuError::UnknownBlock(_))));
    }

    #[test]
    fn test_freed_range_is_not_reused_before_defragment() {
        let alloc = allocator();
        let a = alloc.allocate(0x100, 16, "general").unwrap();
        alloc.deallocate(&a).unwrap();
        let b = alloc.allocate(0x100, 16, "general").unwrap();
        assert_eq!(b.address, a.end());
        assert!(!alloc.block("block-1").unwrap().allocated);
    }

    #[test]
    fn test_defragment_refused_while_work_in_flight() {
        let alloc = allocator();
        alloc.allocate(64, 16, "general").unwrap();
        let guard = alloc.begin_gpu_work();
        assert!(matches!(alloc.defragment(), Err(GpuError::DefragmentBusy { in_flight: 1 })));
        drop(guard);
        assert_eq!(alloc.gpu_work_in_flight(), 0);
        assert!(alloc.defragment().is_ok());
    }

    #[test]
    fn test_stats_track_efficiency() {
        let alloc = allocator();
        assert_eq!(alloc.get_stats().memory_efficiency, 0.0);
        let a = alloc.allocate(300, 4, "general").unwrap();
        alloc.allocate(100, 4, "general").unwrap();
        alloc.deallocate(&a).unwrap();
        let stats = alloc.get_stats();
        assert_eq!(stats.total_blocks, 2);
        assert_eq!(stats.freed_blocks, 1);
        assert_eq!(stats.current_memory_usage, 100);
        assert!((stats.memory_efficiency - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_pool_reuses_by_usage() {
        let alloc = allocator();
        let vb = alloc.allocate_vertex_buffer(&[0.0; 10], BufferUsage::Static).unwrap();
        alloc.release_vertex_buffer(vb).unwrap();

        let other = alloc.allocate_vertex_buffer(&[1.0; 10], BufferUsage::Stream).unwrap();
        let same = alloc.allocate_vertex_buffer(&[2.0; 20], BufferUsage::Static).unwrap();
        let stats = alloc.buffer_stats(BufferKind::Vertex);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.active, 2);
        assert_eq!(same.data(), &[2.0; 20][..]);

        alloc.release_vertex_buffer(other).unwrap();
        alloc.release_vertex_buffer(same).unwrap();
        assert_eq!(alloc.pool_sizes().vertex, 2);
    }

    #[test]
    fn test_full_pool_destroys_released_buffer() {
        let config = AllocatorConfig {
            max_pool_size: 1,
            ..AllocatorConfig::default()
        };
        let alloc = MemoryAllocator::new(config, Arc::new(SoftwareBackend::new()));
        let a = alloc.allocate_index_buffer(&[0, 1, 2], BufferUsage::Static).unwrap();
        let b = alloc.allocate_index_buffer(&[0, 1, 2], BufferUsage::Static).unwrap();
        alloc.release_index_buffer(a).unwrap();
        alloc.release_index_buffer(b).unwrap();
        assert_eq!(alloc.pool_sizes().index, 1);
    }

    #[test]
    fn test_unpooled_buffer_release_is_stale() {
        let alloc = allocator();
        let backend = alloc.backend();
        let foreign = IndexBuffer::new(backend, vec![0, 1, 2], BufferUsage::Static).unwrap();
        assert!(matches!(
            alloc.release_index_buffer(foreign),
            Err(GpuError::StaleLease { kind: BufferKind::Index })
        ));
    }

    #[test]
    fn test_leak_is_reported_once() {
        let alloc = allocator();
        let ub = alloc
            .allocate_uniform_buffer(&[("t".to_string(), crate::buffers::UniformValue::Scalar(1.0))], BufferUsage::Dynamic)
            .unwrap();
        drop(ub);
        let report = alloc.check_for_leaks();
        assert_eq!(report.leaks_detected, 1);
        assert_eq!(report.active_buffers, 0);
        assert_eq!(alloc.check_for_leaks().leaks_detected, 0);
        assert_eq!(alloc.buffer_stats(BufferKind::Uniform).leaked, 1);
    }

    #[test]
    fn test_release_after_cleanup_is_stale() {
        let alloc = allocator();
        let vb = alloc.allocate_vertex_buffer(&[0.0; 5], BufferUsage::Dynamic).unwrap();
        alloc.cleanup();
        assert!(alloc.release_vertex_buffer(vb).is_err());
        assert_eq!(alloc.get_stats().total_blocks, 0);
    }

    #[test]
    fn test_backend_switch_migrates_idle_buffers() {
        let alloc = allocator();
        let vb = alloc.allocate_vertex_buffer(&[0.0; 5], BufferUsage::Dynamic).unwrap();
        alloc.release_vertex_buffer(vb).unwrap();

        let next: Arc<dyn GpuBackend> = Arc::new(SoftwareBackend::new());
        alloc.set_backend(next.clone());
        let vb = alloc.allocate_vertex_buffer(&[1.0; 5], BufferUsage::Dynamic).unwrap();
        assert!(vb.is_on(&next));
        assert_eq!(alloc.buffer_stats(BufferKind::Vertex).reused, 1);
        alloc.release_vertex_buffer(vb).unwrap();
    }
}
