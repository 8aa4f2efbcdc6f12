//! Memory residency and eviction.
//!
//! ```text
//!   0 ──────────── floor ────── midpoint ────── pressure ──── budget
//!                  (min 0.7)                    (0.9)          (1.0)
//!                     ▲              ▲              │
//!                     │              └── default eviction aims here
//!                     └── default eviction never goes below this
//! ```
//!
//! Blocks are ranked by a retention score; the lowest score is evicted
//! first:
//!
//! ```text
//!   score = priority * 1000 + access_count * 100 - age_seconds - size_mb
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tessera_core::{BlockId, GpuError, GpuResult, MemoryBlock, ResidencyConfig, ResidencyState};

use crate::backend::GpuBackend;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Higher scores are kept longer.
pub fn retention_score(block: &MemoryBlock, now: Instant) -> f64 {
    let age = now.saturating_duration_since(block.last_accessed).as_secs_f64();
    block.priority as f64 * 1000.0 + block.access_count as f64 * 100.0 - age - block.size as f64 / BYTES_PER_MB
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total_blocks: usize,
    pub resident_blocks: usize,
    pub evicted_blocks: usize,
    pub resident_bytes: u64,
    pub max_memory_bytes: u64,
    pub memory_usage_percent: f64,
    pub peak_memory_usage: u64,
    pub evictions: u64,
    pub restorations: u64,
    pub memory_pressure_events: u64,
}

struct Residency {
    blocks: HashMap<BlockId, MemoryBlock>,
    resident_bytes: u64,
    peak: u64,
    evictions: u64,
    restorations: u64,
    pressure_events: u64,
    backend: Arc<dyn GpuBackend>,
}

impl Residency {
    fn note_peak(&mut self) {
        self.peak = self.peak.max(self.resident_bytes);
    }

    /// Resident blocks, lowest retention score first.
    fn candidates(&self, exclude: Option<&BlockId>) -> Vec<BlockId> {
        let now = Instant::now();
        let mut ranked: Vec<(f64, &MemoryBlock)> = self
            .blocks
            .values()
            .filter(|b| b.is_resident() && Some(&b.id) != exclude)
            .map(|b| (retention_score(b, now), b))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        ranked.into_iter().map(|(_, b)| b.id.clone()).collect()
    }

    fn size_of(&self, id: &BlockId) -> u64 {
        self.blocks.get(id).map_or(0, |b| b.size)
    }

    fn set_state(&mut self, id: &BlockId, state: ResidencyState) {
        if let Some(block) = self.blocks.get_mut(id) {
            match (block.state, state) {
                (ResidencyState::Resident, ResidencyState::Evicted) => {
                    self.resident_bytes = self.resident_bytes.saturating_sub(block.size)
                }
                (ResidencyState::Evicted, ResidencyState::Resident) => self.resident_bytes += block.size,
                _ => {}
            }
            block.state = state;
        }
    }

    /// Evict through the backend hook. Hook failures leave the block resident.
    fn evict_one(&mut self, id: &BlockId) -> bool {
        match self.backend.evict_memory_block(id) {
            Ok(()) => {
                self.set_state(id, ResidencyState::Evicted);
                self.evictions += 1;
                true
            }
            Err(e) => {
                log::warn!("Backend refused to evict {}: {}", id, e);
                false
            }
        }
    }

    /// Undo evictions made on behalf of a failed restore.
    fn roll_back(&mut self, evicted: &[BlockId]) {
        for id in evicted {
            if let Err(e) = self.backend.restore_memory_block(id) {
                log::warn!("Rollback could not restore {} on the backend: {}", id, e);
            }
            self.set_state(id, ResidencyState::Resident);
            self.evictions = self.evictions.saturating_sub(1);
        }
    }
}

pub struct ResidencyManager {
    config: ResidencyConfig,
    state: Mutex<Residency>,
}

impl ResidencyManager {
    pub fn new(config: ResidencyConfig, backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            config,
            state: Mutex::new(Residency {
                blocks: HashMap::new(),
                resident_bytes: 0,
                peak: 0,
                evictions: 0,
                restorations: 0,
                pressure_events: 0,
                backend,
            }),
        }
    }

    pub fn config(&self) -> &ResidencyConfig {
        &self.config
    }

    pub fn set_backend(&self, backend: Arc<dyn GpuBackend>) {
        self.state.lock().backend = backend;
    }

    pub fn register_memory_block(
        &self,
        id: impl Into<BlockId>,
        size: u64,
        usage: &str,
        priority: i32,
    ) -> GpuResult<()> {
        let id = id.into();
        let mut state = self.state.lock();
        if state.blocks.contains_key(&id) {
            return Err(GpuError::DuplicateBlock(id));
        }
        let mut block = MemoryBlock::new(id.clone(), size, usage, 1);
        block.allocated = true;
        block.priority = priority;
        state.blocks.insert(id.clone(), block);
        state.resident_bytes += size;
        state.note_peak();
        log::debug!("Registered {} ({} bytes, {}, priority {})", id, size, usage, priority);
        Ok(())
    }

    pub fn unregister_memory_block(&self, id: &str) -> GpuResult<()> {
        let mut state = self.state.lock();
        let block = state
            .blocks
            .remove(id)
            .ok_or_else(|| GpuError::UnknownBlock(BlockId::from(id)))?;
        if block.is_resident() {
            state.resident_bytes = state.resident_bytes.saturating_sub(block.size);
        }
        log::debug!("Unregistered {}", id);
        Ok(())
    }

    /// Record an access. Returns `false` for unknown ids.
    pub fn mark_accessed(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        match state.blocks.get_mut(id) {
            Some(block) => {
                block.last_accessed = Instant::now();
                block.access_count += 1;
                true
            }
            None => false,
        }
    }

    pub fn block(&self, id: &str) -> Option<MemoryBlock> {
        self.state.lock().blocks.get(id).cloned()
    }

    pub fn block_state(&self, id: &str) -> Option<ResidencyState> {
        self.state.lock().blocks.get(id).map(|b| b.state)
    }

    pub fn resident_bytes(&self) -> u64 {
        self.state.lock().resident_bytes
    }

    pub fn check_memory_pressure(&self) -> bool {
        self.state.lock().resident_bytes >= self.config.pressure_bytes()
    }

    /// Evict until at least `target` bytes are freed.
    ///
    /// With no target, nothing happens at or below the floor; otherwise the
    /// aim is the midpoint between floor and pressure threshold and no
    /// eviction may take resident bytes below the floor.
    pub fn evict_memory(&self, target: Option<u64>) -> u64 {
        let mut state = self.state.lock();
        let max = self.config.max_memory_bytes as f64;

        let (target, floor) = match target {
            Some(t) => (t, 0),
            None => {
                let floor = self.config.floor_bytes();
                if state.resident_bytes <= floor {
                    return 0;
                }
                let midpoint = self.config.min_resident_threshold
                    + (self.config.eviction_threshold - self.config.min_resident_threshold) * 0.5;
                let goal = (midpoint * max) as u64;
                (state.resident_bytes.saturating_sub(goal), floor)
            }
        };
        if target == 0 {
            return 0;
        }

        let mut freed = 0;
        for id in state.candidates(None) {
            if freed >= target {
                break;
            }
            let size = state.size_of(&id);
            if state.resident_bytes.saturating_sub(size) < floor {
                continue;
            }
            if state.evict_one(&id) {
                freed += size;
            }
        }

        if freed > 0 {
            state.pressure_events += 1;
            log::debug!("Evicted {} bytes (target {})", freed, target);
        }
        freed
    }

    /// Make `id` resident again, evicting others if the budget needs it.
    ///
    /// Either the block ends up resident within budget or nothing changes.
    pub fn restore_memory(&self, id: &str) -> GpuResult<()> {
        let mut state = self.state.lock();
        let block_id = BlockId::from(id);
        let (size, block_state) = state
            .blocks
            .get(id)
            .map(|b| (b.size, b.state))
            .ok_or_else(|| GpuError::UnknownBlock(block_id.clone()))?;
        if block_state == ResidencyState::Resident {
            return Ok(());
        }

        let budget = self.config.max_memory_bytes;
        let needed = (state.resident_bytes + size).saturating_sub(budget);

        let mut victims = Vec::new();
        if needed > 0 {
            let mut planned = 0;
            for candidate in state.candidates(Some(&block_id)) {
                if planned >= needed {
                    break;
                }
                planned += state.size_of(&candidate);
                victims.push(candidate);
            }
            if planned < needed {
                return Err(GpuError::InsufficientMemory {
                    needed,
                    available: planned,
                });
            }
        }

        let mut evicted = Vec::with_capacity(victims.len());
        for victim in &victims {
            if !state.evict_one(victim) {
                state.roll_back(&evicted);
                return Err(GpuError::InsufficientMemory {
                    needed,
                    available: evicted.iter().map(|v| state.size_of(v)).sum(),
                });
            }
            evicted.push(victim.clone());
        }

        if let Err(e) = state.backend.restore_memory_block(&block_id) {
            state.roll_back(&evicted);
            return Err(e.into());
        }
        state.set_state(&block_id, ResidencyState::Resident);
        if let Some(block) = state.blocks.get_mut(id) {
            block.last_accessed = Instant::now();
        }
        state.restorations += 1;
        state.note_peak();
        log::debug!("Restored {} ({} victim(s) evicted)", id, evicted.len());
        Ok(())
    }

    pub fn get_memory_stats(&self) -> MemoryStats {
        let state = self.state.lock();
        let resident_blocks = state.blocks.values().filter(|b| b.is_resident()).count();
        MemoryStats {
            total_blocks: state.blocks.len(),
            resident_blocks,
            evicted_blocks: state.blocks.len() - resident_blocks,
            resident_bytes: state.resident_bytes,
            max_memory_bytes: self.config.max_memory_bytes,
            memory_usage_percent: state.resident_bytes as f64 / self.config.max_memory_bytes as f64 * 100.0,
            peak_memory_usage: state.peak,
            evictions: state.evictions,
            restorations: state.restorations,
            memory_pressure_events: state.pressure_events,
        }
    }

    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        state.blocks.clear();
        state.resident_bytes = 0;
        log::debug!("Residency manager cleaned up");
    }
}

// ===================================================================
// Tests
// ===================================================================
