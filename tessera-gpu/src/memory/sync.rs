//! Fences, events, semaphores and barriers.
//!
//! Sync points are created and destroyed explicitly. Waiters block on a
//! condition variable until the point is signaled or their deadline
//! passes; nothing waits without a timeout.
//!
//! Barriers are queued by `issue_barrier` and submitted in one batch by
//! `flush_barriers`. A failed submission keeps the batch queued.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tessera_core::{BarrierType, CommandBufferRef, GpuError, GpuResult, SyncId, SyncKind, SyncPoint};

use crate::backend::GpuBackend;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub fences_created: u64,
    pub events_created: u64,
    pub semaphores_created: u64,
    pub active_sync_points: usize,
    pub signaled_sync_points: usize,
    pub waits: u64,
    pub wait_timeouts: u64,
    pub barriers_issued: u64,
    pub barriers_flushed: u64,
    pub pending_barriers: usize,
    pub memory_barriers: u64,
}

struct PendingBarrier {
    barrier_type: BarrierType,
    command_buffer: Option<CommandBufferRef>,
}

struct SyncState {
    points: HashMap<SyncId, SyncPoint>,
    barriers: Vec<PendingBarrier>,
    stats: SyncStats,
    backend: Arc<dyn GpuBackend>,
}

pub struct SyncManager {
    state: Mutex<SyncState>,
    signaled: Condvar,
}

impl SyncManager {
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            state: Mutex::new(SyncState {
                points: HashMap::new(),
                barriers: Vec::new(),
                stats: SyncStats::default(),
                backend,
            }),
            signaled: Condvar::new(),
        }
    }

    pub fn set_backend(&self, backend: Arc<dyn GpuBackend>) {
        self.state.lock().backend = backend;
    }

    fn create(&self, kind: SyncKind, command_buffer: Option<CommandBufferRef>) -> SyncId {
        let point = SyncPoint::new(kind, command_buffer);
        let id = point.id;
        let mut state = self.state.lock();
        match kind {
            SyncKind::Fence => state.stats.fences_created += 1,
            SyncKind::Event => state.stats.events_created += 1,
            SyncKind::Semaphore => state.stats.semaphores_created += 1,
        }
        state.points.insert(id, point);
        log::debug!("Created {:?} {}", kind, id);
        id
    }

    pub fn create_fence(&self, command_buffer: Option<CommandBufferRef>) -> SyncId {
        self.create(SyncKind::Fence, command_buffer)
    }

    pub fn create_event(&self, command_buffer: Option<CommandBufferRef>) -> SyncId {
        self.create(SyncKind::Event, command_buffer)
    }

    pub fn create_semaphore(&self) -> SyncId {
        self.create(SyncKind::Semaphore, None)
    }

    pub fn sync_point(&self, id: SyncId) -> Option<SyncPoint> {
        self.state.lock().points.get(&id).cloned()
    }

    pub fn signal_sync_point(&self, id: SyncId) -> GpuResult<()> {
        let mut state = self.state.lock();
        let point = state.points.get_mut(&id).ok_or(GpuError::UnknownSyncPoint(id))?;
        point.is_signaled = true;
        drop(state);
        self.signaled.notify_all();
        log::trace!("Signaled {}", id);
        Ok(())
    }

    pub fn reset_sync_point(&self, id: SyncId) -> GpuResult<()> {
        let mut state = self.state.lock();
        let point = state.points.get_mut(&id).ok_or(GpuError::UnknownSyncPoint(id))?;
        point.is_signaled = false;
        Ok(())
    }

    /// Block until `id` is signaled or `timeout` elapses. `Ok(false)` on
    /// timeout.
    pub fn wait_for_sync_point(&self, id: SyncId, timeout: Duration) -> GpuResult<bool> {
        let mut state = self.state.lock();
        state.stats.waits += 1;
        // A timeout too large to add to now means no deadline.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            match state.points.get(&id) {
                None => return Err(GpuError::UnknownSyncPoint(id)),
                Some(point) if point.is_signaled => return Ok(true),
                Some(_) => {}
            }
            let Some(deadline) = deadline else {
                self.signaled.wait(&mut state);
                continue;
            };
            if self.signaled.wait_until(&mut state, deadline).timed_out() {
                let signaled = state.points.get(&id).map(|p| p.is_signaled);
                return match signaled {
                    None => Err(GpuError::UnknownSyncPoint(id)),
                    Some(true) => Ok(true),
                    Some(false) => {
                        state.stats.wait_timeouts += 1;
                        log::debug!("Wait on {} timed out after {:?}", id, timeout);
                        Ok(false)
                    }
                };
            }
        }
    }

    pub fn destroy_sync_point(&self, id: SyncId) -> bool {
        let removed = self.state.lock().points.remove(&id).is_some();
        if removed {
            // Wake waiters so they notice the point is gone.
            self.signaled.notify_all();
        }
        removed
    }

    pub fn issue_barrier(&self, barrier_type: BarrierType, command_buffer: Option<CommandBufferRef>) {
        let mut state = self.state.lock();
        state.barriers.push(PendingBarrier {
            barrier_type,
            command_buffer,
        });
        state.stats.barriers_issued += 1;
    }

    /// Submit every queued barrier in one batch.
    pub fn flush_barriers(&self) -> GpuResult<usize> {
        let mut state = self.state.lock();
        if state.barriers.is_empty() {
            return Ok(0);
        }
        let batch: Vec<BarrierType> = state.barriers.iter().map(|b| b.barrier_type).collect();
        state.backend.submit_barriers(&batch)?;
        let count = batch.len();
        state.barriers.clear();
        state.stats.barriers_flushed += count as u64;
        log::debug!("Flushed {} barrier(s)", count);
        Ok(count)
    }

    /// Submit a single barrier immediately, bypassing the queue.
    pub fn insert_memory_barrier(
        &self,
        barrier_type: BarrierType,
        command_buffer: Option<CommandBufferRef>,
    ) -> GpuResult<()> {
        let mut state = self.state.lock();
        state.backend.submit_barriers(&[barrier_type])?;
        state.stats.memory_barriers += 1;
        log::trace!("Memory barrier {} on {:?}", barrier_type, command_buffer);
        Ok(())
    }

    pub fn pending_barriers(&self) -> Vec<(BarrierType, Option<CommandBufferRef>)> {
        self.state
            .lock()
            .barriers
            .iter()
            .map(|b| (b.barrier_type, b.command_buffer))
            .collect()
    }

    pub fn wait_for_idle(&self) -> GpuResult<()> {
        let backend = self.state.lock().backend.clone();
        backend.wait_idle()?;
        Ok(())
    }

    pub fn get_sync_stats(&self) -> SyncStats {
        let state = self.state.lock();
        SyncStats {
            active_sync_points: state.points.len(),
            signaled_sync_points: state.points.values().filter(|p| p.is_signaled).count(),
            pending_barriers: state.barriers.len(),
            ..state.stats
        }
    }

    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        state.points.clear();
        state.barriers.clear();
        drop(state);
        self.signaled.notify_all();
        log::debug!("Sync manager cleaned up");
    }
}

// ===================================================================
// Tests
// ===================================================================
