//! Staging queue for CPU↔GPU transfers.
//!
//! ```text
//!  queue_transfer ──▶ buckets by priority (BTreeMap, highest first)
//!                        │ pop front of highest bucket
//!                        ▼
//!                 take scratch buffer ──▶ upload / download ──▶ return scratch
//!                 (lock released while the backend runs)        │
//!                                                               ▼
//!                                                    stats + callback
//! ```
//!
//! Every request is attempted once. Upload failures are counted and logged;
//! download failures are counted and returned to the caller.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tessera_core::{
    BackendError, GpuError, GpuResult, StagingConfig, TransferDirection, TransferId, TransferRequest,
};

use crate::backend::GpuBackend;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TransferStats {
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub transfers_cancelled: u64,
    pub bytes_transferred: u64,
    pub average_transfer_time_ms: f64,
    pub active_transfers: usize,
    pub queued_transfers: usize,
    pub peak_queue_size: usize,
    pub staging_buffers_available: usize,
    pub staging_buffers_total: usize,
    /// Bytes held by idle scratch buffers.
    pub staging_bytes_reserved: usize,
}

#[derive(Default)]
struct Counters {
    completed: u64,
    failed: u64,
    cancelled: u64,
    bytes: u64,
    busy: Duration,
    peak_queue: usize,
}

struct Staging {
    queues: BTreeMap<i32, VecDeque<TransferRequest>>,
    /// Queued or being serviced.
    active: HashSet<TransferId>,
    servicing: HashSet<TransferId>,
    scratch: Vec<Vec<u8>>,
    scratch_total: usize,
    counters: Counters,
    backend: Arc<dyn GpuBackend>,
}

impl Staging {
    fn queued(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    fn pop_highest(&mut self) -> Option<TransferRequest> {
        let mut bucket = self.queues.last_entry()?;
        let request = bucket.get_mut().pop_front();
        if bucket.get().is_empty() {
            bucket.remove();
        }
        request
    }
}

pub struct StagingManager {
    config: StagingConfig,
    state: Mutex<Staging>,
}

impl StagingManager {
    pub fn new(config: StagingConfig, backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            config,
            state: Mutex::new(Staging {
                queues: BTreeMap::new(),
                active: HashSet::new(),
                servicing: HashSet::new(),
                scratch: Vec::new(),
                scratch_total: 0,
                counters: Counters::default(),
                backend,
            }),
        }
    }

    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    pub fn set_backend(&self, backend: Arc<dyn GpuBackend>) {
        self.state.lock().backend = backend;
    }

    pub fn queue_transfer(&self, request: TransferRequest) -> GpuResult<TransferId> {
        let capacity = self.config.staging_buffer_size;
        if request.size > capacity {
            return Err(GpuError::StagingCapacity {
                requested: request.size,
                capacity,
            });
        }

        let mut state = self.state.lock();
        if !state.active.insert(request.id) {
            return Err(GpuError::DuplicateTransfer(request.id));
        }
        let id = request.id;
        log::debug!(
            "Queued transfer {} ({} bytes, {}, priority {})",
            id,
            request.size,
            request.direction,
            request.priority
        );
        state.queues.entry(request.priority).or_default().push_back(request);
        let queued = state.queued();
        state.counters.peak_queue = state.counters.peak_queue.max(queued);
        Ok(id)
    }

    /// Drain up to `max` requests, highest priority first. Returns how many
    /// completed successfully.
    pub fn process_transfers(&self, max: Option<usize>) -> GpuResult<usize> {
        let mut attempted = 0;
        let mut completed = 0;

        while max.map_or(true, |m| attempted < m) {
            let (mut request, mut scratch, backend) = {
                let mut state = self.state.lock();
                let Some(request) = state.pop_highest() else { break };
                state.servicing.insert(request.id);
                let scratch = match state.scratch.pop() {
                    Some(buf) => buf,
                    None => {
                        state.scratch_total += 1;
                        Vec::new()
                    }
                };
                (request, scratch, state.backend.clone())
            };
            attempted += 1;

            let started = Instant::now();
            let outcome = execute(backend.as_ref(), &mut request, &mut scratch);
            let elapsed = started.elapsed();

            {
                let mut state = self.state.lock();
                state.scratch.push(scratch);
                state.servicing.remove(&request.id);
                state.active.remove(&request.id);
                match &outcome {
                    Ok(()) => {
                        state.counters.completed += 1;
                        state.counters.bytes += request.size as u64;
                        state.counters.busy += elapsed;
                    }
                    Err(_) => state.counters.failed += 1,
                }
            }

            match outcome {
                Ok(()) => {
                    completed += 1;
                    log::debug!("Transfer {} completed in {:?}", request.id, elapsed);
                    if let Some(callback) = request.callback.take() {
                        callback(&request);
                    }
                }
                Err(source) if request.direction == TransferDirection::GpuToCpu => {
                    log::error!("Transfer {} failed: {}", request.id, source);
                    return Err(GpuError::Transfer { id: request.id, source });
                }
                Err(e) => log::warn!("Transfer {} failed: {}", request.id, e),
            }
        }
        Ok(completed)
    }

    /// Remove a queued request. Only a request that is being serviced
    /// right now cannot be cancelled.
    pub fn cancel_transfer(&self, id: TransferId) -> bool {
        let mut state = self.state.lock();
        if state.servicing.contains(&id) {
            return false;
        }
        let mut removed = false;
        for queue in state.queues.values_mut() {
            if let Some(pos) = queue.iter().position(|r| r.id == id) {
                queue.remove(pos);
                removed = true;
                break;
            }
        }
        if removed {
            state.queues.retain(|_, q| !q.is_empty());
            state.active.remove(&id);
            state.counters.cancelled += 1;
            log::debug!("Cancelled transfer {}", id);
        }
        true
    }

    pub fn flush_all_transfers(&self) -> GpuResult<usize> {
        self.process_transfers(None)
    }

    pub fn is_active(&self, id: TransferId) -> bool {
        self.state.lock().active.contains(&id)
    }

    pub fn get_transfer_stats(&self) -> TransferStats {
        let state = self.state.lock();
        let c = &state.counters;
        let average_transfer_time_ms = if c.completed > 0 {
            c.busy.as_secs_f64() * 1000.0 / c.completed as f64
        } else {
            0.0
        };
        TransferStats {
            transfers_completed: c.completed,
            transfers_failed: c.failed,
            transfers_cancelled: c.cancelled,
            bytes_transferred: c.bytes,
            average_transfer_time_ms,
            active_transfers: state.active.len(),
            queued_transfers: state.queued(),
            peak_queue_size: c.peak_queue,
            staging_buffers_available: state.scratch.len(),
            staging_buffers_total: state.scratch_total,
            staging_bytes_reserved: state.scratch.iter().map(Vec::len).sum(),
        }
    }

    /// Drop queued requests and idle scratch buffers.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        state.queues.clear();
        let servicing = state.servicing.clone();
        state.active.retain(|id| servicing.contains(id));
        let idle = state.scratch.len();
        state.scratch_total -= idle;
        state.scratch.clear();
        log::debug!("Staging manager cleaned up");
    }
}

/// Scratch buffers grow to the largest request they have served, never past
/// `staging_buffer_size` since larger requests are refused at queue time.
fn execute(backend: &dyn GpuBackend, request: &mut TransferRequest, scratch: &mut Vec<u8>) -> Result<(), BackendError> {
    if scratch.len() < request.size {
        scratch.resize(request.size, 0);
    }
    match request.direction {
        TransferDirection::CpuToGpu => {
            let bytes = request.data.as_bytes();
            let len = bytes.len().min(request.size);
            scratch[..len].copy_from_slice(&bytes[..len]);
            backend.upload_to_gpu(&scratch[..len], request.size)
        }
        TransferDirection::GpuToCpu => {
            let read = backend.download_from_gpu(&mut scratch[..request.size], request.size)?;
            request.data = request.data.reshape_from(&scratch[..read]);
            Ok(())
        }
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tessera_core::TransferData;

    fn staging() -> StagingManager {
        StagingManager::new(StagingConfig { staging_buffer_size: 1024 }, Arc::new(SoftwareBackend::new()))
    }

    #[test]
    fn test_duplicate_id_rejected_while_active() {
        let mgr = staging();
        let id = TransferId::new();
        mgr.queue_transfer(TransferRequest::upload(TransferData::Bytes(vec![1])).with_id(id)).unwrap();
        let dup = mgr.queue_transfer(TransferRequest::upload(TransferData::Bytes(vec![2])).with_id(id));
        assert!(matches!(dup, Err(GpuError::DuplicateTransfer(_))));

        mgr.flush_all_transfers().unwrap();
        assert!(!mgr.is_active(id));
        assert!(mgr.queue_transfer(TransferRequest::upload(TransferData::Bytes(vec![3])).with_id(id)).is_ok());
    }

    #[test]
    fn test_oversized_request_rejected() {
        let mgr = staging();
        let req = TransferRequest::upload(TransferData::Bytes(vec![0; 2048]));
        assert!(matches!(
            mgr.queue_transfer(req),
            Err(GpuError::StagingCapacity { requested: 2048, capacity: 1024 })
        ));
    }

    #[test]
    fn test_fifo_within_priority() {
        let mgr = staging();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3u8 {
            let order = order.clone();
            mgr.queue_transfer(
                TransferRequest::upload(TransferData::Bytes(vec![i])).on_complete(move |_| order.lock().push(i)),
            )
            .unwrap();
        }
        assert_eq!(mgr.process_transfers(None).unwrap(), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_upload_then_download_shapes_floats() {
        let mgr = staging();
        mgr.queue_transfer(TransferRequest::upload(TransferData::Floats(vec![1.5, -3.0]))).unwrap();
        let got = Arc::new(Mutex::new(None));
        let sink = got.clone();
        mgr.queue_transfer(
            TransferRequest::download(8, TransferData::Floats(vec![]))
                .with_priority(-1)
                .on_complete(move |req| *sink.lock() = Some(req.data.clone())),
        )
        .unwrap();
        mgr.flush_all_transfers().unwrap();
        assert_eq!(*got.lock(), Some(TransferData::Floats(vec![1.5, -3.0])));

        let stats = mgr.get_transfer_stats();
        assert_eq!(stats.transfers_completed, 2);
        assert_eq!(stats.bytes_transferred, 16);
        assert_eq!(stats.staging_buffers_total, 1);
        assert_eq!(stats.staging_buffers_available, 1);
    }

    #[test]
    fn test_cancel_queued_transfer() {
        let mgr = staging();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = mgr
            .queue_transfer(TransferRequest::upload(TransferData::Ints(vec![1, 2])).on_complete(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert!(mgr.cancel_transfer(id));
        assert!(mgr.cancel_transfer(id));
        assert_eq!(mgr.process_transfers(None).unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(mgr.get_transfer_stats().transfers_cancelled, 1);
    }

    #[test]
    fn test_scratch_grows_only_to_request_size() {
        let mgr = staging();
        mgr.queue_transfer(TransferRequest::upload(TransferData::Bytes(vec![1; 4]))).unwrap();
        mgr.flush_all_transfers().unwrap();
        assert_eq!(mgr.get_transfer_stats().staging_bytes_reserved, 4);

        mgr.queue_transfer(TransferRequest::upload(TransferData::Bytes(vec![2; 100]))).unwrap();
        mgr.queue_transfer(TransferRequest::upload(TransferData::Bytes(vec![3; 8]))).unwrap();
        mgr.flush_all_transfers().unwrap();
        let stats = mgr.get_transfer_stats();
        assert_eq!(stats.staging_buffers_total, 1);
        assert_eq!(stats.staging_bytes_reserved, 100);
    }

    #[test]
    fn test_max_transfers_limits_batch() {
        let mgr = staging();
        for _ in 0..4 {
            mgr.queue_transfer(TransferRequest::upload(TransferData::Bytes(vec![0; 4]))).unwrap();
        }
        assert_eq!(mgr.process_transfers(Some(3)).unwrap(), 3);
        let stats = mgr.get_transfer_stats();
        assert_eq!(stats.queued_transfers, 1);
        assert_eq!(stats.peak_queue_size, 4);
    }
}
