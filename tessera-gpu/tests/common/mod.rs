//! Shared helpers for integration tests.
//!
//! [`MockBackend`] wraps a [`SoftwareBackend`] and can be told to fail any
//! individual operation, and records the residency hooks it receives.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tessera_core::{BackendError, BackendKind, BarrierType, BlockId, BufferKind, BufferUsage, GpuConfig};
use tessera_gpu::backend::{BindPoint, BufferHandle, DrawParams, GpuBackend, SoftwareBackend};
use tessera_gpu::device::{Capabilities, Limits};
use tessera_gpu::DeviceManager;

#[derive(Default)]
pub struct MockBackend {
    inner: SoftwareBackend,
    pub fail_create: AtomicBool,
    pub fail_draws: AtomicBool,
    pub fail_uploads: AtomicBool,
    pub fail_downloads: AtomicBool,
    pub fail_evict: AtomicBool,
    pub fail_restore: AtomicBool,
    pub fail_barriers: AtomicBool,
    pub no_instancing: AtomicBool,
    pub evicted: Mutex<Vec<BlockId>>,
    pub restored: Mutex<Vec<BlockId>>,
    pub barrier_batches: Mutex<Vec<Vec<BarrierType>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }

    pub fn software(&self) -> &SoftwareBackend {
        &self.inner
    }

    fn check(flag: &AtomicBool, err: BackendError) -> Result<(), BackendError> {
        if flag.load(Ordering::SeqCst) {
            Err(err)
        } else {
            Ok(())
        }
    }
}

impl GpuBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        // Reported as native so successful draws count as GPU draws.
        BackendKind::Vulkan
    }

    fn is_available(&self) -> bool {
        true
    }

    fn create_buffer(&self, kind: BufferKind, bytes: &[u8], usage: BufferUsage) -> Result<BufferHandle, BackendError> {
        Self::check(&self.fail_create, BackendError::CreateBuffer("mock".into()))?;
        self.inner.create_buffer(kind, bytes, usage)
    }

    fn write_buffer(&self, handle: &BufferHandle, offset: u64, bytes: &[u8]) -> Result<(), BackendError> {
        self.inner.write_buffer(handle, offset, bytes)
    }

    fn destroy_buffer(&self, handle: BufferHandle) {
        self.inner.destroy_buffer(handle)
    }

    fn bind_buffer(&self, handle: &BufferHandle, point: BindPoint) -> Result<(), BackendError> {
        self.inner.bind_buffer(handle, point)
    }

    fn unbind_buffer(&self, point: BindPoint) {
        self.inner.unbind_buffer(point)
    }

    fn upload_to_gpu(&self, scratch: &[u8], size: usize) -> Result<(), BackendError> {
        Self::check(&self.fail_uploads, BackendError::Upload("mock".into()))?;
        self.inner.upload_to_gpu(scratch, size)
    }

    fn download_from_gpu(&self, scratch: &mut [u8], size: usize) -> Result<usize, BackendError> {
        Self::check(&self.fail_downloads, BackendError::Download("mock".into()))?;
        self.inner.download_from_gpu(scratch, size)
    }

    fn render_geometry(&self, params: &DrawParams) -> Result<(), BackendError> {
        Self::check(&self.fail_draws, BackendError::Draw("mock".into()))?;
        self.inner.render_geometry(params)
    }

    fn render_instanced_geometry(&self, params: &DrawParams) -> Result<(), BackendError> {
        Self::check(&self.fail_draws, BackendError::Draw("mock".into()))?;
        self.inner.render_instanced_geometry(params)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            instancing: !self.no_instancing.load(Ordering::SeqCst),
            ..Capabilities::software()
        }
    }

    fn limits(&self) -> Limits {
        Limits::conservative()
    }

    fn evict_memory_block(&self, id: &BlockId) -> Result<(), BackendError> {
        Self::check(&self.fail_evict, BackendError::Unsupported("evict"))?;
        self.evicted.lock().push(id.clone());
        Ok(())
    }

    fn restore_memory_block(&self, id: &BlockId) -> Result<(), BackendError> {
        Self::check(&self.fail_restore, BackendError::Unsupported("restore"))?;
        self.restored.lock().push(id.clone());
        Ok(())
    }

    fn submit_barriers(&self, barriers: &[BarrierType]) -> Result<(), BackendError> {
        Self::check(&self.fail_barriers, BackendError::Validation("mock".into()))?;
        self.barrier_batches.lock().push(barriers.to_vec());
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn shutdown(&self) {
        self.inner.shutdown()
    }
}

/// Device manager over a fresh mock backend, with test budgets.
pub fn mock_device() -> (DeviceManager, Arc<MockBackend>) {
    let mock = MockBackend::new();
    let device = DeviceManager::with_backend(GpuConfig::for_testing(), mock.clone());
    (device, mock)
}
