//! Graphics backends.
//!
//! Everything above this module talks to the GPU through [`GpuBackend`],
//! a narrow capability trait. Two implementations ship:
//!
//! - [`native::NativeBackend`]: `wgpu` pinned to a single backend bit
//! - [`software::SoftwareBackend`]: CPU tables, always available
//!
//! Selection walks [`GpuConfig::backend_chain`] and keeps the first backend
//! whose [`probe`] succeeds. Software ends every chain, so selection never
//! fails.

pub mod native;
pub mod software;

use std::sync::Arc;

use tessera_core::{
    BackendError, BackendKind, BarrierType, BlockId, BufferKind, BufferUsage, GpuConfig, ProbeError,
};

use crate::device::{Capabilities, Limits};

pub use native::NativeBackend;
pub use software::{SoftwareBackend, SoftwareFrameStats};

// ───────────────────────────────────────────────────────────────────
// Handles and draw parameters
// ───────────────────────────────────────────────────────────────────

/// Backend-issued buffer handle.
///
/// Deliberately not `Clone`: exactly one owner, and `destroy_buffer`
/// consumes it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(u64);

impl BufferHandle {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Where a buffer is bound for the next draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindPoint {
    /// Vertex stream slot. Slot 0 carries geometry, slot 1 instance data.
    Vertex(u32),
    Index,
    Uniform(u32),
}

impl BindPoint {
    pub const GEOMETRY: BindPoint = BindPoint::Vertex(0);
    pub const INSTANCES: BindPoint = BindPoint::Vertex(1);
}

/// Parameters of one draw over the currently bound buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawParams {
    pub vertex_count: u32,
    pub index_count: u32,
    /// Floats per vertex in the bound geometry stream.
    pub stride_floats: u32,
    /// 1 for non-instanced draws.
    pub instance_count: u32,
}

// ───────────────────────────────────────────────────────────────────
// Backend trait
// ───────────────────────────────────────────────────────────────────

/// Capability surface of a graphics backend.
///
/// All methods take `&self`; implementations keep their tables behind a
/// lock so a backend can be shared as `Arc<dyn GpuBackend>`.
pub trait GpuBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn is_available(&self) -> bool;

    fn create_buffer(
        &self,
        kind: BufferKind,
        bytes: &[u8],
        usage: BufferUsage,
    ) -> Result<BufferHandle, BackendError>;

    fn create_vertex_buffer(&self, bytes: &[u8], usage: BufferUsage) -> Result<BufferHandle, BackendError> {
        self.create_buffer(BufferKind::Vertex, bytes, usage)
    }

    fn create_index_buffer(&self, bytes: &[u8], usage: BufferUsage) -> Result<BufferHandle, BackendError> {
        self.create_buffer(BufferKind::Index, bytes, usage)
    }

    fn create_uniform_buffer(&self, bytes: &[u8], usage: BufferUsage) -> Result<BufferHandle, BackendError> {
        self.create_buffer(BufferKind::Uniform, bytes, usage)
    }

    /// Overwrite `bytes.len()` bytes at `offset`. Never grows the buffer.
    fn write_buffer(&self, handle: &BufferHandle, offset: u64, bytes: &[u8]) -> Result<(), BackendError>;

    fn destroy_buffer(&self, handle: BufferHandle);

    fn bind_buffer(&self, handle: &BufferHandle, point: BindPoint) -> Result<(), BackendError>;

    /// Clear a bind point. Unbinding an empty point is a no-op.
    fn unbind_buffer(&self, point: BindPoint);

    /// Move `size` bytes of `scratch` into the backend's transfer region.
    fn upload_to_gpu(&self, scratch: &[u8], size: usize) -> Result<(), BackendError>;

    /// Read up to `size` bytes of the transfer region into `scratch`.
    /// Returns the number of bytes read.
    fn download_from_gpu(&self, scratch: &mut [u8], size: usize) -> Result<usize, BackendError>;

    fn render_geometry(&self, params: &DrawParams) -> Result<(), BackendError>;

    fn render_instanced_geometry(&self, params: &DrawParams) -> Result<(), BackendError>;

    fn supports_instancing(&self) -> bool {
        self.capabilities().instancing
    }

    fn capabilities(&self) -> Capabilities;

    fn limits(&self) -> Limits;

    /// Residency hook: release the backing storage of `id`.
    fn evict_memory_block(&self, _id: &BlockId) -> Result<(), BackendError> {
        Ok(())
    }

    /// Residency hook: re-establish the backing storage of `id`.
    fn restore_memory_block(&self, _id: &BlockId) -> Result<(), BackendError> {
        Ok(())
    }

    /// Submit queued barriers as one batch.
    fn submit_barriers(&self, _barriers: &[BarrierType]) -> Result<(), BackendError> {
        Ok(())
    }

    /// Block until all submitted work has finished.
    fn wait_idle(&self) -> Result<(), BackendError>;

    /// Release every backend resource. Further calls fail with
    /// [`BackendError::Unavailable`].
    fn shutdown(&self);
}

// ───────────────────────────────────────────────────────────────────
// Probing and selection
// ───────────────────────────────────────────────────────────────────

/// Try to bring up one backend kind.
pub fn probe(kind: BackendKind, config: &GpuConfig) -> Result<Arc<dyn GpuBackend>, ProbeError> {
    match kind {
        BackendKind::Software => Ok(Arc::new(SoftwareBackend::new())),
        native => {
            let backend = NativeBackend::probe(native, config)?;
            if !backend.is_available() {
                return Err(ProbeError::Unavailable(native));
            }
            Ok(Arc::new(backend))
        }
    }
}

/// Walk the configured chain and return the first backend that comes up.
pub fn select_backend(config: &GpuConfig) -> Arc<dyn GpuBackend> {
    for kind in config.backend_chain() {
        match probe(kind, config) {
            Ok(backend) => {
                log::info!("Selected {} backend", kind);
                return backend;
            }
            Err(e) => log::warn!("Backend probe failed: {}", e),
        }
    }
    // backend_chain() always ends with software, whose probe cannot fail.
    Arc::new(SoftwareBackend::new())
}

// ===================================================================
// Tests
// ===================================================================
