//! CPU software backend.
//!
//! Buffers live in a handle table of byte vectors; the transfer region is a
//! plain `Vec<u8>`. Draws do not rasterise anything: they check the bound
//! buffers the way a driver's validation layer would and count what would
//! have been drawn. This is the terminal backend of every selection chain
//! and the target of the device manager's CPU fallback.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tessera_core::{
    BackendError, BackendKind, BarrierType, BlockId, BufferKind, BufferUsage, Geometry, GpuError, GpuResult,
    InstanceTransform,
};

use super::{BindPoint, BufferHandle, DrawParams, GpuBackend};
use crate::device::{Capabilities, Limits};

/// Counters for everything the software backend has done.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SoftwareFrameStats {
    pub draw_calls: u64,
    pub instanced_draw_calls: u64,
    pub triangles: u64,
    pub instances: u64,
    pub buffers_live: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub barriers_submitted: u64,
    pub evictions: u64,
    pub restorations: u64,
}

struct SoftBuffer {
    kind: BufferKind,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct SoftwareState {
    next_handle: u64,
    buffers: FxHashMap<u64, SoftBuffer>,
    bound: FxHashMap<BindPoint, u64>,
    transfer: Vec<u8>,
    stats: SoftwareFrameStats,
    shut_down: bool,
}

pub struct SoftwareBackend {
    state: Mutex<SoftwareState>,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SoftwareState {
                next_handle: 1,
                ..Default::default()
            }),
        }
    }

    pub fn frame_stats(&self) -> SoftwareFrameStats {
        let state = self.state.lock();
        SoftwareFrameStats {
            buffers_live: state.buffers.len() as u64,
            ..state.stats
        }
    }

    /// Draw straight from CPU geometry, bypassing the buffer tables.
    pub fn render_cpu(&self, geometry: &Geometry) -> GpuResult<()> {
        geometry.validate()?;
        let mut state = self.state.lock();
        state.stats.draw_calls += 1;
        state.stats.triangles += geometry.triangle_count() as u64;
        Ok(())
    }

    /// Instanced variant of [`render_cpu`](Self::render_cpu).
    pub fn render_cpu_instanced(&self, geometry: &Geometry, instances: &[InstanceTransform]) -> GpuResult<()> {
        geometry.validate()?;
        if instances.iter().any(|t| !t.scale_x.is_finite() || !t.scale_y.is_finite()) {
            return Err(GpuError::InvalidGeometry("non-finite instance scale".into()));
        }
        let mut state = self.state.lock();
        state.stats.instanced_draw_calls += 1;
        state.stats.instances += instances.len() as u64;
        state.stats.triangles += (geometry.triangle_count() * instances.len()) as u64;
        Ok(())
    }

    fn bound_bytes<'a>(state: &'a SoftwareState, point: BindPoint) -> Result<&'a [u8], BackendError> {
        let raw = state
            .bound
            .get(&point)
            .ok_or_else(|| BackendError::Draw(format!("nothing bound at {point:?}")))?;
        state
            .buffers
            .get(raw)
            .map(|b| b.bytes.as_slice())
            .ok_or(BackendError::InvalidHandle(*raw))
    }

    fn check_draw(state: &SoftwareState, params: &DrawParams) -> Result<(), BackendError> {
        if state.shut_down {
            return Err(BackendError::Unavailable);
        }
        let vertices = Self::bound_bytes(state, BindPoint::GEOMETRY)?;
        let needed = params.vertex_count as usize * params.stride_floats as usize * 4;
        if vertices.len() < needed {
            return Err(BackendError::Draw(format!(
                "vertex buffer holds {} bytes, draw needs {}",
                vertices.len(),
                needed
            )));
        }
        if params.index_count > 0 {
            let indices = Self::bound_bytes(state, BindPoint::Index)?;
            let count = params.index_count as usize;
            if indices.len() < count * 4 {
                return Err(BackendError::Draw(format!(
                    "index buffer holds {} bytes, draw needs {}",
                    indices.len(),
                    count * 4
                )));
            }
            let indices: Vec<u32> = bytemuck::pod_collect_to_vec(&indices[..count * 4]);
            if let Some(bad) = indices.iter().find(|&&i| i >= params.vertex_count) {
                return Err(BackendError::Draw(format!(
                    "index {} out of range for {} vertices",
                    bad, params.vertex_count
                )));
            }
        }
        Ok(())
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for SoftwareBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Software
    }

    fn is_available(&self) -> bool {
        !self.state.lock().shut_down
    }

    fn create_buffer(&self, kind: BufferKind, bytes: &[u8], usage: BufferUsage) -> Result<BufferHandle, BackendError> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(BackendError::Unavailable);
        }
        let raw = state.next_handle;
        state.next_handle += 1;
        state.buffers.insert(
            raw,
            SoftBuffer {
                kind,
                bytes: bytes.to_vec(),
            },
        );
        log::debug!("software: created {} {} buffer #{} ({} bytes)", usage, kind, raw, bytes.len());
        Ok(BufferHandle::new(raw))
    }

    fn write_buffer(&self, handle: &BufferHandle, offset: u64, bytes: &[u8]) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .get_mut(&handle.raw())
            .ok_or(BackendError::InvalidHandle(handle.raw()))?;
        let start = offset as usize;
        let end = start + bytes.len();
        if end > buffer.bytes.len() {
            return Err(BackendError::Upload(format!(
                "write of {} bytes at {} overruns {} buffer of {} bytes",
                bytes.len(),
                offset,
                buffer.kind,
                buffer.bytes.len()
            )));
        }
        buffer.bytes[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn destroy_buffer(&self, handle: BufferHandle) {
        let mut state = self.state.lock();
        let raw = handle.raw();
        state.buffers.remove(&raw);
        state.bound.retain(|_, bound| *bound != raw);
    }

    fn bind_buffer(&self, handle: &BufferHandle, point: BindPoint) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if !state.buffers.contains_key(&handle.raw()) {
            return Err(BackendError::InvalidHandle(handle.raw()));
        }
        state.bound.insert(point, handle.raw());
        Ok(())
    }

    fn unbind_buffer(&self, point: BindPoint) {
        self.state.lock().bound.remove(&point);
    }

    fn upload_to_gpu(&self, scratch: &[u8], size: usize) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(BackendError::Unavailable);
        }
        let size = size.min(scratch.len());
        state.transfer.clear();
        state.transfer.extend_from_slice(&scratch[..size]);
        state.stats.bytes_uploaded += size as u64;
        Ok(())
    }

    fn download_from_gpu(&self, scratch: &mut [u8], size: usize) -> Result<usize, BackendError> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(BackendError::Unavailable);
        }
        let n = size.min(scratch.len()).min(state.transfer.len());
        scratch[..n].copy_from_slice(&state.transfer[..n]);
        state.stats.bytes_downloaded += n as u64;
        Ok(n)
    }

    fn render_geometry(&self, params: &DrawParams) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        Self::check_draw(&state, params)?;
        state.stats.draw_calls += 1;
        state.stats.triangles += u64::from(params.index_count / 3);
        Ok(())
    }

    fn render_instanced_geometry(&self, params: &DrawParams) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        Self::check_draw(&state, params)?;
        let instances = Self::bound_bytes(&state, BindPoint::INSTANCES)?;
        let needed = params.instance_count as usize * std::mem::size_of::<InstanceTransform>();
        if instances.len() < needed {
            return Err(BackendError::Draw(format!(
                "instance buffer holds {} bytes, draw needs {}",
                instances.len(),
                needed
            )));
        }
        state.stats.instanced_draw_calls += 1;
        state.stats.instances += u64::from(params.instance_count);
        state.stats.triangles += u64::from(params.index_count / 3) * u64::from(params.instance_count);
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::software()
    }

    fn limits(&self) -> Limits {
        Limits::conservative()
    }

    fn evict_memory_block(&self, id: &BlockId) -> Result<(), BackendError> {
        log::debug!("software: evict {}", id);
        self.state.lock().stats.evictions += 1;
        Ok(())
    }

    fn restore_memory_block(&self, id: &BlockId) -> Result<(), BackendError> {
        log::debug!("software: restore {}", id);
        self.state.lock().stats.restorations += 1;
        Ok(())
    }

    fn submit_barriers(&self, barriers: &[BarrierType]) -> Result<(), BackendError> {
        self.state.lock().stats.barriers_submitted += barriers.len() as u64;
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.buffers.clear();
        state.bound.clear();
        state.transfer.clear();
        state.shut_down = true;
    }
}

// ===================================================================
// Tests
// ===================================================================
