//! Device manager: the one object callers hold.
//!
//! Owns the selected backend, a CPU software backend for fallback draws,
//! and one instance of every resource manager. There is no global; build
//! as many managers as you need.
//!
//! ```text
//!  render_geometry(geometry)
//!     │ validate
//!     │ GpuWorkGuard  (blocks defragment)
//!     │ acquire pooled vertex/index buffers
//!     │ bind ─▶ backend draw ─▶ unbind ─▶ release   (always)
//!     │
//!     ├─ Ok           ──▶ RenderPath::Gpu / RenderPath::Software
//!     ├─ Err(Backend) ──▶ fallback.render_cpu ──▶ RenderPath::CpuFallback
//!     └─ Err(other)   ──▶ returned to the caller
//! ```

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tessera_core::geometry::DEFAULT_STRIDE_FLOATS;
use tessera_core::{
    BackendError, BackendKind, BufferKind, BufferUsage, Geometry, GpuConfig, GpuError, GpuResult, InstanceTransform,
    MemoryBlock,
};

use super::{Capabilities, Limits};
use crate::backend::{select_backend, BindPoint, DrawParams, GpuBackend, SoftwareBackend};
use crate::buffers::{IndexBuffer, UniformBuffer, UniformLayout, VertexBuffer};
use crate::memory::{
    AllocatorStats, LeakReport, MemoryAllocator, MemoryStats, PoolStats, ResidencyManager, StagingManager,
    SyncManager, SyncStats, TransferStats,
};

/// Where a draw actually ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderPath {
    /// On a native backend.
    Gpu,
    /// On the software backend, which was the selected backend.
    Software,
    /// The selected backend failed and the CPU path redid the draw.
    CpuFallback,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RenderStats {
    pub draws: u64,
    pub instanced_draws: u64,
    pub gpu_draws: u64,
    pub software_draws: u64,
    pub cpu_fallbacks: u64,
}

/// What `end_frame` did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FrameReport {
    pub transfers_completed: usize,
    pub barriers_flushed: usize,
    pub bytes_evicted: u64,
    pub leaks_detected: u64,
}

/// Aggregate of every component's statistics.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceStats {
    pub backend: BackendKind,
    pub capabilities: Capabilities,
    pub limits: Limits,
    pub allocator: AllocatorStats,
    pub memory: MemoryStats,
    pub transfers: TransferStats,
    pub sync: SyncStats,
    pub render: RenderStats,
}

pub struct DeviceManager {
    config: GpuConfig,
    backend: RwLock<Arc<dyn GpuBackend>>,
    fallback: Arc<SoftwareBackend>,
    allocator: MemoryAllocator,
    residency: ResidencyManager,
    staging: StagingManager,
    sync: SyncManager,
    render_stats: Mutex<RenderStats>,
}

impl DeviceManager {
    /// Validate `config` and bring up the first backend in its chain.
    pub fn new(config: GpuConfig) -> GpuResult<Self> {
        config.validate()?;
        let backend = select_backend(&config);
        Ok(Self::with_backend(config, backend))
    }

    /// Build around an already constructed backend.
    pub fn with_backend(config: GpuConfig, backend: Arc<dyn GpuBackend>) -> Self {
        log::info!("Device manager starting on {} backend", backend.kind());
        Self {
            allocator: MemoryAllocator::new(config.allocator.clone(), backend.clone()),
            residency: ResidencyManager::new(config.residency.clone(), backend.clone()),
            staging: StagingManager::new(config.staging.clone(), backend.clone()),
            sync: SyncManager::new(backend.clone()),
            backend: RwLock::new(backend),
            fallback: Arc::new(SoftwareBackend::new()),
            render_stats: Mutex::new(RenderStats::default()),
            config,
        }
    }

    // ───────────────────── Components ────────────────────────────

    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    pub fn backend(&self) -> Arc<dyn GpuBackend> {
        self.backend.read().clone()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.read().kind()
    }

    pub fn allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    pub fn residency(&self) -> &ResidencyManager {
        &self.residency
    }

    pub fn staging(&self) -> &StagingManager {
        &self.staging
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    /// The CPU backend used for fallback draws.
    pub fn fallback(&self) -> &SoftwareBackend {
        &self.fallback
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend.read().capabilities()
    }

    pub fn limits(&self) -> Limits {
        self.backend.read().limits()
    }

    /// Probe the configured chain again and move every component onto the
    /// result. Returns the new backend kind.
    pub fn reselect_backend(&self) -> BackendKind {
        let next = select_backend(&self.config);
        let kind = next.kind();
        self.switch_backend(next);
        kind
    }

    /// Move every component onto `backend`.
    pub fn switch_backend(&self, backend: Arc<dyn GpuBackend>) {
        let previous = std::mem::replace(&mut *self.backend.write(), backend.clone());
        if let Err(e) = previous.wait_idle() {
            log::warn!("Previous {} backend did not go idle: {}", previous.kind(), e);
        }
        self.allocator.set_backend(backend.clone());
        self.residency.set_backend(backend.clone());
        self.staging.set_backend(backend.clone());
        self.sync.set_backend(backend);
        log::info!("Switched from {} to {} backend", previous.kind(), self.backend_kind());
    }

    // ───────────────────── Buffers ────────────────────────────────

    pub fn acquire_vertex_buffer(&self, data: &[f32], usage: BufferUsage, stride_floats: usize) -> GpuResult<VertexBuffer> {
        if stride_floats == 0 {
            return Err(GpuError::InvalidBufferData("vertex stride must be at least one float".into()));
        }
        self.limits()
            .validate_buffer_size(BufferKind::Vertex, std::mem::size_of_val(data) as u64)?;
        let mut buffer = self.allocator.allocate_vertex_buffer(data, usage)?;
        buffer.set_stride(stride_floats)?;
        Ok(buffer)
    }

    pub fn acquire_index_buffer(&self, data: &[u32], usage: BufferUsage) -> GpuResult<IndexBuffer> {
        self.limits()
            .validate_buffer_size(BufferKind::Index, std::mem::size_of_val(data) as u64)?;
        self.allocator.allocate_index_buffer(data, usage)
    }

    pub fn acquire_uniform_buffer(&self, values: &UniformLayout, usage: BufferUsage) -> GpuResult<UniformBuffer> {
        let bytes = values.iter().map(|(_, v)| v.rows() as u64 * 16).sum();
        self.limits().validate_buffer_size(BufferKind::Uniform, bytes)?;
        self.allocator.allocate_uniform_buffer(values, usage)
    }

    pub fn release_vertex_buffer(&self, buffer: VertexBuffer) -> GpuResult<()> {
        self.allocator.release_vertex_buffer(buffer)
    }

    pub fn release_index_buffer(&self, buffer: IndexBuffer) -> GpuResult<()> {
        self.allocator.release_index_buffer(buffer)
    }

    pub fn release_uniform_buffer(&self, buffer: UniformBuffer) -> GpuResult<()> {
        self.allocator.release_uniform_buffer(buffer)
    }

    // ───────────────────── Rendering ──────────────────────────────

    /// Draw `geometry` through pooled buffers.
    ///
    /// Backend failures are redone on the CPU fallback; precondition errors
    /// (invalid geometry, buffers over the device limits) are returned.
    pub fn render_geometry(&self, geometry: &Geometry) -> GpuResult<RenderPath> {
        geometry.validate()?;
        let backend = self.backend();
        let _work = self.allocator.begin_gpu_work();
        self.draw_or_fallback(backend.as_ref(), geometry)
    }

    /// Draw several geometries under one work guard, reusing pooled buffers
    /// between them. Every geometry is validated before anything is drawn.
    pub fn render_geometry_batch(&self, geometries: &[Geometry]) -> GpuResult<Vec<RenderPath>> {
        for geometry in geometries {
            geometry.validate()?;
        }
        let backend = self.backend();
        let _work = self.allocator.begin_gpu_work();
        let paths = geometries
            .iter()
            .map(|geometry| self.draw_or_fallback(backend.as_ref(), geometry))
            .collect::<GpuResult<Vec<_>>>()?;
        log::debug!("Rendered batch of {} geometries on {}", paths.len(), backend.kind());
        Ok(paths)
    }

    pub fn render_instanced_geometry(
        &self,
        geometry: &Geometry,
        instances: &[InstanceTransform],
    ) -> GpuResult<RenderPath> {
        geometry.validate()?;
        let backend = self.backend();
        let _work = self.allocator.begin_gpu_work();

        let outcome = if backend.supports_instancing() {
            self.draw(backend.as_ref(), geometry, Some(instances))
        } else {
            Err(GpuError::Backend(BackendError::Unsupported("instancing")))
        };
        let path = match outcome {
            Ok(()) => Self::path_for(backend.as_ref()),
            Err(GpuError::Backend(e)) => {
                log::warn!("{} instanced draw failed, redoing on CPU: {}", backend.kind(), e);
                self.fallback.render_cpu_instanced(geometry, instances)?;
                RenderPath::CpuFallback
            }
            Err(e) => return Err(e),
        };
        self.count(path, true);
        Ok(path)
    }

    /// Caller holds the work guard.
    fn draw_or_fallback(&self, backend: &dyn GpuBackend, geometry: &Geometry) -> GpuResult<RenderPath> {
        let path = match self.draw(backend, geometry, None) {
            Ok(()) => Self::path_for(backend),
            Err(GpuError::Backend(e)) => {
                log::warn!("{} draw failed, redoing on CPU: {}", backend.kind(), e);
                self.fallback.render_cpu(geometry)?;
                RenderPath::CpuFallback
            }
            Err(e) => return Err(e),
        };
        self.count(path, false);
        Ok(path)
    }

    fn path_for(backend: &dyn GpuBackend) -> RenderPath {
        if backend.kind().is_native() {
            RenderPath::Gpu
        } else {
            RenderPath::Software
        }
    }

    fn count(&self, path: RenderPath, instanced: bool) {
        let mut stats = self.render_stats.lock();
        stats.draws += 1;
        if instanced {
            stats.instanced_draws += 1;
        }
        match path {
            RenderPath::Gpu => stats.gpu_draws += 1,
            RenderPath::Software => stats.software_draws += 1,
            RenderPath::CpuFallback => stats.cpu_fallbacks += 1,
        }
    }

    /// Acquire, bind, draw, then always unbind and release.
    fn draw(&self, backend: &dyn GpuBackend, geometry: &Geometry, instances: Option<&[InstanceTransform]>) -> GpuResult<()> {
        let stride = geometry.stride_floats();
        let mut vertices = self.acquire_vertex_buffer(&geometry.vertices, BufferUsage::Stream, stride)?;
        let mut indices = match self.acquire_index_buffer(&geometry.indices[..geometry.index_count], BufferUsage::Stream) {
            Ok(buf) => buf,
            Err(e) => {
                self.release_quietly(|a| a.release_vertex_buffer(vertices));
                return Err(e);
            }
        };
        let mut stream = match instances {
            Some(list) => {
                let flat = InstanceTransform::flatten(list);
                match self.acquire_vertex_buffer(&flat, BufferUsage::Stream, InstanceTransform::FLOATS) {
                    Ok(buf) => Some(buf),
                    Err(e) => {
                        self.release_quietly(|a| a.release_vertex_buffer(vertices));
                        self.release_quietly(|a| a.release_index_buffer(indices));
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let params = DrawParams {
            vertex_count: geometry.vertex_count as u32,
            index_count: geometry.index_count as u32,
            stride_floats: stride as u32,
            instance_count: instances.map_or(1, |list| list.len() as u32),
        };

        let result = (|| -> GpuResult<()> {
            vertices.bind(BindPoint::GEOMETRY)?;
            indices.bind(BindPoint::Index)?;
            match stream.as_mut() {
                Some(buf) => {
                    buf.bind(BindPoint::INSTANCES)?;
                    backend.render_instanced_geometry(&params)?;
                }
                None => backend.render_geometry(&params)?,
            }
            Ok(())
        })();

        // Release unbinds.
        self.release_quietly(|a| a.release_vertex_buffer(vertices));
        self.release_quietly(|a| a.release_index_buffer(indices));
        if let Some(buf) = stream {
            self.release_quietly(|a| a.release_vertex_buffer(buf));
        }
        result
    }

    fn release_quietly(&self, release: impl FnOnce(&MemoryAllocator) -> GpuResult<()>) {
        if let Err(e) = release(&self.allocator) {
            log::warn!("Failed to release draw buffer: {}", e);
        }
    }

    /// Flush pending work and apply memory policy.
    ///
    /// Processes queued transfers, submits queued barriers, evicts under
    /// memory pressure and checks for leaked buffers.
    pub fn end_frame(&self) -> GpuResult<FrameReport> {
        let transfers_completed = self.staging.flush_all_transfers()?;
        let barriers_flushed = match self.sync.flush_barriers() {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Barrier flush failed, keeping batch queued: {}", e);
                0
            }
        };
        let bytes_evicted = if self.residency.check_memory_pressure() {
            self.residency.evict_memory(None)
        } else {
            0
        };
        let leaks_detected = self.allocator.check_for_leaks().leaks_detected;
        Ok(FrameReport {
            transfers_completed,
            barriers_flushed,
            bytes_evicted,
            leaks_detected,
        })
    }

    // ───────────────────── Maintenance & stats ────────────────────

    pub fn get_pool_stats(&self) -> PoolStats {
        self.allocator.pool_stats()
    }

    pub fn check_for_leaks(&self) -> LeakReport {
        self.allocator.check_for_leaks()
    }

    pub fn defragment(&self) -> GpuResult<Vec<MemoryBlock>> {
        self.allocator.defragment()
    }

    pub fn render_stats(&self) -> RenderStats {
        *self.render_stats.lock()
    }

    pub fn stats_snapshot(&self) -> DeviceStats {
        let backend = self.backend();
        DeviceStats {
            backend: backend.kind(),
            capabilities: backend.capabilities(),
            limits: backend.limits(),
            allocator: self.allocator.get_stats(),
            memory: self.residency.get_memory_stats(),
            transfers: self.staging.get_transfer_stats(),
            sync: self.sync.get_sync_stats(),
            render: self.render_stats(),
        }
    }

    /// Drop all managed state and shut both backends down.
    pub fn shutdown(&self) {
        self.staging.cleanup();
        self.sync.cleanup();
        self.residency.cleanup();
        self.allocator.cleanup();
        let backend = self.backend();
        backend.shutdown();
        self.fallback.shutdown();
        log::info!("Device manager on {} backend shut down", backend.kind());
    }
}

impl Default for DeviceManager {
    /// Software-only manager with default budgets.
    fn default() -> Self {
        let config = GpuConfig {
            backends: vec![BackendKind::Software],
            ..GpuConfig::default()
        };
        Self::with_backend(config, Arc::new(SoftwareBackend::new()))
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::TransferData;
    use tessera_core::TransferRequest;

    fn quad() -> Geometry {
        #[rustfmt::skip]
        let vertices = vec![
            0.0, 0.0, 0.0, 0.0, 0.0,
            1.0, 0.0, 0.0, 1.0, 0.0,
            1.0, 1.0, 0.0, 1.0, 1.0,
            0.0, 1.0, 0.0, 0.0, 1.0,
        ];
        Geometry::new(vertices, vec![0, 1, 2, 0, 2, 3], DEFAULT_STRIDE_FLOATS)
    }

    fn manager() -> DeviceManager {
        DeviceManager::new(GpuConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_software_config_selects_software() {
        let dm = manager();
        assert_eq!(dm.backend_kind(), BackendKind::Software);
        assert!(dm.capabilities().instancing);
    }

    #[test]
    fn test_render_releases_buffers_to_pool() {
        let dm = manager();
        assert_eq!(dm.render_geometry(&quad()).unwrap(), RenderPath::Software);
        assert_eq!(dm.render_geometry(&quad()).unwrap(), RenderPath::Software);

        let pools = dm.get_pool_stats();
        assert_eq!(pools.vertex.created, 1);
        assert_eq!(pools.vertex.reused, 1);
        assert_eq!(pools.vertex.active, 0);
        assert_eq!(pools.index.active, 0);
        assert_eq!(dm.allocator().gpu_work_in_flight(), 0);
        assert_eq!(dm.render_stats().software_draws, 2);
    }

    #[test]
    fn test_batch_reuses_buffers_between_geometries() {
        let dm = manager();
        let paths = dm.render_geometry_batch(&[quad(), quad(), quad()]).unwrap();
        assert_eq!(paths, vec![RenderPath::Software; 3]);

        let pools = dm.get_pool_stats();
        assert_eq!(pools.vertex.created, 1);
        assert_eq!(pools.vertex.reused, 2);
        assert_eq!(dm.render_stats().draws, 3);
    }

    #[test]
    fn test_batch_validates_everything_before_drawing() {
        let dm = manager();
        let bad = Geometry::new(vec![0.0; 10], vec![0, 1, 7], DEFAULT_STRIDE_FLOATS);
        assert!(matches!(
            dm.render_geometry_batch(&[quad(), bad]),
            Err(GpuError::InvalidGeometry(_))
        ));
        assert_eq!(dm.render_stats().draws, 0);
    }

    #[test]
    fn test_instanced_render() {
        let dm = manager();
        let instances = [InstanceTransform::at(1.0, 2.0), InstanceTransform::at(3.0, 4.0).with_scale(2.0, 2.0)];
        assert_eq!(dm.render_instanced_geometry(&quad(), &instances).unwrap(), RenderPath::Software);
        let backend_stats = dm.render_stats();
        assert_eq!(backend_stats.instanced_draws, 1);
        assert_eq!(dm.get_pool_stats().vertex.created, 2);
    }

    #[test]
    fn test_invalid_geometry_is_rejected_up_front() {
        let dm = manager();
        let bad = Geometry::new(vec![0.0; 10], vec![0, 1, 9], 5);
        assert!(matches!(dm.render_geometry(&bad), Err(GpuError::InvalidGeometry(_))));
        assert_eq!(dm.render_stats().draws, 0);
    }

    #[test]
    fn test_shutdown_backend_falls_back_to_cpu() {
        let dm = manager();
        dm.backend().shutdown();
        assert_eq!(dm.render_geometry(&quad()).unwrap(), RenderPath::CpuFallback);
        assert_eq!(dm.fallback().frame_stats().draw_calls, 1);
    }

    #[test]
    fn test_oversized_uniform_rejected() {
        let dm = manager();
        let values: Vec<(String, crate::buffers::UniformValue)> = (0..5000)
            .map(|i| (format!("u{i}"), crate::buffers::UniformValue::Scalar(0.0)))
            .collect();
        assert!(matches!(
            dm.acquire_uniform_buffer(&values, BufferUsage::Dynamic),
            Err(GpuError::LimitExceeded { .. })
        ));
    }

    #[test]
    fn test_end_frame_flushes_queues() {
        let dm = manager();
        dm.staging()
            .queue_transfer(TransferRequest::upload(TransferData::Bytes(vec![1, 2, 3, 4])))
            .unwrap();
        dm.sync().issue_barrier(tessera_core::BarrierType::All, None);
        let report = dm.end_frame().unwrap();
        assert_eq!(report.transfers_completed, 1);
        assert_eq!(report.barriers_flushed, 1);
        assert_eq!(report.leaks_detected, 0);
    }

    #[test]
    fn test_switch_backend_moves_components() {
        let dm = manager();
        dm.render_geometry(&quad()).unwrap();
        let next: Arc<dyn GpuBackend> = Arc::new(SoftwareBackend::new());
        dm.switch_backend(next.clone());
        assert!(Arc::ptr_eq(&dm.backend(), &next));
        assert_eq!(dm.render_geometry(&quad()).unwrap(), RenderPath::Software);
        assert_eq!(dm.get_pool_stats().vertex.reused, 1);
    }

    #[test]
    fn test_stats_snapshot_serializes() {
        let dm = manager();
        dm.render_geometry(&quad()).unwrap();
        let json = serde_json::to_value(dm.stats_snapshot()).unwrap();
        assert_eq!(json["backend"], "software");
        assert_eq!(json["render"]["draws"], 1);
    }
}
