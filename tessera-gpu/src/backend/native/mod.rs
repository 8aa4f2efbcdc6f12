//! Native backend over `wgpu`.
//!
//! ```text
//!  create_buffer ──▶ wgpu::Buffer (handle table)
//!  bind_buffer   ──▶ bind point table
//!  render_*      ──▶ offscreen target, cached pipeline per stride
//!  upload_to_gpu ──▶ Queue::write_buffer(transfer)
//!  download      ──▶ copy transfer → readback, map_async, poll(Wait)
//! ```
//!
//! Every call that can trip wgpu validation runs inside an error scope so
//! the failure comes back as a [`BackendError`] rather than a panic in the
//! uncaptured-error handler.

pub mod context;
pub mod pipeline;
pub mod vertex;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tessera_core::{BackendError, BackendKind, BarrierType, BufferKind, BufferUsage, GpuConfig, ProbeError};
use wgpu::util::DeviceExt;
use wgpu::{
    BufferUsages, Color, CommandEncoderDescriptor, IndexFormat, LoadOp, Operations, RenderPassColorAttachment,
    RenderPassDescriptor, StoreOp, TextureDescriptor, TextureDimension, TextureUsages, TextureView,
    TextureViewDescriptor,
};

use self::context::{backends_for, ContextError, GpuContext};
use self::pipeline::GeometryPipelines;
use self::vertex::MIN_STRIDE_FLOATS;
use super::{BindPoint, BufferHandle, DrawParams, GpuBackend};
use crate::device::{Capabilities, Limits};

/// Round `n` up to `wgpu::COPY_BUFFER_ALIGNMENT`.
fn align_copy(n: u64) -> u64 {
    let a = wgpu::COPY_BUFFER_ALIGNMENT;
    n.div_ceil(a) * a
}

/// Copy `bytes` into a buffer padded to the copy alignment (at least one
/// aligned word).
fn padded(bytes: &[u8]) -> Vec<u8> {
    let len = align_copy(bytes.len() as u64).max(wgpu::COPY_BUFFER_ALIGNMENT) as usize;
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(bytes);
    out.resize(len, 0);
    out
}

struct NativeBuffer {
    buffer: wgpu::Buffer,
    kind: BufferKind,
}

struct NativeState {
    next_handle: u64,
    buffers: FxHashMap<u64, NativeBuffer>,
    bound: FxHashMap<BindPoint, u64>,
    pipelines: GeometryPipelines,
    /// Valid bytes currently in the transfer buffer.
    transfer_len: usize,
    shut_down: bool,
}

pub struct NativeBackend {
    kind: BackendKind,
    ctx: GpuContext,
    target_view: TextureView,
    transfer: wgpu::Buffer,
    readback: wgpu::Buffer,
    capabilities: Capabilities,
    limits: Limits,
    state: Mutex<NativeState>,
}

impl NativeBackend {
    /// Bring up `kind` headlessly.
    pub fn probe(kind: BackendKind, config: &GpuConfig) -> Result<Self, ProbeError> {
        let backends = backends_for(kind).ok_or(ProbeError::UnsupportedPlatform(kind))?;
        let ctx = pollster::block_on(GpuContext::new_headless(backends)).map_err(|e| match e {
            ContextError::NoAdapter => ProbeError::NoAdapter(kind),
            ContextError::RequestDevice(e) => ProbeError::RequestDevice {
                kind,
                reason: e.to_string(),
            },
        })?;
        Ok(Self::with_context(kind, ctx, config))
    }

    fn with_context(kind: BackendKind, ctx: GpuContext, config: &GpuConfig) -> Self {
        let wgpu_limits = ctx.device.limits();
        let limits = Limits::from_wgpu(&wgpu_limits);
        let capabilities = Capabilities::from_adapter(&ctx.adapter);

        let size = config.render_target_size.min(wgpu_limits.max_texture_dimension_2d).max(1);
        let target = ctx.device.create_texture(&TextureDescriptor {
            label: Some("tessera_offscreen_target"),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: ctx.target_format,
            usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let target_view = target.create_view(&TextureViewDescriptor::default());

        let transfer_size = align_copy(config.staging.staging_buffer_size as u64)
            .min(wgpu_limits.max_buffer_size)
            .max(wgpu::COPY_BUFFER_ALIGNMENT);
        let transfer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tessera_transfer"),
            size: transfer_size,
            usage: BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tessera_readback"),
            size: transfer_size,
            usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let pipelines = GeometryPipelines::new(&ctx.device, ctx.target_format);
        log::info!(
            "Native {} backend on '{}' ({}x{} target, {} byte transfer region)",
            kind,
            ctx.adapter_name(),
            size,
            size,
            transfer_size
        );

        Self {
            kind,
            ctx,
            target_view,
            transfer,
            readback,
            capabilities,
            limits,
            state: Mutex::new(NativeState {
                next_handle: 1,
                buffers: FxHashMap::default(),
                bound: FxHashMap::default(),
                pipelines,
                transfer_len: 0,
                shut_down: false,
            }),
        }
    }

    fn buffer_usages(kind: BufferKind) -> BufferUsages {
        let base = match kind {
            BufferKind::Vertex => BufferUsages::VERTEX,
            BufferKind::Index => BufferUsages::INDEX,
            BufferKind::Uniform => BufferUsages::UNIFORM,
        };
        base | BufferUsages::COPY_DST
    }

    fn bound_buffer<'a>(state: &'a NativeState, point: BindPoint) -> Result<&'a wgpu::Buffer, BackendError> {
        let raw = state
            .bound
            .get(&point)
            .ok_or_else(|| BackendError::Draw(format!("nothing bound at {point:?}")))?;
        state
            .buffers
            .get(raw)
            .map(|b| &b.buffer)
            .ok_or(BackendError::InvalidHandle(*raw))
    }

    fn draw(&self, params: &DrawParams, instanced: bool) -> Result<(), BackendError> {
        let mut guard = self.state.lock();
        if guard.shut_down {
            return Err(BackendError::Unavailable);
        }
        if params.stride_floats < MIN_STRIDE_FLOATS {
            return Err(BackendError::Draw(format!(
                "stride of {} floats cannot carry a 2D position",
                params.stride_floats
            )));
        }
        let state = &mut *guard;
        let device = &self.ctx.device;

        // Build the pipeline before borrowing buffers out of the same state.
        state.pipelines.get_or_create(device, params.stride_floats, instanced);
        let state = &*state;

        let vertices = Self::bound_buffer(state, BindPoint::GEOMETRY)?;
        let needed = u64::from(params.vertex_count) * u64::from(params.stride_floats) * 4;
        if vertices.size() < needed {
            return Err(BackendError::Draw(format!(
                "vertex buffer holds {} bytes, draw needs {}",
                vertices.size(),
                needed
            )));
        }
        let indices = if params.index_count > 0 {
            let ib = Self::bound_buffer(state, BindPoint::Index)?;
            if ib.size() < u64::from(params.index_count) * 4 {
                return Err(BackendError::Draw(format!(
                    "index buffer holds {} bytes, draw needs {}",
                    ib.size(),
                    u64::from(params.index_count) * 4
                )));
            }
            Some(ib)
        } else {
            None
        };
        let instances = if instanced {
            Some(Self::bound_buffer(state, BindPoint::INSTANCES)?)
        } else {
            None
        };

        let pipelines = &state.pipelines;
        self.ctx
            .scoped(|| {
                let mut encoder = device.create_command_encoder(&CommandEncoderDescriptor {
                    label: Some("tessera_draw_encoder"),
                });
                {
                    let mut pass = encoder.begin_render_pass(&RenderPassDescriptor {
                        label: Some("tessera_geometry_pass"),
                        color_attachments: &[Some(RenderPassColorAttachment {
                            view: &self.target_view,
                            resolve_target: None,
                            ops: Operations {
                                load: LoadOp::Clear(Color::TRANSPARENT),
                                store: StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: None,
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });

                    if let Some(pipeline) = pipelines.cached(params.stride_floats, instanced) {
                        pass.set_pipeline(pipeline);
                    }
                    pass.set_vertex_buffer(0, vertices.slice(..));
                    if let Some(inst) = instances {
                        pass.set_vertex_buffer(1, inst.slice(..));
                    }
                    let instance_range = 0..params.instance_count.max(1);
                    match indices {
                        Some(ib) => {
                            pass.set_index_buffer(ib.slice(..), IndexFormat::Uint32);
                            pass.draw_indexed(0..params.index_count, 0, instance_range);
                        }
                        None => pass.draw(0..params.vertex_count, instance_range),
                    }
                }
                self.ctx.queue.submit(std::iter::once(encoder.finish()));
            })
            .map_err(BackendError::Draw)
    }
}

impl GpuBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        !self.state.lock().shut_down
    }

    fn create_buffer(&self, kind: BufferKind, bytes: &[u8], usage: BufferUsage) -> Result<BufferHandle, BackendError> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(BackendError::Unavailable);
        }
        let contents = padded(bytes);
        let buffer = self
            .ctx
            .scoped(|| {
                self.ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(kind.as_str()),
                    contents: &contents,
                    usage: Self::buffer_usages(kind),
                })
            })
            .map_err(BackendError::CreateBuffer)?;

        let raw = state.next_handle;
        state.next_handle += 1;
        state.buffers.insert(raw, NativeBuffer { buffer, kind });
        log::debug!("{}: created {} {} buffer #{} ({} bytes)", self.kind, usage, kind, raw, bytes.len());
        Ok(BufferHandle::new(raw))
    }

    fn write_buffer(&self, handle: &BufferHandle, offset: u64, bytes: &[u8]) -> Result<(), BackendError> {
        let state = self.state.lock();
        let native = state
            .buffers
            .get(&handle.raw())
            .ok_or(BackendError::InvalidHandle(handle.raw()))?;
        if bytes.is_empty() {
            return Ok(());
        }
        let data = padded(bytes);
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || offset + data.len() as u64 > native.buffer.size() {
            return Err(BackendError::Upload(format!(
                "write of {} bytes at {} does not fit {} buffer of {} bytes",
                bytes.len(),
                offset,
                native.kind,
                native.buffer.size()
            )));
        }
        self.ctx
            .scoped(|| self.ctx.queue.write_buffer(&native.buffer, offset, &data))
            .map_err(BackendError::Upload)
    }

    fn destroy_buffer(&self, handle: BufferHandle) {
        let mut state = self.state.lock();
        let raw = handle.raw();
        if let Some(native) = state.buffers.remove(&raw) {
            native.buffer.destroy();
        }
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
        if size as u64 > self.transfer.size() {
            return Err(BackendError::Upload(format!(
                "{} bytes exceed the {} byte transfer region",
                size,
                self.transfer.size()
            )));
        }
        if size > 0 {
            let data = padded(&scratch[..size]);
            self.ctx
                .scoped(|| {
                    self.ctx.queue.write_buffer(&self.transfer, 0, &data);
                    self.ctx.queue.submit(std::iter::empty());
                })
                .map_err(BackendError::Upload)?;
        }
        state.transfer_len = size;
        Ok(())
    }

    fn download_from_gpu(&self, scratch: &mut [u8], size: usize) -> Result<usize, BackendError> {
        let state = self.state.lock();
        if state.shut_down {
            return Err(BackendError::Unavailable);
        }
        let n = size.min(scratch.len()).min(state.transfer_len);
        if n == 0 {
            return Ok(0);
        }
        let copy_len = align_copy(n as u64).min(self.readback.size());

        self.ctx
            .scoped(|| {
                let mut encoder = self.ctx.device.create_command_encoder(&CommandEncoderDescriptor {
                    label: Some("tessera_readback_encoder"),
                });
                encoder.copy_buffer_to_buffer(&self.transfer, 0, &self.readback, 0, copy_len);
                self.ctx.queue.submit(std::iter::once(encoder.finish()));
            })
            .map_err(BackendError::Download)?;

        let slice = self.readback.slice(0..copy_len);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.ctx.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BackendError::Download(e.to_string())),
            Err(_) => return Err(BackendError::Download("map callback dropped".into())),
        }
        {
            let mapped = slice.get_mapped_range();
            scratch[..n].copy_from_slice(&mapped[..n]);
        }
        self.readback.unmap();
        Ok(n)
    }

    fn render_geometry(&self, params: &DrawParams) -> Result<(), BackendError> {
        self.draw(params, false)
    }

    fn render_instanced_geometry(&self, params: &DrawParams) -> Result<(), BackendError> {
        self.draw(params, true)
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn limits(&self) -> Limits {
        self.limits.clone()
    }

    /// wgpu tracks hazards itself; a barrier batch becomes a queue flush.
    fn submit_barriers(&self, barriers: &[BarrierType]) -> Result<(), BackendError> {
        if self.state.lock().shut_down {
            return Err(BackendError::Unavailable);
        }
        log::debug!("{}: flushing queue for {} barrier(s)", self.kind, barriers.len());
        self.ctx.queue.submit(std::iter::empty());
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), BackendError> {
        if self.state.lock().shut_down {
            return Err(BackendError::Unavailable);
        }
        let _ = self.ctx.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        for (_, native) in state.buffers.drain() {
            native.buffer.destroy();
        }
        state.bound.clear();
        state.transfer_len = 0;
        state.shut_down = true;
        log::info!("{} backend shut down", self.kind);
    }
}

// ===================================================================
// Tests
// ===================================================================
