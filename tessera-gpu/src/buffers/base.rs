//! Shared buffer machinery.
//!
//! A [`GpuBuffer`] owns the authoritative CPU copy of its contents and,
//! while it has one, exactly one backend handle. The CPU copy is what makes
//! recreation possible: after a backend switch, after `cleanup`, or when an
//! update outgrows the handle.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytemuck::Pod;
use tessera_core::{BackendKind, BufferKind, BufferUsage, GpuError, GpuResult};

use crate::backend::{BindPoint, BufferHandle, GpuBackend};
use crate::memory::pool::Lease;

/// Element types a buffer can hold.
pub trait BufferElement: Pod + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl BufferElement for f32 {}
impl BufferElement for u32 {}

pub struct GpuBuffer<T: BufferElement> {
    kind: BufferKind,
    data: Vec<T>,
    usage: BufferUsage,
    backend: Arc<dyn GpuBackend>,
    handle: Option<BufferHandle>,
    /// Bytes the current handle was created with.
    capacity_bytes: usize,
    bound: Option<BindPoint>,
    last_accessed: Instant,
    lease: Option<Lease>,
}

impl<T: BufferElement> GpuBuffer<T> {
    pub fn new(kind: BufferKind, backend: Arc<dyn GpuBackend>, data: Vec<T>, usage: BufferUsage) -> GpuResult<Self> {
        let mut buffer = Self {
            kind,
            data,
            usage,
            backend,
            handle: None,
            capacity_bytes: 0,
            bound: None,
            last_accessed: Instant::now(),
            lease: None,
        };
        buffer.create_handle()?;
        Ok(buffer)
    }

    // ───────────────────── Accessors ──────────────────────────────

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn size_bytes(&self) -> usize {
        std::mem::size_of_val(self.data.as_slice())
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn handle(&self) -> Option<&BufferHandle> {
        self.handle.as_ref()
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    pub fn bound_at(&self) -> Option<BindPoint> {
        self.bound
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    pub(crate) fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    pub(crate) fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub(crate) fn set_lease(&mut self, lease: Lease) {
        self.lease = Some(lease);
    }

    pub(crate) fn take_lease(&mut self) -> Option<Lease> {
        self.lease.take()
    }

    pub(crate) fn set_usage(&mut self, usage: BufferUsage) {
        self.usage = usage;
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
    }

    // ───────────────────── Backend handle ─────────────────────────

    fn create_handle(&mut self) -> GpuResult<()> {
        let handle = self
            .backend
            .create_buffer(self.kind, bytemuck::cast_slice(self.data.as_slice()), self.usage)?;
        self.capacity_bytes = self.size_bytes();
        self.handle = Some(handle);
        Ok(())
    }

    /// Replace the handle with a fresh one sized to the CPU copy, keeping
    /// the binding if there was one.
    fn recreate_handle(&mut self) -> GpuResult<()> {
        let rebind = self.bound;
        self.unbind();
        if let Some(old) = self.handle.take() {
            self.backend.destroy_buffer(old);
        }
        self.capacity_bytes = 0;
        self.create_handle()?;
        if let Some(point) = rebind {
            self.bind(point)?;
        }
        Ok(())
    }

    // ───────────────────── Updates ────────────────────────────────

    /// Replace the contents.
    ///
    /// Rewrites the existing handle when the new data fits, recreates it
    /// when it has grown.
    pub fn update_data(&mut self, data: &[T]) -> GpuResult<()> {
        self.data.clear();
        self.data.extend_from_slice(data);
        self.touch();
        let fits = self.handle.is_some() && self.size_bytes() <= self.capacity_bytes;
        if !fits {
            return self.recreate_handle();
        }
        if let Some(handle) = &self.handle {
            self.backend
                .write_buffer(handle, 0, bytemuck::cast_slice(self.data.as_slice()))?;
        }
        Ok(())
    }

    /// Overwrite `data.len()` elements starting at element `offset`.
    pub fn update_sub_data(&mut self, offset: usize, data: &[T]) -> GpuResult<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                GpuError::InvalidBufferData(format!(
                    "sub-update of {} elements at {} exceeds {} buffer of {} elements",
                    data.len(),
                    offset,
                    self.kind,
                    self.data.len()
                ))
            })?;
        self.data[offset..end].copy_from_slice(data);
        self.touch();
        if let Some(handle) = &self.handle {
            let byte_offset = (offset * std::mem::size_of::<T>()) as u64;
            self.backend
                .write_buffer(handle, byte_offset, bytemuck::cast_slice(data))?;
        }
        Ok(())
    }

    // ───────────────────── Binding ────────────────────────────────

    /// Bind at `point`, recreating the handle first if it was released.
    pub fn bind(&mut self, point: BindPoint) -> GpuResult<()> {
        if self.handle.is_none() {
            self.create_handle()?;
        }
        if let Some(handle) = &self.handle {
            self.backend.bind_buffer(handle, point)?;
        }
        self.bound = Some(point);
        self.touch();
        Ok(())
    }

    /// Idempotent.
    pub fn unbind(&mut self) {
        if let Some(point) = self.bound.take() {
            self.backend.unbind_buffer(point);
        }
    }

    // ───────────────────── Lifetime ───────────────────────────────

    /// Unbind and destroy the backend handle. The CPU copy survives.
    pub fn cleanup(&mut self) {
        self.unbind();
        if let Some(handle) = self.handle.take() {
            self.backend.destroy_buffer(handle);
        }
        self.capacity_bytes = 0;
    }

    /// Move to another backend, rebuilding the handle from the CPU copy.
    pub fn rebind_backend(&mut self, backend: Arc<dyn GpuBackend>) -> GpuResult<()> {
        self.cleanup();
        self.backend = backend;
        self.create_handle()
    }

    pub(crate) fn is_on(&self, backend: &Arc<dyn GpuBackend>) -> bool {
        Arc::ptr_eq(&self.backend, backend)
    }
}

impl<T: BufferElement> Drop for GpuBuffer<T> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl<T: BufferElement> fmt::Debug for GpuBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("usage", &self.usage)
            .field("backend", &self.backend.kind())
            .field("handle", &self.handle.as_ref().map(BufferHandle::raw))
            .field("bound", &self.bound)
            .finish()
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;

    fn software() -> (Arc<SoftwareBackend>, Arc<dyn GpuBackend>) {
        let sw = Arc::new(SoftwareBackend::new());
        let dynamic: Arc<dyn GpuBackend> = sw.clone();
        (sw, dynamic)
    }

    #[test]
    fn test_new_creates_handle() {
        let (sw, backend) = software();
        let buf = GpuBuffer::new(BufferKind::Vertex, backend, vec![1.0f32, 2.0], BufferUsage::Static).unwrap();
        assert!(buf.has_handle());
        assert_eq!(buf.size_bytes(), 8);
        assert_eq!(buf.capacity_bytes(), 8);
        assert_eq!(sw.frame_stats().buffers_live, 1);
    }

    #[test]
    fn test_update_data_grows_handle() {
        let (sw, backend) = software();
        let mut buf = GpuBuffer::new(BufferKind::Index, backend, vec![0u32, 1, 2], BufferUsage::Dynamic).unwrap();
        let first = buf.handle().map(BufferHandle::raw);
        buf.update_data(&[2, 1]).unwrap();
        assert_eq!(buf.handle().map(BufferHandle::raw), first);
        assert_eq!(buf.capacity_bytes(), 12);
        buf.update_data(&[0, 1, 2, 3, 4, 5]).unwrap();
        assert_ne!(buf.handle().map(BufferHandle::raw), first);
        assert_eq!(buf.capacity_bytes(), 24);
        assert_eq!(sw.frame_stats().buffers_live, 1);
    }

    #[test]
    fn test_update_sub_data_bounds() {
        let (_sw, backend) = software();
        let mut buf = GpuBuffer::new(BufferKind::Vertex, backend, vec![0.0f32; 4], BufferUsage::Dynamic).unwrap();
        buf.update_sub_data(2, &[5.0, 6.0]).unwrap();
        assert_eq!(buf.data(), &[0.0, 0.0, 5.0, 6.0]);
        assert!(matches!(buf.update_sub_data(3, &[1.0, 1.0]), Err(GpuError::InvalidBufferData(_))));
        assert!(buf.update_sub_data(usize::MAX, &[1.0]).is_err());
    }

    #[test]
    fn test_unbind_is_idempotent() {
        let (_sw, backend) = software();
        let mut buf = GpuBuffer::new(BufferKind::Vertex, backend, vec![0.0f32; 4], BufferUsage::Static).unwrap();
        buf.bind(BindPoint::GEOMETRY).unwrap();
        assert!(buf.is_bound());
        buf.unbind();
        buf.unbind();
        assert!(!buf.is_bound());
    }

    #[test]
    fn test_cleanup_then_bind_recreates() {
        let (sw, backend) = software();
        let mut buf = GpuBuffer::new(BufferKind::Uniform, backend, vec![1.0f32; 4], BufferUsage::Dynamic).unwrap();
        buf.cleanup();
        assert!(!buf.has_handle());
        assert_eq!(sw.frame_stats().buffers_live, 0);
        buf.bind(BindPoint::Uniform(0)).unwrap();
        assert!(buf.has_handle());
        assert_eq!(sw.frame_stats().buffers_live, 1);
    }

    #[test]
    fn test_drop_destroys_handle() {
        let (sw, backend) = software();
        {
            let _buf = GpuBuffer::new(BufferKind::Vertex, backend, vec![0.0f32; 8], BufferUsage::Static).unwrap();
            assert_eq!(sw.frame_stats().buffers_live, 1);
        }
        assert_eq!(sw.frame_stats().buffers_live, 0);
    }

    #[test]
    fn test_rebind_backend_moves_handle() {
        let (old_sw, old) = software();
        let (new_sw, new) = software();
        let mut buf = GpuBuffer::new(BufferKind::Vertex, old, vec![3.0f32; 3], BufferUsage::Static).unwrap();
        buf.rebind_backend(new.clone()).unwrap();
        assert!(buf.is_on(&new));
        assert_eq!(old_sw.frame_stats().buffers_live, 0);
        assert_eq!(new_sw.frame_stats().buffers_live, 1);
        assert_eq!(buf.data(), &[3.0, 3.0, 3.0]);
    }
}
