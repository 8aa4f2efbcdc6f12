//! Vertex buffers: interleaved `f32` attributes with a fixed stride.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tessera_core::geometry::DEFAULT_STRIDE_FLOATS;
use tessera_core::{BufferKind, BufferUsage, GpuError, GpuResult};

use super::base::GpuBuffer;
use crate::backend::GpuBackend;

#[derive(Debug)]
pub struct VertexBuffer {
    inner: GpuBuffer<f32>,
    stride_floats: usize,
}

impl VertexBuffer {
    pub fn new(backend: Arc<dyn GpuBackend>, data: Vec<f32>, usage: BufferUsage) -> GpuResult<Self> {
        Self::with_stride(backend, data, usage, DEFAULT_STRIDE_FLOATS)
    }

    pub fn with_stride(
        backend: Arc<dyn GpuBackend>,
        data: Vec<f32>,
        usage: BufferUsage,
        stride_floats: usize,
    ) -> GpuResult<Self> {
        check_stride(stride_floats)?;
        Ok(Self {
            inner: GpuBuffer::new(BufferKind::Vertex, backend, data, usage)?,
            stride_floats,
        })
    }

    pub fn stride_floats(&self) -> usize {
        self.stride_floats
    }

    pub fn set_stride(&mut self, stride_floats: usize) -> GpuResult<()> {
        check_stride(stride_floats)?;
        self.stride_floats = stride_floats;
        Ok(())
    }

    /// Whole vertices in the buffer; a trailing partial vertex is ignored.
    pub fn vertex_count(&self) -> usize {
        self.inner.len() / self.stride_floats
    }

    /// Attributes of vertex `i`.
    pub fn vertex(&self, i: usize) -> Option<&[f32]> {
        let start = i.checked_mul(self.stride_floats)?;
        let end = start.checked_add(self.stride_floats)?;
        self.inner.data().get(start..end)
    }

    /// Overwrite vertex `i`. `attrs` must be exactly one stride long.
    pub fn set_vertex(&mut self, i: usize, attrs: &[f32]) -> GpuResult<()> {
        if attrs.len() != self.stride_floats {
            return Err(GpuError::InvalidBufferData(format!(
                "vertex has {} floats, stride is {}",
                attrs.len(),
                self.stride_floats
            )));
        }
        if i >= self.vertex_count() {
            return Err(GpuError::InvalidBufferData(format!(
                "vertex {} out of range for {} vertices",
                i,
                self.vertex_count()
            )));
        }
        self.inner.update_sub_data(i * self.stride_floats, attrs)
    }
}

fn check_stride(stride_floats: usize) -> GpuResult<()> {
    if stride_floats == 0 {
        return Err(GpuError::InvalidBufferData("vertex stride must be at least one float".into()));
    }
    Ok(())
}

impl Deref for VertexBuffer {
    type Target = GpuBuffer<f32>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for VertexBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;

    fn vb(data: Vec<f32>, stride: usize) -> VertexBuffer {
        VertexBuffer::with_stride(Arc::new(SoftwareBackend::new()), data, BufferUsage::Static, stride).unwrap()
    }

    #[test]
    fn test_default_stride_is_five() {
        let buf = VertexBuffer::new(Arc::new(SoftwareBackend::new()), vec![0.0; 10], BufferUsage::Static).unwrap();
        assert_eq!(buf.stride_floats(), 5);
        assert_eq!(buf.vertex_count(), 2);
    }

    #[test]
    fn test_vertex_count_floors() {
        let mut buf = vb(vec![0.0; 7], 2);
        assert_eq!(buf.vertex_count(), 3);
        buf.set_stride(3).unwrap();
        assert_eq!(buf.vertex_count(), 2);
        assert!(buf.set_stride(0).is_err());
    }

    #[test]
    fn test_vertex_access() {
        let mut buf = vb(vec![0.0, 1.0, 2.0, 3.0], 2);
        assert_eq!(buf.vertex(1), Some(&[2.0, 3.0][..]));
        assert_eq!(buf.vertex(2), None);
        buf.set_vertex(0, &[9.0, 8.0]).unwrap();
        assert_eq!(buf.data(), &[9.0, 8.0, 2.0, 3.0]);
        assert!(buf.set_vertex(2, &[0.0, 0.0]).is_err());
        assert!(buf.set_vertex(0, &[0.0]).is_err());
    }
}
