//! Index buffers (`u32` indices, triangle lists).

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tessera_core::{BufferKind, BufferUsage, GpuError, GpuResult};

use super::base::GpuBuffer;
use crate::backend::GpuBackend;

#[derive(Debug)]
pub struct IndexBuffer {
    inner: GpuBuffer<u32>,
}

impl IndexBuffer {
    pub fn new(backend: Arc<dyn GpuBackend>, indices: Vec<u32>, usage: BufferUsage) -> GpuResult<Self> {
        Ok(Self {
            inner: GpuBuffer::new(BufferKind::Index, backend, indices, usage)?,
        })
    }

    pub fn index_count(&self) -> usize {
        self.inner.len()
    }

    pub fn max_index(&self) -> Option<u32> {
        self.inner.data().iter().copied().max()
    }

    /// Fail if any index points past `vertex_count`.
    pub fn validate_against(&self, vertex_count: usize) -> GpuResult<()> {
        match self.max_index() {
            Some(max) if max as usize >= vertex_count => Err(GpuError::InvalidBufferData(format!(
                "index {} out of range for {} vertices",
                max, vertex_count
            ))),
            _ => Ok(()),
        }
    }
}

impl Deref for IndexBuffer {
    type Target = GpuBuffer<u32>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for IndexBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
