//! Hardware limits with conservative fallbacks.
//!
//! Buffer acquisitions are checked here before any backend call, so an
//! oversized request fails with [`GpuError::LimitExceeded`] instead of a
//! backend validation error halfway through a frame.

use serde::Serialize;
use tessera_core::{BufferKind, GpuError, GpuResult};

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Limits {
    pub max_texture_size: u32,
    pub max_vertex_buffer_size: u64,
    pub max_index_buffer_size: u64,
    pub max_uniform_buffer_size: u64,
    pub max_vertex_attributes: u32,
    pub max_vertex_buffers: u32,
    pub max_uniform_buffer_bindings: u32,
}

impl Limits {
    pub fn conservative() -> Self {
        Self {
            max_texture_size: 2048,
            max_vertex_buffer_size: 16 * MIB,
            max_index_buffer_size: 8 * MIB,
            max_uniform_buffer_size: 64 * 1024,
            max_vertex_attributes: 16,
            max_vertex_buffers: 8,
            max_uniform_buffer_bindings: 8,
        }
    }

    /// Map `wgpu` device limits. wgpu has one `max_buffer_size` for every
    /// buffer kind; uniform bindings have their own cap.
    pub fn from_wgpu(limits: &wgpu::Limits) -> Self {
        Self {
            max_texture_size: limits.max_texture_dimension_2d,
            max_vertex_buffer_size: limits.max_buffer_size,
            max_index_buffer_size: limits.max_buffer_size,
            max_uniform_buffer_size: u64::from(limits.max_uniform_buffer_binding_size),
            max_vertex_attributes: limits.max_vertex_attributes,
            max_vertex_buffers: limits.max_vertex_buffers,
            max_uniform_buffer_bindings: limits.max_uniform_buffers_per_shader_stage,
        }
    }

    pub fn max_buffer_size(&self, kind: BufferKind) -> u64 {
        match kind {
            BufferKind::Vertex => self.max_vertex_buffer_size,
            BufferKind::Index => self.max_index_buffer_size,
            BufferKind::Uniform => self.max_uniform_buffer_size,
        }
    }

    pub fn validate_buffer_size(&self, kind: BufferKind, bytes: u64) -> GpuResult<()> {
        let max = self.max_buffer_size(kind);
        if bytes > max {
            return Err(GpuError::LimitExceeded {
                what: match kind {
                    BufferKind::Vertex => "vertex buffer size",
                    BufferKind::Index => "index buffer size",
                    BufferKind::Uniform => "uniform buffer size",
                },
                requested: bytes,
                max,
            });
        }
        Ok(())
    }

    pub fn validate_texture_size(&self, size: u32) -> GpuResult<()> {
        if size > self.max_texture_size {
            return Err(GpuError::LimitExceeded {
                what: "texture size",
                requested: u64::from(size),
                max: u64::from(self.max_texture_size),
            });
        }
        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::conservative()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conservative_buffer_sizes() {
        let l = Limits::default();
        assert_eq!(l.max_buffer_size(BufferKind::Vertex), 16 * MIB);
        assert_eq!(l.max_buffer_size(BufferKind::Index), 8 * MIB);
        assert_eq!(l.max_buffer_size(BufferKind::Uniform), 64 * 1024);
    }

    #[test]
    fn test_validate_buffer_size() {
        let l = Limits::default();
        assert!(l.validate_buffer_size(BufferKind::Uniform, 64 * 1024).is_ok());
        let err = l.validate_buffer_size(BufferKind::Uniform, 64 * 1024 + 1).unwrap_err();
        assert!(matches!(
            err,
            GpuError::LimitExceeded { what: "uniform buffer size", max: 65536, .. }
        ));
    }

    #[test]
    fn test_validate_texture_size() {
        let l = Limits::default();
        assert!(l.validate_texture_size(2048).is_ok());
        assert!(l.validate_texture_size(4096).is_err());
    }

    #[test]
    fn test_from_wgpu_defaults() {
        let l = Limits::from_wgpu(&wgpu::Limits::downlevel_defaults());
        assert_eq!(l.max_texture_size, 2048);
        assert_eq!(l.max_vertex_buffers, 8);
    }
}
