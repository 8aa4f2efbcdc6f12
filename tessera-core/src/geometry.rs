//! Geometry records consumed by draw calls.
//!
//! `Geometry` is the CPU-side description the device manager turns into
//! pooled vertex/index buffers. `InstanceTransform` is the per-instance
//! record for instanced draws and derives `bytemuck::Pod` for zero-copy
//! upload.

use bytemuck::{Pod, Zeroable};

use crate::error::GpuError;

/// Floats per vertex when the stride cannot be derived (x, y, z, u, v).
pub const DEFAULT_STRIDE_FLOATS: usize = 5;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Geometry {
    /// Interleaved vertex attributes.
    pub vertices: Vec<f32>,
    pub indices: Vec<u32>,
    pub vertex_count: usize,
    pub index_count: usize,
}

impl Geometry {
    /// Build geometry with an explicit floats-per-vertex stride.
    pub fn new(vertices: Vec<f32>, indices: Vec<u32>, stride_floats: usize) -> Self {
        let stride = stride_floats.max(1);
        let vertex_count = vertices.len() / stride;
        let index_count = indices.len();
        Self {
            vertices,
            indices,
            vertex_count,
            index_count,
        }
    }

    /// Floats per vertex, derived from `vertices.len() / vertex_count`.
    ///
    /// Falls back to [`DEFAULT_STRIDE_FLOATS`] when it cannot be derived.
    pub fn stride_floats(&self) -> usize {
        if self.vertex_count > 0 && self.vertices.len() >= self.vertex_count {
            let stride = self.vertices.len() / self.vertex_count;
            if stride > 0 {
                return stride;
            }
        }
        DEFAULT_STRIDE_FLOATS
    }

    pub fn triangle_count(&self) -> usize {
        self.index_count / 3
    }

    /// Reject geometry whose indices point past the last vertex.
    pub fn validate(&self) -> Result<(), GpuError> {
        if self.index_count > self.indices.len() {
            return Err(GpuError::InvalidGeometry(format!(
                "index_count {} exceeds {} indices",
                self.index_count,
                self.indices.len()
            )));
        }
        if let Some(&bad) = self.indices[..self.index_count]
            .iter()
            .find(|&&i| i as usize >= self.vertex_count)
        {
            return Err(GpuError::InvalidGeometry(format!(
                "index {bad} out of range for {} vertices",
                self.vertex_count
            )));
        }
        Ok(())
    }
}

/// Per-instance transform: 20 bytes, five floats.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceTransform {
    pub x: f32,
    pub y: f32,
    pub scale_x: f32,
    pub scale_y: f32,
    /// Radians, counter-clockwise.
    pub rotation: f32,
}

impl InstanceTransform {
    pub const FLOATS: usize = 5;

    pub fn at(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation: 0.0,
        }
    }

    pub fn with_scale(mut self, sx: f32, sy: f32) -> Self {
        self.scale_x = sx;
        self.scale_y = sy;
        self
    }

    pub fn with_rotation(mut self, radians: f32) -> Self {
        self.rotation = radians;
        self
    }

    /// Flatten a slice of transforms into the float layout draws expect.
    pub fn flatten(instances: &[InstanceTransform]) -> Vec<f32> {
        bytemuck::cast_slice(instances).to_vec()
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Geometry {
        Geometry::new(
            vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            vec![0, 1, 2],
            2,
        )
    }

    #[test]
    fn test_stride_derivation() {
        let g = triangle();
        assert_eq!(g.vertex_count, 3);
        assert_eq!(g.stride_floats(), 2);
        assert_eq!(g.triangle_count(), 1);
    }

    #[test]
    fn test_stride_defaults_when_empty() {
        assert_eq!(Geometry::default().stride_floats(), DEFAULT_STRIDE_FLOATS);
    }

    #[test]
    fn test_validate_rejects_out_of_range_index() {
        let mut g = triangle();
        g.indices[2] = 3;
        assert!(matches!(g.validate(), Err(GpuError::InvalidGeometry(_))));
        assert!(triangle().validate().is_ok());
    }

    #[test]
    fn test_instance_transform_layout() {
        assert_eq!(std::mem::size_of::<InstanceTransform>(), 20);
        let flat = InstanceTransform::flatten(&[
            InstanceTransform::at(1.0, 2.0).with_scale(3.0, 4.0).with_rotation(0.5),
        ]);
        assert_eq!(flat, vec![1.0, 2.0, 3.0, 4.0, 0.5]);
    }
}
