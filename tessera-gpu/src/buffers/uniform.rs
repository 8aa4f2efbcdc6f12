//! Uniform buffers with std140-style packing.
//!
//! Every named value is packed into whole `vec4` rows in declaration order:
//!
//! ```text
//!  Scalar  → [x, 0, 0, 0]
//!  Vec2    → [x, y, 0, 0]
//!  Vec3    → [x, y, z, 0]
//!  Vec4    → [x, y, z, w]
//!  Mat3    → 3 rows, each padded to vec4
//!  Mat4    → 4 rows
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tessera_core::{BufferKind, BufferUsage, GpuError, GpuResult};

use super::base::GpuBuffer;
use crate::backend::{BindPoint, GpuBackend};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UniformValue {
    Scalar(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    /// Row-major.
    Mat3([f32; 9]),
    /// Row-major.
    Mat4([f32; 16]),
}

impl UniformValue {
    /// Number of `vec4` rows this value occupies.
    pub fn rows(&self) -> usize {
        match self {
            UniformValue::Scalar(_) | UniformValue::Vec2(_) | UniformValue::Vec3(_) | UniformValue::Vec4(_) => 1,
            UniformValue::Mat3(_) => 3,
            UniformValue::Mat4(_) => 4,
        }
    }

    fn pack_into(&self, out: &mut Vec<f32>) {
        match self {
            UniformValue::Scalar(x) => out.extend_from_slice(&[*x, 0.0, 0.0, 0.0]),
            UniformValue::Vec2([x, y]) => out.extend_from_slice(&[*x, *y, 0.0, 0.0]),
            UniformValue::Vec3([x, y, z]) => out.extend_from_slice(&[*x, *y, *z, 0.0]),
            UniformValue::Vec4(v) => out.extend_from_slice(v),
            UniformValue::Mat3(m) => {
                for row in m.chunks_exact(3) {
                    out.extend_from_slice(row);
                    out.push(0.0);
                }
            }
            UniformValue::Mat4(m) => out.extend_from_slice(m),
        }
    }

    fn same_shape(&self, other: &UniformValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Ordered `(name, value)` pairs describing a uniform block.
pub type UniformLayout = [(String, UniformValue)];

pub fn pack_uniforms(values: &UniformLayout) -> Vec<f32> {
    let rows: usize = values.iter().map(|(_, v)| v.rows()).sum();
    let mut packed = Vec::with_capacity(rows * 4);
    for (_, value) in values {
        value.pack_into(&mut packed);
    }
    packed
}

#[derive(Debug)]
pub struct UniformBuffer {
    inner: GpuBuffer<f32>,
    layout: Vec<(String, UniformValue)>,
    slot: u32,
}

impl UniformBuffer {
    pub fn new(backend: Arc<dyn GpuBackend>, values: &UniformLayout, usage: BufferUsage) -> GpuResult<Self> {
        Ok(Self {
            inner: GpuBuffer::new(BufferKind::Uniform, backend, pack_uniforms(values), usage)?,
            layout: values.to_vec(),
            slot: 0,
        })
    }

    pub fn layout(&self) -> &UniformLayout {
        &self.layout
    }

    pub fn get(&self, name: &str) -> Option<UniformValue> {
        self.layout.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn set_slot(&mut self, slot: u32) {
        self.slot = slot;
    }

    /// Bind at this buffer's slot.
    pub fn bind_slot(&mut self) -> GpuResult<()> {
        let slot = self.slot;
        self.inner.bind(BindPoint::Uniform(slot))
    }

    /// Replace one named value in place. The name must exist and the value
    /// must keep its shape, so no other row moves.
    pub fn update_uniform(&mut self, name: &str, value: UniformValue) -> GpuResult<()> {
        let mut row = 0;
        let mut found = None;
        for (i, (n, v)) in self.layout.iter().enumerate() {
            if n == name {
                found = Some((i, *v));
                break;
            }
            row += v.rows();
        }
        let (index, current) =
            found.ok_or_else(|| GpuError::InvalidBufferData(format!("uniform '{name}' not found in buffer layout")))?;
        if !current.same_shape(&value) {
            return Err(GpuError::InvalidBufferData(format!(
                "uniform '{name}' is {current:?}, cannot assign {value:?}"
            )));
        }
        let mut packed = Vec::with_capacity(value.rows() * 4);
        value.pack_into(&mut packed);
        self.inner.update_sub_data(row * 4, &packed)?;
        self.layout[index].1 = value;
        Ok(())
    }

    /// Replace the whole layout, repacking and resizing as needed.
    pub fn set_layout(&mut self, values: &UniformLayout) -> GpuResult<()> {
        self.inner.update_data(&pack_uniforms(values))?;
        self.layout = values.to_vec();
        Ok(())
    }
}

impl Deref for UniformBuffer {
    type Target = GpuBuffer<f32>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for UniformBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

// ===================================================================
// Tests
// ===================================================================
