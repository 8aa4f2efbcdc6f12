//! Typed buffer wrappers.
//!
//! - [`base::GpuBuffer`]: CPU copy + exclusively owned backend handle
//! - [`VertexBuffer`]: interleaved `f32` with a stride
//! - [`IndexBuffer`]: `u32` triangle-list indices
//! - [`UniformBuffer`]: named values packed into `vec4` rows

pub mod base;
pub mod index;
pub mod uniform;
pub mod vertex;

pub use base::{BufferElement, GpuBuffer};
pub use index::IndexBuffer;
pub use uniform::{pack_uniforms, UniformBuffer, UniformLayout, UniformValue};
pub use vertex::VertexBuffer;
