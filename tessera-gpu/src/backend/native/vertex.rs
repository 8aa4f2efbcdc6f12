//! Vertex buffer layouts for the native geometry pipelines.
//!
//! Geometry streams are interleaved `f32` with a caller-chosen stride; the
//! shader only reads the leading `(x, y)` pair. Instance streams are packed
//! [`InstanceTransform`] records.

use tessera_core::InstanceTransform;
use wgpu::{BufferAddress, VertexAttribute, VertexBufferLayout, VertexFormat, VertexStepMode};

/// Smallest stride the shader can consume: one `vec2<f32>` position.
pub const MIN_STRIDE_FLOATS: u32 = 2;

// ───────────────────────────────────────────────────────────────────
// Geometry stream
// ───────────────────────────────────────────────────────────────────

/// Layout of the geometry stream for `stride_floats` floats per vertex.
pub fn geometry_layout(stride_floats: u32) -> VertexBufferLayout<'static> {
    static ATTRS: &[VertexAttribute] = &[
        // location(0) = position
        VertexAttribute {
            offset: 0,
            shader_location: 0,
            format: VertexFormat::Float32x2,
        },
    ];
    VertexBufferLayout {
        array_stride: (stride_floats as usize * std::mem::size_of::<f32>()) as BufferAddress,
        step_mode: VertexStepMode::Vertex,
        attributes: ATTRS,
    }
}

// ───────────────────────────────────────────────────────────────────
// Instance stream
// ───────────────────────────────────────────────────────────────────

/// Layout of the per-instance stream, 20 bytes per instance.
pub fn instance_layout() -> VertexBufferLayout<'static> {
    static ATTRS: &[VertexAttribute] = &[
        // location(1) = (x, y, scale_x, scale_y)
        VertexAttribute {
            offset: 0,
            shader_location: 1,
            format: VertexFormat::Float32x4,
        },
        // location(2) = rotation
        VertexAttribute {
            offset: 16,
            shader_location: 2,
            format: VertexFormat::Float32,
        },
    ];
    VertexBufferLayout {
        array_stride: std::mem::size_of::<InstanceTransform>() as BufferAddress,
        step_mode: VertexStepMode::Instance,
        attributes: ATTRS,
    }
}

// ===================================================================
// Tests
// ===================================================================
