//! Feature capabilities reported by a backend.

use serde::Serialize;

/// What the active backend can do.
///
/// [`Capabilities::conservative`] is the answer given when nothing better
/// is known: every optional feature off, small texture limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub instancing: bool,
    pub compute_shaders: bool,
    pub geometry_shaders: bool,
    pub tessellation: bool,
    pub multiple_render_targets: bool,
    pub texture_compression: bool,
    pub anisotropic_filtering: bool,
    pub max_texture_size: u32,
    pub max_vertex_attributes: u32,
    pub max_uniform_buffer_bindings: u32,
}

impl Capabilities {
    pub fn conservative() -> Self {
        Self {
            instancing: false,
            compute_shaders: false,
            geometry_shaders: false,
            tessellation: false,
            multiple_render_targets: false,
            texture_compression: false,
            anisotropic_filtering: false,
            max_texture_size: 2048,
            max_vertex_attributes: 16,
            max_uniform_buffer_bindings: 8,
        }
    }

    /// The CPU path: instancing is emulated, everything shader-side is off.
    pub fn software() -> Self {
        Self {
            instancing: true,
            ..Self::conservative()
        }
    }

    /// Derive capabilities from a `wgpu` adapter.
    pub fn from_adapter(adapter: &wgpu::Adapter) -> Self {
        let features = adapter.features();
        let limits = adapter.limits();
        let downlevel = adapter.get_downlevel_capabilities();

        Self {
            instancing: true,
            compute_shaders: downlevel.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS),
            // Not exposed by wgpu.
            geometry_shaders: false,
            tessellation: false,
            multiple_render_targets: limits.max_color_attachments > 1,
            texture_compression: features.intersects(
                wgpu::Features::TEXTURE_COMPRESSION_BC
                    | wgpu::Features::TEXTURE_COMPRESSION_ETC2
                    | wgpu::Features::TEXTURE_COMPRESSION_ASTC,
            ),
            anisotropic_filtering: downlevel.flags.contains(wgpu::DownlevelFlags::ANISOTROPIC_FILTERING),
            max_texture_size: limits.max_texture_dimension_2d,
            max_vertex_attributes: limits.max_vertex_attributes,
            max_uniform_buffer_bindings: limits.max_uniform_buffers_per_shader_stage,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::conservative()
    }
}
