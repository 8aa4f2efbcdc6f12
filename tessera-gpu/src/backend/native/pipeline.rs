//! Geometry render pipelines, one per (stride, instanced) pair.
//!
//! Pipelines are built lazily the first time a stride is drawn and cached
//! for the lifetime of the backend.

use rustc_hash::FxHashMap;
use wgpu::{
    BlendState, ColorTargetState, ColorWrites, Device, FragmentState, FrontFace, MultisampleState,
    PipelineCompilationOptions, PipelineLayout, PipelineLayoutDescriptor, PolygonMode, PrimitiveState,
    PrimitiveTopology, RenderPipeline, RenderPipelineDescriptor, ShaderModule, ShaderModuleDescriptor,
    TextureFormat, VertexState,
};

use super::vertex::{geometry_layout, instance_layout};

pub struct GeometryPipelines {
    shader: ShaderModule,
    layout: PipelineLayout,
    format: TextureFormat,
    cache: FxHashMap<(u32, bool), RenderPipeline>,
}

impl GeometryPipelines {
    pub fn new(device: &Device, format: TextureFormat) -> Self {
        // ── Shader ──────────────────────────────────────────────
        let shader = device.create_shader_module(ShaderModuleDescriptor {
            label: Some("geometry_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../../shaders/geometry.wgsl").into()),
        });

        // ── Pipeline layout (no bind groups) ────────────────────
        let layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("geometry_pipeline_layout"),
            bind_group_layouts: &[],
            push_constant_ranges: &[],
        });

        Self {
            shader,
            layout,
            format,
            cache: FxHashMap::default(),
        }
    }

    /// Number of pipelines built so far.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn cached(&self, stride_floats: u32, instanced: bool) -> Option<&RenderPipeline> {
        self.cache.get(&(stride_floats, instanced))
    }

    /// The pipeline for `stride_floats`, building it on first use.
    pub fn get_or_create(&mut self, device: &Device, stride_floats: u32, instanced: bool) -> &RenderPipeline {
        let Self {
            shader,
            layout,
            format,
            cache,
        } = self;
        cache
            .entry((stride_floats, instanced))
            .or_insert_with(|| {
                log::debug!(
                    "Building geometry pipeline (stride {}, instanced {})",
                    stride_floats,
                    instanced
                );
                build(device, shader, layout, *format, stride_floats, instanced)
            })
    }
}

fn build(
    device: &Device,
    shader: &ShaderModule,
    layout: &PipelineLayout,
    format: TextureFormat,
    stride_floats: u32,
    instanced: bool,
) -> RenderPipeline {
    let single = [geometry_layout(stride_floats)];
    let with_instances = [geometry_layout(stride_floats), instance_layout()];
    let (entry_point, buffers): (&str, &[wgpu::VertexBufferLayout<'_>]) = if instanced {
        ("vs_instanced", &with_instances)
    } else {
        ("vs_main", &single)
    };

    device.create_render_pipeline(&RenderPipelineDescriptor {
        label: Some(if instanced { "geometry_instanced_pipeline" } else { "geometry_pipeline" }),
        layout: Some(layout),
        vertex: VertexState {
            module: shader,
            entry_point: Some(entry_point),
            compilation_options: PipelineCompilationOptions::default(),
            buffers,
        },
        fragment: Some(FragmentState {
            module: shader,
            entry_point: Some("fs_main"),
            compilation_options: PipelineCompilationOptions::default(),
            targets: &[Some(ColorTargetState {
                format,
                blend: Some(BlendState::ALPHA_BLENDING),
                write_mask: ColorWrites::ALL,
            })],
        }),
        primitive: PrimitiveState {
            topology: PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: FrontFace::Ccw,
            cull_mode: None, // 2D: no backface culling
            polygon_mode: PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::native::context::GpuContext;

    #[test]
    fn test_pipelines_are_cached_per_stride() {
        let ctx = pollster::block_on(GpuContext::new_headless(wgpu::Backends::all()));
        if let Ok(ctx) = ctx {
            let mut pipelines = GeometryPipelines::new(&ctx.device, ctx.target_format);
            assert!(pipelines.is_empty());
            pipelines.get_or_create(&ctx.device, 5, false);
            pipelines.get_or_create(&ctx.device, 5, false);
            pipelines.get_or_create(&ctx.device, 5, true);
            pipelines.get_or_create(&ctx.device, 2, false);
            assert_eq!(pipelines.len(), 3);
        }
    }
}
