//! Tessera demo: headless frame driver for the GPU resource core.
//!
//! Builds a `DeviceManager` on the best available backend, pushes a few
//! frames of geometry, uniforms, transfers and sync traffic through it,
//! then prints the aggregated statistics as JSON.
//!
//! ```text
//! tessera-demo [config.json] [frames]
//! RUST_LOG=debug tessera-demo
//! ```

use std::error::Error;
use std::time::Duration;

use log::{info, warn};
use tessera_core::geometry::DEFAULT_STRIDE_FLOATS;
use tessera_core::{
    BarrierType, BufferUsage, Geometry, GpuConfig, InstanceTransform, TransferData, TransferRequest,
};
use tessera_gpu::{DeviceManager, UniformValue};

const DEFAULT_FRAMES: u32 = 8;

/// A `cols × rows` grid of unit quads, five floats per vertex.
fn quad_grid(cols: u32, rows: u32) -> Geometry {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    for row in 0..rows {
        for col in 0..cols {
            let (x, y) = (col as f32, row as f32);
            let base = (vertices.len() / DEFAULT_STRIDE_FLOATS) as u32;
            for (dx, dy) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
                vertices.extend_from_slice(&[x + dx, y + dy, 0.0, dx, dy]);
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
    }
    Geometry::new(vertices, indices, DEFAULT_STRIDE_FLOATS)
}

fn load_config(path: Option<&str>) -> Result<GpuConfig, Box<dyn Error>> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            Ok(GpuConfig::from_json(&json)?)
        }
        None => Ok(GpuConfig::default()),
    }
}

fn run_frame(device: &DeviceManager, frame: u32, geometry: &Geometry) -> Result<(), Box<dyn Error>> {
    let path = device.render_geometry(geometry)?;
    log::debug!("frame {}: geometry drawn via {:?}", frame, path);

    let instances: Vec<InstanceTransform> = (0..16)
        .map(|i| {
            InstanceTransform::at(i as f32 * 2.0, frame as f32)
                .with_rotation(i as f32 * 0.1)
                .with_scale(0.5, 0.5)
        })
        .collect();
    device.render_instanced_geometry(geometry, &instances)?;

    let mut uniforms = device.acquire_uniform_buffer(
        &[
            ("time".to_string(), UniformValue::Scalar(frame as f32 / 60.0)),
            ("tint".to_string(), UniformValue::Vec4([1.0, 0.8, 0.6, 1.0])),
        ],
        BufferUsage::Dynamic,
    )?;
    uniforms.update_uniform("time", UniformValue::Scalar(frame as f32 / 30.0))?;
    uniforms.bind_slot()?;
    device.release_uniform_buffer(uniforms)?;

    let payload: Vec<f32> = (0..256).map(|i| (i + frame) as f32).collect();
    device
        .staging()
        .queue_transfer(TransferRequest::upload(TransferData::Floats(payload)).with_priority(1))?;
    device.staging().queue_transfer(
        TransferRequest::download(64, TransferData::Floats(Vec::new())).on_complete(|req| {
            log::trace!("readback {} completed ({} bytes)", req.id, req.data.byte_len());
        }),
    )?;

    device.sync().issue_barrier(BarrierType::Write, None);
    let fence = device.sync().create_fence(None);

    let block = format!("frame-{frame}");
    device.residency().register_memory_block(block.as_str(), 4 * 1024 * 1024, "frame", 0)?;

    let report = device.end_frame()?;
    device.sync().signal_sync_point(fence)?;
    if !device.sync().wait_for_sync_point(fence, Duration::from_millis(100))? {
        warn!("frame {}: fence {} timed out", frame, fence);
    }
    device.sync().destroy_sync_point(fence);

    info!(
        "frame {}: {} transfer(s), {} barrier(s), {} byte(s) evicted",
        frame, report.transfers_completed, report.barriers_flushed, report.bytes_evicted
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = load_config(args.first().map(String::as_str))?;
    let frames = match args.get(1) {
        Some(n) => n.parse()?,
        None => DEFAULT_FRAMES,
    };

    info!("Starting Tessera demo ({} frames)...", frames);
    let device = DeviceManager::new(config)?;
    info!("Backend: {} ({:?})", device.backend_kind(), device.capabilities());

    // Scratch allocations for the compaction pass at the end.
    let scratch: Vec<_> = (0..6)
        .map(|i| device.allocator().allocate(1024 * (i + 1), 256, "scratch"))
        .collect::<Result<_, _>>()?;
    for block in scratch.iter().step_by(2) {
        device.allocator().deallocate(block)?;
    }

    let geometry = quad_grid(8, 8);
    for frame in 0..frames {
        run_frame(&device, frame, &geometry)?;
    }

    let moved = device.defragment()?;
    info!("Defragment moved {} block(s)", moved.len());

    let leaks = device.check_for_leaks();
    if leaks.leaks_detected > 0 {
        warn!("{} leaked buffer(s)", leaks.leaks_detected);
    }

    println!("{}", serde_json::to_string_pretty(&device.stats_snapshot())?);
    device.shutdown();
    Ok(())
}
