//! GPU context: owns `wgpu::Device`, `Queue` and the adapter.
//!
//! Always headless: the resource core renders into an offscreen target and
//! never presents. A context is pinned to the `wgpu::Backends` bits it was
//! created with, which is how one [`BackendKind`] maps onto one context.

use thiserror::Error;
use tessera_core::BackendKind;
use wgpu::{
    Adapter, Backends, Device, DeviceDescriptor, Instance, InstanceDescriptor, Queue,
    RequestAdapterOptions, TextureFormat,
};

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("No suitable GPU adapter found")]
    NoAdapter,
    #[error("Failed to request device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

/// Core GPU state shared by the native backend's subsystems.
pub struct GpuContext {
    pub device: Device,
    pub queue: Queue,
    pub adapter: Adapter,
    /// Format of the offscreen render target.
    pub target_format: TextureFormat,
}

/// `wgpu` backend bits for a native kind, or `None` when the kind cannot
/// exist on this platform.
pub fn backends_for(kind: BackendKind) -> Option<Backends> {
    match kind {
        BackendKind::Dx12 if cfg!(target_os = "windows") => Some(Backends::DX12),
        BackendKind::Metal if cfg!(any(target_os = "macos", target_os = "ios")) => Some(Backends::METAL),
        BackendKind::Vulkan if !cfg!(any(target_os = "macos", target_os = "ios")) => Some(Backends::VULKAN),
        BackendKind::Gl => Some(Backends::GL),
        _ => None,
    }
}

impl GpuContext {
    /// Create a headless context restricted to `backends`.
    ///
    /// Useful for off-screen rendering, tests, and CI pipelines.
    pub async fn new_headless(backends: Backends) -> Result<Self, ContextError> {
        let instance = Instance::new(&InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(ContextError::NoAdapter)?;

        // Ask for what the adapter has; the defaults are too high for GL.
        let (device, queue) = adapter
            .request_device(&DeviceDescriptor {
                label: Some("tessera-headless"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                ..Default::default()
            }, None)
            .await?;

        device.on_uncaptured_error(Box::new(|e| {
            log::error!("Uncaptured wgpu error: {}", e);
        }));

        Ok(Self {
            device,
            queue,
            adapter,
            target_format: TextureFormat::Rgba8Unorm,
        })
    }

    pub fn adapter_name(&self) -> String {
        self.adapter.get_info().name
    }

    /// Run `f` inside a validation error scope.
    ///
    /// Validation failures come back as `Err(message)` instead of reaching
    /// the uncaptured-error handler.
    pub fn scoped<T>(&self, f: impl FnOnce() -> T) -> Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f();
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(e) => Err(e.to_string()),
            None => Ok(out),
        }
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backends_for_gl_everywhere() {
        assert_eq!(backends_for(BackendKind::Gl), Some(Backends::GL));
        assert_eq!(backends_for(BackendKind::Software), None);
    }

    #[test]
    fn test_preferred_kind_is_supported_here() {
        assert!(backends_for(BackendKind::platform_preferred()).is_some());
    }

    #[test]
    fn test_headless_context_captures_validation() {
        let ctx = pollster::block_on(GpuContext::new_headless(Backends::all()));
        // May fail in CI without GPU: that's OK, skip gracefully.
        if let Ok(ctx) = ctx {
            let bad = ctx.scoped(|| {
                ctx.device.create_buffer(&wgpu::BufferDescriptor {
                    label: None,
                    size: 3,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::MAP_WRITE,
                    mapped_at_creation: false,
                })
            });
            assert!(bad.is_err());
        }
    }
}
