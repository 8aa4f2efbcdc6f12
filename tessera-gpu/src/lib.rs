//! # tessera-gpu
//!
//! Backend-agnostic GPU resource management, built on `wgpu`.
//!
//! ## Architecture
//!
//! ```text
//!  caller (UI renderer, demo driver)
//!       │
//!       ▼
//!  DeviceManager                     ◀─── explicit context, no global
//!   ├── MemoryAllocator + pools      ◀─── blocks, leases, free lists
//!   ├── ResidencyManager             ◀─── budget, eviction, restore
//!   ├── StagingManager               ◀─── prioritised CPU↔GPU transfers
//!   └── SyncManager                  ◀─── fences, events, barriers
//!       │
//!       ▼
//!  dyn GpuBackend
//!   ├── NativeBackend  (wgpu: dx12 / metal / vulkan / gl)
//!   └── SoftwareBackend (CPU, always available)
//! ```
//!
//! ## Crate modules
//!
//! - [`backend`]: the backend trait, probing, native and software backends
//! - [`buffers`]: typed vertex/index/uniform buffer wrappers
//! - [`memory`]: allocator, pools, residency, staging, sync
//! - [`device`]: the device manager façade, capabilities and limits

pub mod backend;
pub mod buffers;
pub mod device;
pub mod memory;

// Re-exports for convenience
pub use backend::{probe, select_backend, BindPoint, BufferHandle, DrawParams, GpuBackend, SoftwareBackend};
pub use buffers::{IndexBuffer, UniformBuffer, UniformValue, VertexBuffer};
pub use device::{Capabilities, DeviceManager, DeviceStats, FrameReport, Limits, RenderPath, RenderStats};
pub use memory::{
    AllocatorStats, LeakReport, MemoryAllocator, MemoryStats, ResidencyManager, StagingManager,
    SyncManager, SyncStats, TransferStats,
};
pub use tessera_core::{BackendKind, GpuConfig, GpuError, GpuResult};
