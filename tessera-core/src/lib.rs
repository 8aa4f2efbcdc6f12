//! # tessera-core
//!
//! Shared data model for the Tessera GPU resource core.
//!
//! ## Architecture
//!
//! ```text
//!  tessera-core   (records, errors, config)   ◀─── this crate
//!       │
//!       ▼
//!  tessera-gpu    (allocator, residency, staging, sync, backends)
//!       │
//!       ▼
//!  tessera-demo   (headless frame driver)
//! ```
//!
//! Everything in here is plain data: the records the resource managers hand
//! around, the error taxonomy, and the configuration structs. No behaviour
//! beyond validation and small helpers lives in this crate.
//!
//! ## Crate modules
//!
//! - [`memory`]: memory blocks, residency state, buffer kinds and stats
//! - [`transfer`]: CPU↔GPU transfer requests
//! - [`sync`]: fences, events, semaphores, barriers
//! - [`geometry`]: geometry and instance records consumed by draws
//! - [`backend`]: the closed set of backend kinds and the fallback chain
//! - [`config`]: runtime configuration
//! - [`error`]: error types shared by every layer

pub mod backend;
pub mod config;
pub mod error;
pub mod geometry;
pub mod memory;
pub mod sync;
pub mod transfer;

// Re-exports for convenience
pub use backend::BackendKind;
pub use config::{AllocatorConfig, GpuConfig, ResidencyConfig, StagingConfig};
pub use error::{BackendError, ConfigError, GpuError, GpuResult, ProbeError};
pub use geometry::{Geometry, InstanceTransform};
pub use memory::{BlockId, BufferKind, BufferStats, BufferUsage, MemoryBlock, ResidencyState};
pub use sync::{BarrierType, CommandBufferRef, SyncId, SyncKind, SyncPoint};
pub use transfer::{TransferCallback, TransferData, TransferDirection, TransferId, TransferRequest};
