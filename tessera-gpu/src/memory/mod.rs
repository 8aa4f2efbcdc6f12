//! Resource managers.
//!
//! - [`allocator`]: address-space blocks, buffer pools, leak checks
//! - [`residency`]: resident/evicted tracking under a memory budget
//! - [`staging`]: prioritised CPU↔GPU transfer queue
//! - [`sync`]: fences, events, semaphores and barrier batches
//!
//! Each manager owns one `parking_lot::Mutex` and never calls into another
//! manager, so they can be shared freely behind `&` or `Arc`.

pub mod allocator;
pub mod pool;
pub mod residency;
pub mod staging;
pub mod sync;

pub use allocator::{AllocatorStats, GpuWorkGuard, MemoryAllocator};
pub use pool::{LeakReport, PoolBuffer, PoolSizes, PoolStats};
pub use residency::{retention_score, MemoryStats, ResidencyManager};
pub use staging::{StagingManager, TransferStats};
pub use sync::{SyncManager, SyncStats};
