//! Device layer: the manager façade plus capability and limit queries.

pub mod capabilities;
pub mod limits;
pub mod manager;

pub use capabilities::Capabilities;
pub use limits::Limits;
pub use manager::{DeviceManager, DeviceStats, FrameReport, RenderPath, RenderStats};
