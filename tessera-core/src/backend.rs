//! The closed set of graphics backends and their fallback order.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Backends the resource core knows how to bring up.
///
/// Native kinds map onto a single `wgpu` backend bit; `Software` is the
/// CPU path and is always available.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Dx12,
    Metal,
    Vulkan,
    Gl,
    Software,
}

impl BackendKind {
    pub fn is_native(self) -> bool {
        !matches!(self, BackendKind::Software)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Dx12 => "dx12",
            BackendKind::Metal => "metal",
            BackendKind::Vulkan => "vulkan",
            BackendKind::Gl => "gl",
            BackendKind::Software => "software",
        }
    }

    /// The native backend this platform prefers.
    pub fn platform_preferred() -> BackendKind {
        if cfg!(target_os = "windows") {
            BackendKind::Dx12
        } else if cfg!(any(target_os = "macos", target_os = "ios")) {
            BackendKind::Metal
        } else {
            BackendKind::Vulkan
        }
    }

    /// Ordered fallback chain: preferred native → GL → software.
    pub fn platform_chain() -> Vec<BackendKind> {
        vec![
            BackendKind::platform_preferred(),
            BackendKind::Gl,
            BackendKind::Software,
        ]
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
