//! Runtime configuration for the resource core.
//!
//! Every struct is `serde`-deserialisable with `#[serde(default)]`, so a
//! JSON document only has to name the fields it overrides:
//!
//! ```json
//! { "backends": ["vulkan", "software"], "residency": { "max_memory_bytes": 268435456 } }
//! ```

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::error::ConfigError;

/// Address the allocator hands out first and compacts back to.
pub const DEFAULT_BASE_ADDRESS: u64 = 0x1000;
pub const DEFAULT_MAX_POOL_SIZE: usize = 1000;
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_STAGING_BUFFER_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub base_address: u64,
    /// Idle buffers kept per usage free list before extras are destroyed.
    pub max_pool_size: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            base_address: DEFAULT_BASE_ADDRESS,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidencyConfig {
    pub max_memory_bytes: u64,
    /// Fraction of the budget at which memory pressure is reported.
    pub eviction_threshold: f64,
    /// Fraction of the budget that default eviction never goes below.
    pub min_resident_threshold: f64,
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            eviction_threshold: 0.9,
            min_resident_threshold: 0.7,
        }
    }
}

impl ResidencyConfig {
    pub fn pressure_bytes(&self) -> u64 {
        (self.max_memory_bytes as f64 * self.eviction_threshold) as u64
    }

    pub fn floor_bytes(&self) -> u64 {
        (self.max_memory_bytes as f64 * self.min_resident_threshold) as u64
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Size of each scratch buffer; also the largest transfer accepted.
    pub staging_buffer_size: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            staging_buffer_size: DEFAULT_STAGING_BUFFER_SIZE,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Backends to try, in order. Software is appended when missing.
    pub backends: Vec<BackendKind>,
    pub allocator: AllocatorConfig,
    pub residency: ResidencyConfig,
    pub staging: StagingConfig,
    /// Edge length of the native backend's offscreen target.
    pub render_target_size: u32,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            backends: BackendKind::platform_chain(),
            allocator: AllocatorConfig::default(),
            residency: ResidencyConfig::default(),
            staging: StagingConfig::default(),
            render_target_size: 256,
        }
    }
}

impl GpuConfig {
    /// Software backend only, small budgets.
    pub fn for_testing() -> Self {
        Self {
            backends: vec![BackendKind::Software],
            allocator: AllocatorConfig {
                base_address: DEFAULT_BASE_ADDRESS,
                max_pool_size: 8,
            },
            residency: ResidencyConfig {
                max_memory_bytes: 1024 * 1024,
                ..ResidencyConfig::default()
            },
            staging: StagingConfig {
                staging_buffer_size: 64 * 1024,
            },
            render_target_size: 64,
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: GpuConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// The backend chain with software guaranteed to be last.
    pub fn backend_chain(&self) -> Vec<BackendKind> {
        let mut chain: Vec<BackendKind> = Vec::with_capacity(self.backends.len() + 1);
        for kind in &self.backends {
            if !chain.contains(kind) && *kind != BackendKind::Software {
                chain.push(*kind);
            }
        }
        chain.push(BackendKind::Software);
        chain
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.residency;
        if r.max_memory_bytes == 0 {
            return Err(ConfigError::Invalid("residency.max_memory_bytes must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&r.eviction_threshold) || !(0.0..=1.0).contains(&r.min_resident_threshold) {
            return Err(ConfigError::Invalid("residency thresholds must lie in [0, 1]".into()));
        }
        if r.min_resident_threshold > r.eviction_threshold {
            return Err(ConfigError::Invalid(format!(
                "min_resident_threshold {} exceeds eviction_threshold {}",
                r.min_resident_threshold, r.eviction_threshold
            )));
        }
        if self.staging.staging_buffer_size == 0 {
            return Err(ConfigError::Invalid("staging.staging_buffer_size must be > 0".into()));
        }
        if self.render_target_size == 0 {
            return Err(ConfigError::Invalid("render_target_size must be > 0".into()));
        }
        Ok(())
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = GpuConfig::default();
        assert_eq!(c.allocator.base_address, 0x1000);
        assert_eq!(c.allocator.max_pool_size, 1000);
        assert_eq!(c.residency.max_memory_bytes, 1 << 30);
        assert_eq!(c.staging.staging_buffer_size, 64 << 20);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial_override() {
        let c = GpuConfig::from_json(
            r#"{ "backends": ["gl"], "residency": { "max_memory_bytes": 1000 } }"#,
        )
        .unwrap();
        assert_eq!(c.backends, vec![BackendKind::Gl]);
        assert_eq!(c.residency.max_memory_bytes, 1000);
        assert_eq!(c.residency.eviction_threshold, 0.9);
        assert_eq!(c.backend_chain(), vec![BackendKind::Gl, BackendKind::Software]);
    }

    #[test]
    fn test_from_json_rejects_inverted_thresholds() {
        let err = GpuConfig::from_json(
            r#"{ "residency": { "eviction_threshold": 0.5, "min_resident_threshold": 0.8 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_from_json_parse_error() {
        assert!(matches!(GpuConfig::from_json("{ nope"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_threshold_bytes() {
        let r = ResidencyConfig {
            max_memory_bytes: 1000,
            ..Default::default()
        };
        assert_eq!(r.pressure_bytes(), 900);
        assert_eq!(r.floor_bytes(), 700);
    }

    #[test]
    fn test_for_testing_is_software_only() {
        let c = GpuConfig::for_testing();
        assert_eq!(c.backend_chain(), vec![BackendKind::Software]);
        assert!(c.validate().is_ok());
    }
}
