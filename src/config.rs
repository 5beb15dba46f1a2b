//! Configuration management for snitch-rt.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`SNRT_CORES_PER_CLUSTER`, etc.)
//! 2. Project-local config file (`./snitch-rt.toml`)
//! 3. User config file (`~/.config/snitch-rt/config.toml`)
//! 4. Built-in defaults
//!
//! Only the simulated machine reads this. Firmware builds bake the topology
//! into a `const TopologyConfig`.
//!
//! # Config File Format
//!
//! ```toml
//! # snitch-rt.toml
//! cores_per_cluster = 9
//! clusters_per_quadrant = 4
//! quadrant_count = 1
//!
//! # Abort any wait that makes no progress for this long (0 = wait forever)
//! stall_timeout_ms = 10000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use crate::memory::MIN_CHUNK_SIZE;
use crate::sync::WaitPolicy;
use crate::topology::{TopologyConfig, MAX_CORES_PER_CLUSTER};

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Defaults used when a field is not configured anywhere.
pub mod defaults {
    pub const CORES_PER_CLUSTER: u32 = 9;
    pub const CLUSTERS_PER_QUADRANT: u32 = 4;
    pub const QUADRANT_COUNT: u32 = 1;
    pub const HARTID_BASE: u32 = 1;
    pub const TCDM_BASE: u64 = 0x1000_0000;
    pub const TCDM_SIZE: u64 = 128 * 1024;
    pub const TCDM_STRIDE: u64 = 0x4_0000;
    pub const GLOBAL_BASE: u64 = 0x8000_0000;
    pub const GLOBAL_SIZE: u64 = 16 * 1024 * 1024;
}

/// Rejected configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be at least {min}, got {value}")]
    TooSmall { field: &'static str, value: u64, min: u64 },

    #[error("{field} must be at most {max}, got {value}")]
    TooLarge { field: &'static str, value: u64, max: u64 },

    #[error("TCDM window of {size:#x} bytes does not fit the {stride:#x}-byte cluster stride")]
    TcdmOverlap { size: u64, stride: u64 },

    #[error("TCDM windows [{tcdm_start:#x}, {tcdm_end:#x}) overlap global memory at {global_base:#x}")]
    GlobalOverlap { tcdm_start: u64, tcdm_end: u64, global_base: u64 },

    #[error("{field} = {value:#x} is not a multiple of {align}")]
    Misaligned { field: &'static str, value: u64, align: u64 },

    #[error("failed to read {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

/// snitch-rt configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Cores per cluster, data mover included.
    pub cores_per_cluster: Option<u32>,

    /// Clusters per quadrant.
    pub clusters_per_quadrant: Option<u32>,

    /// Number of quadrants.
    pub quadrant_count: Option<u32>,

    /// Hart id of device core 0. Hart 0 is the host.
    pub hartid_base: Option<u32>,

    /// Physical base of cluster 0's TCDM.
    pub tcdm_base: Option<u64>,

    /// Bytes of TCDM per cluster.
    pub tcdm_size: Option<u64>,

    /// Distance between consecutive clusters' TCDM windows.
    pub tcdm_stride: Option<u64>,

    /// Physical base of global (L3) memory.
    pub global_base: Option<u64>,

    /// Bytes of global memory.
    pub global_size: Option<u64>,

    /// Stall bound for every blocking wait, in milliseconds. 0 disables it.
    pub stall_timeout_ms: Option<u64>,
}

/// Physical memory layout of the simulated machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub tcdm_base: u64,
    pub tcdm_size: u64,
    pub tcdm_stride: u64,
    pub global_base: u64,
    pub global_size: u64,
}

impl MemoryLayout {
    /// Base address of a cluster's TCDM window.
    pub fn tcdm_base_of(&self, cluster: u32) -> u64 {
        self.tcdm_base + cluster as u64 * self.tcdm_stride
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            tcdm_base: defaults::TCDM_BASE,
            tcdm_size: defaults::TCDM_SIZE,
            tcdm_stride: defaults::TCDM_STRIDE,
            global_base: defaults::GLOBAL_BASE,
            global_size: defaults::GLOBAL_SIZE,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `snitch-rt.toml`
    /// 3. User config `~/.config/snitch-rt/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Read a config file, reporting failures instead of skipping the file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn cores_per_cluster(&self) -> u32 {
        self.cores_per_cluster.unwrap_or(defaults::CORES_PER_CLUSTER)
    }

    pub fn clusters_per_quadrant(&self) -> u32 {
        self.clusters_per_quadrant
            .unwrap_or(defaults::CLUSTERS_PER_QUADRANT)
    }

    pub fn quadrant_count(&self) -> u32 {
        self.quadrant_count.unwrap_or(defaults::QUADRANT_COUNT)
    }

    pub fn hartid_base(&self) -> u32 {
        self.hartid_base.unwrap_or(defaults::HARTID_BASE)
    }

    /// Memory layout, with defaults for unset fields.
    pub fn layout(&self) -> MemoryLayout {
        let d = MemoryLayout::default();
        MemoryLayout {
            tcdm_base: self.tcdm_base.unwrap_or(d.tcdm_base),
            tcdm_size: self.tcdm_size.unwrap_or(d.tcdm_size),
            tcdm_stride: self.tcdm_stride.unwrap_or(d.tcdm_stride),
            global_base: self.global_base.unwrap_or(d.global_base),
            global_size: self.global_size.unwrap_or(d.global_size),
        }
    }

    /// Wait policy derived from `stall_timeout_ms`.
    pub fn wait_policy(&self) -> WaitPolicy {
        match self.stall_timeout_ms {
            Some(ms) if ms > 0 => WaitPolicy::bounded(Duration::from_millis(ms)),
            _ => WaitPolicy::unbounded(),
        }
    }

    /// Check that the configured machine can be built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cores = self.cores_per_cluster() as u64;
        if cores < 2 {
            return Err(ConfigError::TooSmall { field: "cores_per_cluster", value: cores, min: 2 });
        }
        if cores > MAX_CORES_PER_CLUSTER as u64 {
            return Err(ConfigError::TooLarge {
                field: "cores_per_cluster",
                value: cores,
                max: MAX_CORES_PER_CLUSTER as u64,
            });
        }
        if self.clusters_per_quadrant() == 0 {
            return Err(ConfigError::TooSmall { field: "clusters_per_quadrant", value: 0, min: 1 });
        }
        if self.quadrant_count() == 0 {
            return Err(ConfigError::TooSmall { field: "quadrant_count", value: 0, min: 1 });
        }

        let layout = self.layout();
        if layout.tcdm_size == 0 {
            return Err(ConfigError::TooSmall { field: "tcdm_size", value: 0, min: 1 });
        }
        if layout.global_size == 0 {
            return Err(ConfigError::TooSmall { field: "global_size", value: 0, min: 1 });
        }
        if layout.tcdm_size > layout.tcdm_stride {
            return Err(ConfigError::TcdmOverlap {
                size: layout.tcdm_size,
                stride: layout.tcdm_stride,
            });
        }

        for (field, value) in [
            ("tcdm_base", layout.tcdm_base),
            ("tcdm_stride", layout.tcdm_stride),
            ("global_base", layout.global_base),
        ] {
            if value % MIN_CHUNK_SIZE != 0 {
                return Err(ConfigError::Misaligned { field, value, align: MIN_CHUNK_SIZE });
            }
        }

        // Hart ids are 32-bit
        let clusters = self.clusters_per_quadrant() as u64 * self.quadrant_count() as u64;
        let harts = clusters * cores + self.hartid_base() as u64;
        if harts > u32::MAX as u64 {
            return Err(ConfigError::TooLarge { field: "hart count", value: harts, max: u32::MAX as u64 });
        }
        let tcdm_start = layout.tcdm_base;
        let tcdm_end = (clusters - 1)
            .checked_mul(layout.tcdm_stride)
            .and_then(|span| span.checked_add(layout.tcdm_size))
            .and_then(|span| span.checked_add(layout.tcdm_base))
            .ok_or(ConfigError::TooLarge {
                field: "tcdm_stride",
                value: layout.tcdm_stride,
                max: u64::MAX.saturating_sub(layout.tcdm_base).saturating_sub(layout.tcdm_size)
                    / (clusters - 1).max(1),
            })?;
        let global_end = layout
            .global_base
            .checked_add(layout.global_size)
            .ok_or(ConfigError::TooLarge {
                field: "global_size",
                value: layout.global_size,
                max: u64::MAX - layout.global_base,
            })?;
        if layout.global_base < tcdm_end && tcdm_start < global_end {
            return Err(ConfigError::GlobalOverlap {
                tcdm_start,
                tcdm_end,
                global_base: layout.global_base,
            });
        }
        Ok(())
    }

    /// Validated topology.
    pub fn topology(&self) -> Result<TopologyConfig, ConfigError> {
        self.validate()?;
        Ok(TopologyConfig::new(
            self.cores_per_cluster(),
            self.clusters_per_quadrant(),
            self.quadrant_count(),
            self.hartid_base(),
        ))
    }

    /// Load user configuration from ~/.config/snitch-rt/config.toml
    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./snitch-rt.toml
    fn load_local_config() -> Option<Self> {
        let local_path = Path::new("snitch-rt.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("snitch-rt.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load an optional config file; a missing file is silently skipped.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match Self::from_file(path) {
            Ok(config) => {
                log::info!("Loaded config from {}", path.display());
                Some(config)
            }
            Err(e) => {
                log::warn!("Ignoring config file: {}", e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            cores_per_cluster,
            clusters_per_quadrant,
            quadrant_count,
            hartid_base,
            tcdm_base,
            tcdm_size,
            tcdm_stride,
            global_base,
            global_size,
            stall_timeout_ms
        );
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u32("SNRT_CORES_PER_CLUSTER") {
            self.cores_per_cluster = Some(v);
        }
        if let Some(v) = env_u32("SNRT_CLUSTERS_PER_QUADRANT") {
            self.clusters_per_quadrant = Some(v);
        }
        if let Some(v) = env_u32("SNRT_QUADRANT_COUNT") {
            self.quadrant_count = Some(v);
        }
        if let Some(v) = env_number("SNRT_STALL_TIMEOUT_MS") {
            self.stall_timeout_ms = Some(v);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("snitch-rt").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# snitch-rt configuration
# Place this file at ~/.config/snitch-rt/config.toml or ./snitch-rt.toml

# Machine shape. The last core of every cluster is its data mover.
cores_per_cluster = 9
clusters_per_quadrant = 4
quadrant_count = 1

# Hart id of device core 0 (hart 0 is the host)
hartid_base = 1

# Cluster TCDM (L1) windows
tcdm_base = 0x10000000
tcdm_size = 0x20000
tcdm_stride = 0x40000

# Global (L3) memory
global_base = 0x80000000
global_size = 0x1000000

# Abort any wait that makes no progress for this long (0 = wait forever)
stall_timeout_ms = 0
"#
        .to_string()
    }
}

/// Parse a numeric environment variable, warning on garbage.
fn env_number(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) => {
            log::info!("Using {} from environment: {}", name, v);
            Some(v)
        }
        Err(e) => {
            log::warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}

fn env_u32(name: &str) -> Option<u32> {
    narrow_u32(name, env_number(name)?)
}

fn narrow_u32(name: &str, value: u64) -> Option<u32> {
    match u32::try_from(value) {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring {}={}: does not fit in 32 bits", name, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.cores_per_cluster(), 9);
        assert_eq!(config.clusters_per_quadrant(), 4);
        assert_eq!(config.quadrant_count(), 1);
        assert_eq!(config.layout(), MemoryLayout::default());
        assert_eq!(config.wait_policy(), WaitPolicy::unbounded());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config {
            cores_per_cluster: Some(5),
            quadrant_count: Some(2),
            ..Default::default()
        };

        let overlay = Config {
            quadrant_count: Some(3),
            stall_timeout_ms: Some(250),
            ..Default::default()
        };

        base.merge(overlay);

        // Unset in overlay: unchanged
        assert_eq!(base.cores_per_cluster, Some(5));
        assert_eq!(base.quadrant_count, Some(3));
        assert_eq!(base.stall_timeout_ms, Some(250));
        assert_eq!(base.wait_policy(), WaitPolicy::bounded(Duration::from_millis(250)));
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = Config::sample_config();
        let config: Config = toml::from_str(&sample).expect("Sample config should parse");
        assert_eq!(config.cores_per_cluster, Some(9));
        assert_eq!(config.layout(), MemoryLayout::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_topology_from_config() {
        let config = Config {
            cores_per_cluster: Some(4),
            clusters_per_quadrant: Some(2),
            quadrant_count: Some(3),
            ..Default::default()
        };
        let topo = config.topology().unwrap();
        assert_eq!(topo.cluster_count(), 6);
        assert_eq!(topo.core_count(), 24);
        assert_eq!(topo.hartid_base, 1);
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let config = Config { cores_per_cluster: Some(1), ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::TooSmall { field: "cores_per_cluster", .. })));

        let config = Config { cores_per_cluster: Some(33), ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::TooLarge { .. })));

        let config = Config { quadrant_count: Some(0), ..Default::default() };
        assert!(config.topology().is_err());
    }

    #[test]
    fn test_validate_rejects_overlapping_windows() {
        let config = Config { tcdm_size: Some(0x8_0000), ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::TcdmOverlap { .. })));

        let config = Config { global_base: Some(0x1002_0000), ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::GlobalOverlap { .. })));
    }

    #[test]
    fn test_validate_rejects_misaligned_bases() {
        let config = Config { global_base: Some(0x8000_0004), ..Default::default() };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Misaligned { field: "global_base", value: 0x8000_0004, align: 8 })
        );
        let config = Config { tcdm_stride: Some(0x4_0001), ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Misaligned { field: "tcdm_stride", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_overflowing_layout() {
        let config = Config {
            clusters_per_quadrant: Some(u32::MAX),
            quadrant_count: Some(u32::MAX),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::TooLarge { .. })));

        let config = Config {
            clusters_per_quadrant: Some(4),
            tcdm_stride: Some(0x8000_0000_0000_0000),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooLarge { field: "tcdm_stride", .. })
        ));

        let config = Config { global_size: Some(u64::MAX), ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooLarge { field: "global_size", .. })
        ));
    }

    #[test]
    fn test_oversized_env_numbers_are_ignored() {
        assert_eq!(narrow_u32("SNRT_QUADRANT_COUNT", 4), Some(4));
        assert_eq!(narrow_u32("SNRT_QUADRANT_COUNT", 1 << 32), None);
        assert_eq!(narrow_u32("SNRT_QUADRANT_COUNT", u64::MAX), None);
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let err = Config::from_file(Path::new("/nonexistent/snitch-rt.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }
}
