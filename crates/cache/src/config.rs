//! Capacity configuration for the four chunk budgets.
//!
//! Limits can be created programmatically, loaded from a TOML file, or
//! overridden from environment variables. Precedence when using [`CapacityConfig::load`]
//! is defaults, then the file, then the environment.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::capacity::{BudgetKind, CapacityLimits};
use crate::error::ConfigError;

const MB: usize = 1024 * 1024;

/// Environment variable overriding the GPU memory size limit (megabytes)
pub const ENV_GPU_MEMORY_MB: &str = "CHUNKSTREAM_GPU_MEMORY_MB";
/// Environment variable overriding the system memory size limit (megabytes)
pub const ENV_SYSTEM_MEMORY_MB: &str = "CHUNKSTREAM_SYSTEM_MEMORY_MB";
/// Environment variable overriding the number of concurrent downloads
pub const ENV_CONCURRENT_DOWNLOADS: &str = "CHUNKSTREAM_CONCURRENT_DOWNLOADS";
/// Environment variable overriding the number of concurrent decode jobs
pub const ENV_CONCURRENT_COMPUTE: &str = "CHUNKSTREAM_CONCURRENT_COMPUTE";

/// Limits for every capacity budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// GPU memory tier (chunks uploaded for rendering)
    pub gpu_memory: CapacityLimits,
    /// System memory tier (decoded chunks held on the host)
    pub system_memory: CapacityLimits,
    /// Concurrent fetches in flight
    pub concurrent_downloads: CapacityLimits,
    /// Concurrent decode jobs
    pub concurrent_compute: CapacityLimits,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            gpu_memory: CapacityLimits::bytes(1_000_000_000),
            system_memory: CapacityLimits::bytes(2_000_000_000),
            concurrent_downloads: CapacityLimits::items(32),
            concurrent_compute: CapacityLimits::items(default_compute_slots()),
        }
    }
}

fn default_compute_slots() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl CapacityConfig {
    /// Configuration with every budget unbounded.
    pub fn unbounded() -> Self {
        Self {
            gpu_memory: CapacityLimits::unbounded(),
            system_memory: CapacityLimits::unbounded(),
            concurrent_downloads: CapacityLimits::unbounded(),
            concurrent_compute: CapacityLimits::unbounded(),
        }
    }

    /// Sets the GPU memory limits.
    pub fn with_gpu_memory(mut self, limits: CapacityLimits) -> Self {
        self.gpu_memory = limits;
        self
    }

    /// Sets the system memory limits.
    pub fn with_system_memory(mut self, limits: CapacityLimits) -> Self {
        self.system_memory = limits;
        self
    }

    /// Sets the maximum number of concurrent downloads.
    pub fn with_concurrent_downloads(mut self, slots: usize) -> Self {
        self.concurrent_downloads = CapacityLimits::items(slots);
        self
    }

    /// Sets the maximum number of concurrent decode jobs.
    pub fn with_concurrent_compute(mut self, slots: usize) -> Self {
        self.concurrent_compute = CapacityLimits::items(slots);
        self
    }

    /// Limits of one budget.
    pub fn limits(&self, kind: BudgetKind) -> CapacityLimits {
        match kind {
            BudgetKind::GpuMemory => self.gpu_memory,
            BudgetKind::SystemMemory => self.system_memory,
            BudgetKind::Downloads => self.concurrent_downloads,
            BudgetKind::Compute => self.concurrent_compute,
        }
    }

    /// Replace the limits of one budget.
    pub fn set_limits(&mut self, kind: BudgetKind, limits: CapacityLimits) {
        match kind {
            BudgetKind::GpuMemory => self.gpu_memory = limits,
            BudgetKind::SystemMemory => self.system_memory = limits,
            BudgetKind::Downloads => self.concurrent_downloads = limits,
            BudgetKind::Compute => self.concurrent_compute = limits,
        }
    }

    /// Rejects limits that could never admit a chunk.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for kind in BudgetKind::ALL {
            self.limits(kind).validate(kind)?;
        }
        Ok(())
    }

    /// Returns the default configuration file path for the current platform.
    ///
    /// - macOS: ~/Library/Application Support/chunkstream/capacity.toml
    /// - Linux: ~/.config/chunkstream/capacity.toml
    /// - Windows: %APPDATA%\chunkstream\capacity.toml
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("chunkstream").join("capacity.toml")
        } else {
            PathBuf::from("chunkstream-capacity.toml")
        }
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// Environment variables:
    /// - `CHUNKSTREAM_GPU_MEMORY_MB`: GPU memory size limit in MB
    /// - `CHUNKSTREAM_SYSTEM_MEMORY_MB`: system memory size limit in MB
    /// - `CHUNKSTREAM_CONCURRENT_DOWNLOADS`: concurrent download slots
    /// - `CHUNKSTREAM_CONCURRENT_COMPUTE`: concurrent decode slots
    ///
    /// # Errors
    /// Returns an error if any variable is not a positive integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overrides limits from environment variables that are set.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(mb) = env_usize(ENV_GPU_MEMORY_MB)? {
            self.gpu_memory.size_limit = Some(mb * MB);
        }
        if let Some(mb) = env_usize(ENV_SYSTEM_MEMORY_MB)? {
            self.system_memory.size_limit = Some(mb * MB);
        }
        if let Some(slots) = env_usize(ENV_CONCURRENT_DOWNLOADS)? {
            self.concurrent_downloads.item_limit = Some(slots);
        }
        if let Some(slots) = env_usize(ENV_CONCURRENT_COMPUTE)? {
            self.concurrent_compute.item_limit = Some(slots);
        }
        Ok(())
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format (every table optional, missing keys unbounded):
    /// ```toml
    /// [gpu_memory]
    /// size_limit = 1000000000
    ///
    /// [concurrent_downloads]
    /// item_limit = 32
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Saves configuration to a TOML file, creating parent directories.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        fs::write(path, self.to_toml()?).map_err(io_err)
    }

    /// Defaults, then `path` if it exists, then the environment; validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                log::info!("loading capacity config from {}", path.display());
                Self::from_file(path)?
            }
            _ => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }
}

fn env_usize(var: &str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|&n| n > 0)
            .map(Some)
            .ok_or(ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ALL_VARS: [&str; 4] = [
        ENV_GPU_MEMORY_MB,
        ENV_SYSTEM_MEMORY_MB,
        ENV_CONCURRENT_DOWNLOADS,
        ENV_CONCURRENT_COMPUTE,
    ];

    #[test]
    fn test_default_config() {
        let config = CapacityConfig::default();
        assert_eq!(config.gpu_memory.size_limit, Some(1_000_000_000));
        assert_eq!(config.system_memory.size_limit, Some(2_000_000_000));
        assert_eq!(config.concurrent_downloads.item_limit, Some(32));
        assert!(config.concurrent_compute.item_limit.unwrap() >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = CapacityConfig::default()
            .with_gpu_memory(CapacityLimits::items(2))
            .with_system_memory(CapacityLimits::new(Some(100), Some(4096)))
            .with_concurrent_downloads(8)
            .with_concurrent_compute(2);

        assert_eq!(config.limits(BudgetKind::GpuMemory), CapacityLimits::items(2));
        assert_eq!(config.limits(BudgetKind::SystemMemory).size_limit, Some(4096));
        assert_eq!(config.limits(BudgetKind::Downloads).item_limit, Some(8));
        assert_eq!(config.limits(BudgetKind::Compute).item_limit, Some(2));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = CapacityConfig::default().with_concurrent_downloads(0);
        assert!(matches!(config.validate(), Err(ConfigError::Capacity(_))));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&ALL_VARS);

        env::set_var(ENV_GPU_MEMORY_MB, "256");
        env::set_var(ENV_SYSTEM_MEMORY_MB, "512");
        env::set_var(ENV_CONCURRENT_DOWNLOADS, "4");
        env::set_var(ENV_CONCURRENT_COMPUTE, "2");

        let config = CapacityConfig::from_env().unwrap();
        assert_eq!(config.gpu_memory.size_limit, Some(256 * MB));
        assert_eq!(config.system_memory.size_limit, Some(512 * MB));
        assert_eq!(config.concurrent_downloads.item_limit, Some(4));
        assert_eq!(config.concurrent_compute.item_limit, Some(2));
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(&ALL_VARS);
        for var in ALL_VARS {
            env::remove_var(var);
        }
        env::set_var(ENV_CONCURRENT_DOWNLOADS, "3");

        let config = CapacityConfig::from_env().unwrap();
        assert_eq!(config.concurrent_downloads.item_limit, Some(3));
        assert_eq!(config.gpu_memory.size_limit, Some(1_000_000_000));
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&ALL_VARS);
        for var in ALL_VARS {
            env::remove_var(var);
        }

        env::set_var(ENV_GPU_MEMORY_MB, "lots");
        assert!(matches!(
            CapacityConfig::from_env(),
            Err(ConfigError::InvalidEnv { .. })
        ));

        env::set_var(ENV_GPU_MEMORY_MB, "0");
        assert!(CapacityConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_load_env_overrides_file() {
        let _guard = EnvGuard::new(&ALL_VARS);
        for var in ALL_VARS {
            env::remove_var(var);
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capacity.toml");
        CapacityConfig::default()
            .with_concurrent_downloads(5)
            .with_concurrent_compute(3)
            .save_to_file(&path)
            .unwrap();

        env::set_var(ENV_CONCURRENT_COMPUTE, "7");
        let config = CapacityConfig::load(Some(&path)).unwrap();
        assert_eq!(config.concurrent_downloads.item_limit, Some(5));
        assert_eq!(config.concurrent_compute.item_limit, Some(7));
    }

    #[test]
    #[serial]
    fn test_load_missing_file_uses_defaults() {
        let _guard = EnvGuard::new(&ALL_VARS);
        for var in ALL_VARS {
            env::remove_var(var);
        }
        let dir = tempfile::tempdir().unwrap();
        let config = CapacityConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, CapacityConfig::default());
    }

    // Helper to save and restore environment variables
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
            # Only the GPU tier is limited
            [gpu_memory]
            item_limit = 2
        "#;

        let config = CapacityConfig::from_toml(toml).unwrap();
        assert_eq!(config.gpu_memory, CapacityLimits::items(2));
        assert_eq!(config.system_memory, CapacityConfig::default().system_memory);
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(matches!(
            CapacityConfig::from_toml("gpu_memory = \"big\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("capacity.toml");

        let config = CapacityConfig::unbounded()
            .with_gpu_memory(CapacityLimits::new(Some(64), Some(512 * MB)))
            .with_concurrent_downloads(16);
        config.save_to_file(&path).unwrap();

        let loaded = CapacityConfig::from_file(&path).unwrap();
        assert_eq!(config, loaded);
    }
}
