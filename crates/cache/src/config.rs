//! Cache configuration: memory and disk budgets, cache location and tiling.
//!
//! Configuration can be loaded from a file, environment variables, or created
//! programmatically.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::geometry::DEFAULT_TILE_SIZE;

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// Configuration for the raster cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Budget for resident tile buffers in bytes
    pub memory_budget: u64,
    /// Budget for cache files on disk in bytes
    pub disk_budget: u64,
    /// Directory the cache files are created in
    pub cache_dir: PathBuf,
    /// Fraction of the memory budget eviction aims to get below
    pub target_utilization: f64,
    /// Target tile edge length in pixels
    pub tile_size: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget: 512 * MB,
            disk_budget: 20 * GB,
            cache_dir: Self::default_cache_dir(),
            target_utilization: 0.5,
            tile_size: DEFAULT_TILE_SIZE,
        }
    }
}

impl CacheConfig {
    /// Sets the memory budget in bytes.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    /// Sets the disk budget in bytes.
    pub fn with_disk_budget(mut self, bytes: u64) -> Self {
        self.disk_budget = bytes;
        self
    }

    pub fn with_cache_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.cache_dir = path.as_ref().to_path_buf();
        self
    }

    /// Sets the target utilization after eviction (0.0 to 1.0).
    pub fn with_target_utilization(mut self, target: f64) -> Self {
        self.target_utilization = target.clamp(0.0, 1.0);
        self
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size.max(1);
        self
    }

    /// Returns the default cache directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/raster-cache
    /// - Linux: ~/.cache/raster-cache
    /// - Windows: %LOCALAPPDATA%\raster-cache
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("raster-cache")
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `RASTER_CACHE_MEMSIZE`: memory budget, e.g. `512m` (default: 512 MiB)
    /// - `RASTER_CACHE_DISKSIZE`: disk budget, e.g. `20g` (default: 20 GiB)
    /// - `RASTER_CACHE_DIR`: cache directory
    /// - `RASTER_CACHE_TILE_SIZE`: target tile edge in pixels (default: 500)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("RASTER_CACHE_MEMSIZE") {
            config.memory_budget = parse_byte_size(&val)
                .ok_or_else(|| ConfigError::InvalidValue("RASTER_CACHE_MEMSIZE".to_string()))?;
        }

        if let Ok(val) = std::env::var("RASTER_CACHE_DISKSIZE") {
            config.disk_budget = parse_byte_size(&val)
                .ok_or_else(|| ConfigError::InvalidValue("RASTER_CACHE_DISKSIZE".to_string()))?;
        }

        if let Ok(val) = std::env::var("RASTER_CACHE_DIR") {
            config.cache_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("RASTER_CACHE_TILE_SIZE") {
            config.tile_size = parse_tile_size(&val)
                .ok_or_else(|| ConfigError::InvalidValue("RASTER_CACHE_TILE_SIZE".to_string()))?;
        }

        Ok(config)
    }

    /// Loads configuration from a `key = value` file.
    ///
    /// Expected file format:
    /// ```toml
    /// memory_size = 512m
    /// disk_size = 20g
    /// cache_dir = "/path/to/cache"
    /// target_utilization = 0.5
    /// tile_size = 500
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or a value is invalid.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            let invalid = || ConfigError::InvalidValue(key.to_string());

            match key {
                "memory_size" => config.memory_budget = parse_byte_size(value).ok_or_else(invalid)?,
                "disk_size" => config.disk_budget = parse_byte_size(value).ok_or_else(invalid)?,
                "cache_dir" => config.cache_dir = PathBuf::from(value),
                "target_utilization" => {
                    let target: f64 = value.parse().map_err(|_| invalid())?;
                    if !(0.0..=1.0).contains(&target) {
                        return Err(invalid());
                    }
                    config.target_utilization = target;
                }
                "tile_size" => config.tile_size = parse_tile_size(value).ok_or_else(invalid)?,
                _ => {} // unknown keys are ignored
            }
        }

        Ok(config)
    }

    /// Saves configuration to a `key = value` file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_file_contents())?;
        Ok(())
    }

    fn to_file_contents(&self) -> String {
        format!(
            "# Raster cache configuration\n\
             memory_size = {}\n\
             disk_size = {}\n\
             cache_dir = \"{}\"\n\
             target_utilization = {}\n\
             tile_size = {}\n",
            self.memory_budget,
            self.disk_budget,
            self.cache_dir.display(),
            self.target_utilization,
            self.tile_size
        )
    }

    /// Memory budget clamped to the address space.
    pub fn memory_budget_bytes(&self) -> usize {
        usize::try_from(self.memory_budget).unwrap_or(usize::MAX)
    }

    /// Disk budget clamped to the address space.
    pub fn disk_budget_bytes(&self) -> usize {
        usize::try_from(self.disk_budget).unwrap_or(usize::MAX)
    }
}

/// Parses a byte size with an optional `k`, `m`, `g` or `t` suffix (binary
/// multiples, case insensitive, an optional trailing `b` is accepted).
pub fn parse_byte_size(value: &str) -> Option<u64> {
    let value = value.trim().to_ascii_lowercase();
    let value = value.strip_suffix('b').unwrap_or(value.as_str());
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], MB),
        'g' => (&value[..value.len() - 1], GB),
        't' => (&value[..value.len() - 1], 1024 * GB),
        _ => (value, 1),
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}

fn parse_tile_size(value: &str) -> Option<u32> {
    value.trim().parse::<u32>().ok().filter(|size| *size > 0)
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),
    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
