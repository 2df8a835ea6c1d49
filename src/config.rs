use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::util::parse_size_bytes;

/// Archive format produced for each file group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    Tar,
    Pgzip,
    Zstd,
    P7zip,
}

impl CompressionMethod {
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionMethod::Tar => "tar",
            CompressionMethod::Pgzip => "tar.gz",
            CompressionMethod::Zstd => "tar.zst",
            CompressionMethod::P7zip => "7z",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMethod::Tar => "tar",
            CompressionMethod::Pgzip => "pgzip",
            CompressionMethod::Zstd => "zstd",
            CompressionMethod::P7zip => "p7zip",
        }
    }
}

/// Main configuration for the tapeline backup engine.
///
/// Loaded once at startup and passed by reference through component
/// constructors; there is no process-wide mutable settings state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub tape: TapeConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub disk: DiskConfig,
    /// Default retention applied to newly created tasks.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

/// Catalog database and on-disk scratch locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the catalog database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Scratch space for work files (7z staging layouts, list files).
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    /// Root for in-progress (`temp/<set_id>`) and completed
    /// (`final/<set_id>`) archives.
    #[serde(default = "default_compress_dir")]
    pub compress_dir: String,
}

/// Tape mount configuration. The drive is a single mount point; the
/// pipeline only composes paths under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeConfig {
    /// Filesystem path through which the tape volume is exposed,
    /// e.g. `O:\` or `/mnt/ltfs`.
    #[serde(default = "default_drive_path")]
    pub drive_path: String,
    /// Advertised cartridge capacity; 0 means use the filesystem total.
    #[serde(default)]
    pub max_volume_size: u64,
    /// Retries for moving a finished archive onto the tape mount.
    #[serde(default = "default_move_retries")]
    pub move_retries: u32,
}

/// Source tree enumeration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Reserved; only "default" is recognized.
    #[serde(default = "default_scan_method")]
    pub method: String,
    /// Select the bounded-concurrent walker instead of the sequential one.
    #[serde(default)]
    pub use_multithread: bool,
    /// Worker count for the concurrent walker.
    #[serde(default = "default_scan_threads")]
    pub threads: usize,
    /// Batch flush threshold in files.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batch flush threshold in bytes.
    #[serde(default = "default_batch_size_bytes")]
    pub batch_size_bytes: u64,
    /// Scan counter writes totals every this many files.
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,
    /// Scan counter also writes totals at least this often.
    #[serde(default = "default_log_interval_seconds")]
    pub log_interval_seconds: u64,
}

/// Archive production settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_compression_method")]
    pub method: CompressionMethod,
    /// Meaning is format-specific: gzip 0-9, zstd 1-19, 7z 0-9.
    #[serde(default = "default_compression_level")]
    pub level: i32,
    /// Per-archive size cap used by the partitioner, in bytes.
    #[serde(default = "default_max_archive_size")]
    pub max_archive_size: u64,
    #[serde(default = "default_compression_threads")]
    pub pgzip_threads: usize,
    /// Write-buffer sizing for the gzip path, e.g. "1g".
    #[serde(default = "default_pgzip_block_size")]
    pub pgzip_block_size: String,
    #[serde(default = "default_compression_threads")]
    pub zstd_threads: usize,
    /// Write-buffer size for the zstd path, e.g. "4m".
    #[serde(default = "default_zstd_write_size")]
    pub zstd_write_size: String,
    /// External 7z binary.
    #[serde(default = "default_sevenzip_path")]
    pub sevenzip_path: String,
    /// 7z dictionary size argument, e.g. "384m".
    #[serde(default = "default_dictionary_size")]
    pub dictionary_size: String,
    /// Thread count passed to the external 7z command.
    #[serde(default = "default_compression_threads")]
    pub command_threads: usize,
    /// Compress straight onto the tape filesystem; staging becomes final.
    #[serde(default)]
    pub direct_to_tape: bool,
}

/// Free-space gate ahead of each archive build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    #[serde(default = "default_disk_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_disk_check_max_retries")]
    pub max_retries: u32,
}

fn default_db_path() -> String {
    "tapeline_catalog.redb".to_string()
}

fn default_temp_dir() -> String {
    "backup_temp".to_string()
}

fn default_compress_dir() -> String {
    "backup_compress".to_string()
}

fn default_drive_path() -> String {
    "/mnt/ltfs".to_string()
}

fn default_move_retries() -> u32 {
    3
}

fn default_scan_method() -> String {
    "default".to_string()
}

fn default_scan_threads() -> usize {
    num_cpus::get().clamp(2, 8)
}

fn default_batch_size() -> usize {
    5000
}

fn default_batch_size_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_update_interval() -> u64 {
    10_000
}

fn default_log_interval_seconds() -> u64 {
    60
}

fn default_compression_method() -> CompressionMethod {
    CompressionMethod::Zstd
}

fn default_compression_level() -> i32 {
    3
}

fn default_max_archive_size() -> u64 {
    100 * 1024 * 1024 * 1024
}

fn default_compression_threads() -> usize {
    num_cpus::get()
}

fn default_pgzip_block_size() -> String {
    "1g".to_string()
}

fn default_zstd_write_size() -> String {
    "4m".to_string()
}

fn default_sevenzip_path() -> String {
    "7z".to_string()
}

fn default_dictionary_size() -> String {
    "384m".to_string()
}

fn default_disk_check_interval() -> u64 {
    30
}

fn default_disk_check_max_retries() -> u32 {
    20
}

fn default_retention_days() -> u32 {
    180
}

impl Default for TapeConfig {
    fn default() -> Self {
        Self {
            drive_path: default_drive_path(),
            max_volume_size: 0,
            move_retries: default_move_retries(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            method: default_scan_method(),
            use_multithread: false,
            threads: default_scan_threads(),
            batch_size: default_batch_size(),
            batch_size_bytes: default_batch_size_bytes(),
            update_interval: default_update_interval(),
            log_interval_seconds: default_log_interval_seconds(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            method: default_compression_method(),
            level: default_compression_level(),
            max_archive_size: default_max_archive_size(),
            pgzip_threads: default_compression_threads(),
            pgzip_block_size: default_pgzip_block_size(),
            zstd_threads: default_compression_threads(),
            zstd_write_size: default_zstd_write_size(),
            sevenzip_path: default_sevenzip_path(),
            dictionary_size: default_dictionary_size(),
            command_threads: default_compression_threads(),
            direct_to_tape: false,
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_disk_check_interval(),
            max_retries: default_disk_check_max_retries(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.storage.db_path.is_empty() {
            bail!("Catalog database path cannot be empty");
        }

        if self.scan.method != "default" {
            bail!("Unknown scan method: {}", self.scan.method);
        }

        if self.scan.threads == 0 {
            bail!("Scan threads must be at least 1");
        }

        if self.scan.batch_size == 0 || self.scan.batch_size_bytes == 0 {
            bail!("Scan batch thresholds must be greater than zero");
        }

        if self.compression.max_archive_size == 0 {
            bail!("Max archive size must be greater than zero");
        }

        let level = self.compression.level;
        let level_ok = match self.compression.method {
            CompressionMethod::Tar => true,
            CompressionMethod::Pgzip => (0..=9).contains(&level),
            CompressionMethod::Zstd => (1..=19).contains(&level),
            CompressionMethod::P7zip => (0..=9).contains(&level),
        };
        if !level_ok {
            bail!(
                "Compression level {} is out of range for method {}",
                level,
                self.compression.method.as_str()
            );
        }

        for (key, value) in [
            ("pgzip_block_size", &self.compression.pgzip_block_size),
            ("zstd_write_size", &self.compression.zstd_write_size),
            ("dictionary_size", &self.compression.dictionary_size),
        ] {
            if parse_size_bytes(value).is_none() {
                bail!("Cannot parse {} value: {}", key, value);
            }
        }

        if self.compression.pgzip_threads == 0
            || self.compression.zstd_threads == 0
            || self.compression.command_threads == 0
        {
            bail!("Compression thread counts must be at least 1");
        }

        if self.disk.check_interval_secs == 0 {
            bail!("Disk check interval must be at least 1 second");
        }

        Ok(())
    }

    pub fn temp_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.temp_dir)
    }

    pub fn compress_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.compress_dir)
    }

    pub fn tape_drive(&self) -> PathBuf {
        PathBuf::from(&self.tape.drive_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            storage: StorageConfig {
                db_path: "catalog.redb".to_string(),
                temp_dir: "tmp".to_string(),
                compress_dir: "compress".to_string(),
            },
            tape: TapeConfig::default(),
            scan: ScanConfig::default(),
            compression: CompressionConfig::default(),
            disk: DiskConfig::default(),
            retention_days: 180,
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_level() {
        let mut config = base_config();
        config.compression.method = CompressionMethod::Zstd;
        config.compression.level = 25;
        assert!(config.validate().is_err());

        config.compression.method = CompressionMethod::Pgzip;
        config.compression.level = 9;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_unknown_scan_method() {
        let mut config = base_config();
        config.scan.method = "breadth_first".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_size_string() {
        let mut config = base_config();
        config.compression.dictionary_size = "huge".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
            [storage]
            db_path = "cat.redb"

            [compression]
            method = "pgzip"
            level = 5
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.compression.method, CompressionMethod::Pgzip);
        assert_eq!(config.compression.level, 5);
        assert_eq!(config.scan.batch_size, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_method_extensions() {
        assert_eq!(CompressionMethod::Tar.extension(), "tar");
        assert_eq!(CompressionMethod::Pgzip.extension(), "tar.gz");
        assert_eq!(CompressionMethod::Zstd.extension(), "tar.zst");
        assert_eq!(CompressionMethod::P7zip.extension(), "7z");
    }
}
