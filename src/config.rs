use std::env;
use std::path::PathBuf;

use chrono::Duration;

use crate::archive::manifest::OLDEST_SUPPORTED_MAJOR;

pub const DATA_DIR_ENV: &str = "CODICTATE_FAKE_APPDATA";
pub const APP_IDENTIFIER: &str = "com.codictate.app";

const DEFAULT_RETENTION_DAYS: i64 = 7;
const HARD_MAX_RETENTION_DAYS: i64 = 90;

/// Hard ceilings applied while inspecting an archive. There is a single tier:
/// breaching any of these is blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_entries: usize,
    pub max_entry_bytes: u64,
    pub max_total_bytes: u64,
    /// Uncompressed/compressed ratio, only enforced for entries of at least
    /// `ratio_floor_bytes` uncompressed.
    pub max_compression_ratio: u64,
    pub ratio_floor_bytes: u64,
    pub max_line_bytes: usize,
    /// Manifest and checksum files are read whole, so they get a tight bound.
    pub max_metadata_bytes: u64,
}

impl ResourceLimits {
    const HARD_MAX_ENTRIES: usize = 1_000_000;
    const HARD_MAX_ENTRY_BYTES: u64 = 4 * 1024 * 1024 * 1024;
    const HARD_MAX_TOTAL_BYTES: u64 = 64 * 1024 * 1024 * 1024;
    const HARD_MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

    pub fn load() -> Self {
        let defaults = Self::default();
        Self {
            max_entries: env_number("CODICTATE_BACKUP_MAX_ENTRIES")
                .map(|value| (value as usize).min(Self::HARD_MAX_ENTRIES))
                .unwrap_or(defaults.max_entries),
            max_entry_bytes: env_number("CODICTATE_BACKUP_MAX_ENTRY_BYTES")
                .map(|value| value.min(Self::HARD_MAX_ENTRY_BYTES))
                .unwrap_or(defaults.max_entry_bytes),
            max_total_bytes: env_number("CODICTATE_BACKUP_MAX_TOTAL_BYTES")
                .map(|value| value.min(Self::HARD_MAX_TOTAL_BYTES))
                .unwrap_or(defaults.max_total_bytes),
            max_line_bytes: env_number("CODICTATE_BACKUP_MAX_LINE_BYTES")
                .map(|value| (value as usize).min(Self::HARD_MAX_LINE_BYTES))
                .unwrap_or(defaults.max_line_bytes),
            ..defaults
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_entries: 200_000,
            max_entry_bytes: 1024 * 1024 * 1024,
            max_total_bytes: 16 * 1024 * 1024 * 1024,
            max_compression_ratio: 200,
            ratio_floor_bytes: 1024 * 1024,
            max_line_bytes: 4 * 1024 * 1024,
            max_metadata_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Application data directory; the active dataset lives under it.
    pub data_dir: PathBuf,
    pub limits: ResourceLimits,
    /// How long a rollback snapshot is kept after a completed restore.
    pub retention: Duration,
    /// Replaces the real free-space probe (tests).
    pub free_space_override: Option<u64>,
    /// Oldest archive format major still accepted. Raising it ends the
    /// deprecation runway for that major.
    pub min_format_major: u64,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            limits: ResourceLimits::default(),
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
            free_space_override: None,
            min_format_major: OLDEST_SUPPORTED_MAJOR,
        }
    }

    /// Defaults plus environment overrides.
    pub fn load(data_dir: impl Into<PathBuf>) -> Self {
        let retention_days = env_number("CODICTATE_BACKUP_RETENTION_DAYS")
            .map(|days| (days as i64).min(HARD_MAX_RETENTION_DAYS))
            .unwrap_or(DEFAULT_RETENTION_DAYS);
        let free_space_override = env::var("CODICTATE_BACKUP_FAKE_FREE_BYTES")
            .ok()
            .and_then(|value| value.parse::<u64>().ok());

        Self {
            data_dir: data_dir.into(),
            limits: ResourceLimits::load(),
            retention: Duration::days(retention_days),
            free_space_override,
            min_format_major: OLDEST_SUPPORTED_MAJOR,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_free_space_override(mut self, bytes: u64) -> Self {
        self.free_space_override = Some(bytes);
        self
    }
}

pub fn default_data_dir() -> PathBuf {
    if let Some(fake) = env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(fake);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_IDENTIFIER)
}

// Zero and unparsable values fall back to the default.
fn env_number(key: &str) -> Option<u64> {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_snapshots_for_a_week() {
        let config = EngineConfig::new("/tmp/codictate");
        assert_eq!(config.retention, Duration::days(7));
        assert!(config.free_space_override.is_none());
        assert!(config.limits.max_entries > 0);
    }

    #[test]
    fn env_overrides_are_clamped() {
        env::set_var("CODICTATE_BACKUP_MAX_LINE_BYTES", "999999999999");
        env::set_var("CODICTATE_BACKUP_MAX_ENTRIES", "0");
        let limits = ResourceLimits::load();
        env::remove_var("CODICTATE_BACKUP_MAX_LINE_BYTES");
        env::remove_var("CODICTATE_BACKUP_MAX_ENTRIES");

        assert_eq!(limits.max_line_bytes, ResourceLimits::HARD_MAX_LINE_BYTES);
        assert_eq!(limits.max_entries, ResourceLimits::default().max_entries);
    }
}
