use crate::error::{Result, SyslockError};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default root directory for system-wide lock files
pub const SYSLOCK_ROOT: &str = "/var/lock/syslock";

/// Default acquisition timeout when not blocking indefinitely
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

/// Default interval between repeated acquisition attempts
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(400);

/// Per-lock tunables shared by all lock primitives.
///
/// Values are plain data owned by each lock instance; there is no hidden
/// process-global mutable configuration.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Absolute directory relative to which relative lock paths resolve
    pub relative_to: PathBuf,
    /// Recursively create the lock file directory when missing
    pub makedirs: bool,
    /// Mode for directory creation, prior to umask restriction
    pub dir_mode: u32,
    /// Mode for lock file creation, prior to umask restriction
    pub file_mode: u32,
    /// Umask to apply temporarily while creating files/directories
    pub umask: Option<u32>,
    /// Block indefinitely (true) or enforce `timeout` (false)
    pub blocking: bool,
    /// Acquisition deadline when not blocking
    pub timeout: Duration,
    /// Sleep between acquisition attempts
    pub check_interval: Duration,
    /// Acquire a shared lock instead of an exclusive one
    pub shared_lock: bool,
    /// Safety margin slept after a successful acquisition
    pub lock_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            relative_to: PathBuf::from(SYSLOCK_ROOT),
            makedirs: true,
            dir_mode: 0o777,
            file_mode: 0o666,
            umask: Some(0o000),
            blocking: true,
            timeout: DEFAULT_TIMEOUT,
            check_interval: DEFAULT_CHECK_INTERVAL,
            shared_lock: false,
            lock_delay: Duration::ZERO,
        }
    }
}

impl LockOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.relative_to.is_absolute() {
            return Err(SyslockError::invalid_config(format!(
                "'relative_to' must be an absolute path: {}",
                self.relative_to.display()
            )));
        }
        if self.check_interval.is_zero() {
            return Err(SyslockError::invalid_config(
                "check_interval must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Resolve a lock path against `relative_to`
    pub(crate) fn resolve(&self, lock_path: &Path) -> PathBuf {
        if lock_path.is_absolute() {
            lock_path.to_path_buf()
        } else {
            self.relative_to.join(lock_path)
        }
    }
}

/// Optional JSON settings file overriding the built-in lock defaults
#[derive(Debug, Deserialize, Default)]
pub struct SettingsFile {
    pub root: Option<PathBuf>,
    pub timeout_secs: Option<f64>,
    pub check_interval_secs: Option<f64>,
    pub lock_delay_secs: Option<f64>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl SettingsFile {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let settings_path = if let Some(p) = path {
            if !p.exists() {
                return Err(SyslockError::invalid_config(format!(
                    "Settings file not found: {p:?}"
                )));
            }
            Some(p)
        } else {
            // Try the default location
            let json_path = PathBuf::from("syslock.json");
            if json_path.exists() { Some(json_path) } else { None }
        };

        if let Some(path) = settings_path {
            let content = fs::read_to_string(&path).map_err(|e| {
                SyslockError::io_error(format!("Failed to read settings file: {path:?}"), e)
            })?;

            let settings: Self = serde_json::from_str(&content).map_err(|e| {
                SyslockError::invalid_config(format!(
                    "Failed to parse settings file {path:?}: {e}"
                ))
            })?;

            settings.validate()?;

            Ok(settings)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(root) = &self.root {
            if !root.is_absolute() {
                return Err(SyslockError::invalid_config(format!(
                    "root must be an absolute path: {}",
                    root.display()
                )));
            }
        }

        if let Some(secs) = self.timeout_secs {
            if !secs.is_finite() || secs < 0.0 {
                return Err(SyslockError::invalid_config(format!(
                    "timeout_secs must be a non-negative number: {secs}"
                )));
            }
        }

        if let Some(secs) = self.check_interval_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(SyslockError::invalid_config(format!(
                    "check_interval_secs must be greater than zero: {secs}"
                )));
            }
        }

        if let Some(secs) = self.lock_delay_secs {
            if !secs.is_finite() || secs < 0.0 {
                return Err(SyslockError::invalid_config(format!(
                    "lock_delay_secs must be a non-negative number: {secs}"
                )));
            }
        }

        if let Some(level) = &self.log_level {
            let valid_levels = ["trace", "debug", "info", "warn", "error"];
            if !valid_levels.contains(&level.as_str()) {
                return Err(SyslockError::invalid_config(format!(
                    "Invalid log_level: '{level}'. Allowed: {valid_levels:?}"
                )));
            }
        }

        if let Some(format) = &self.log_format {
            let valid_formats = ["text", "json"];
            if !valid_formats.contains(&format.as_str()) {
                return Err(SyslockError::invalid_config(format!(
                    "Invalid log_format: '{format}'. Allowed: {valid_formats:?}"
                )));
            }
        }

        Ok(())
    }

    /// Lock options with this file's overrides applied over the defaults
    #[must_use]
    pub fn options(&self) -> LockOptions {
        let mut opts = LockOptions::default();
        if let Some(root) = &self.root {
            opts.relative_to = root.clone();
        }
        if let Some(secs) = self.timeout_secs {
            opts.timeout = Duration::try_from_secs_f64(secs).unwrap_or(DEFAULT_TIMEOUT);
        }
        if let Some(secs) = self.check_interval_secs {
            opts.check_interval =
                Duration::try_from_secs_f64(secs).unwrap_or(DEFAULT_CHECK_INTERVAL);
        }
        if let Some(secs) = self.lock_delay_secs {
            opts.lock_delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO);
        }
        opts
    }
}
