use std::fmt;
use std::io;
use std::path::PathBuf;

/// Custom error type for syslock operations
#[derive(Debug)]
pub enum SyslockError {
    /// Lock could not be acquired within the configured deadline
    Timeout { action: String, path: PathBuf },

    /// Attempted state change while the lock is held/entered, or a
    /// transition the protocol forbids (e.g. level change in solo mode)
    InvalidState { message: String },

    /// Invalid construction parameters (levels, thresholds, counts, paths)
    InvalidConfig { message: String },

    /// IO errors (file open/lock/rename, process table lookups)
    Io { context: String, source: io::Error },
}

impl fmt::Display for SyslockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { action, path } => {
                write!(f, "Timed out while {} lock: {}", action, path.display())
            }
            Self::InvalidState { message } => {
                write!(f, "Invalid lock state: {message}")
            }
            Self::InvalidConfig { message } => {
                write!(f, "Invalid lock configuration: {message}")
            }
            Self::Io { context, source } => {
                write!(f, "{context}: {source}")
            }
        }
    }
}

impl std::error::Error for SyslockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for SyslockError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            context: "IO operation failed".to_string(),
            source: err,
        }
    }
}

// Helper methods for creating errors with context
impl SyslockError {
    pub fn timeout(action: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::Timeout {
            action: action.into(),
            path: path.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn io_error(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True iff this is a deadline expiry rather than a hard failure
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type alias for syslock operations
pub type Result<T> = std::result::Result<T, SyslockError>;
