pub mod config;
pub mod error;
mod fsutil;
pub mod lock;
pub mod logger;
pub mod process;
mod reentrant;
pub mod signals;

// Re-export commonly used types
pub use config::{DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT, LockOptions, SYSLOCK_ROOT, SettingsFile};
pub use error::{Result, SyslockError};
pub use fsutil::{ensure_filename, named_lock_path};
pub use logger::init_logger;
pub use lock::{
    CLockStatus, EnsureLevel, ExecutionCLock, ExecutionLock, Phase, RunLevelHooks, RunLevelLock,
    RunLevelSpec, RunLockStatus,
};
pub use process::ProcessIdentity;
pub use signals::SignalDefer;
