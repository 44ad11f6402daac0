mod counted;
mod exec;
mod file;
mod runlevel;

pub use counted::{CLockStatus, ExecutionCLock};
pub use exec::ExecutionLock;
pub use runlevel::{
    EnsureLevel, Phase, RunLevelHooks, RunLevelLock, RunLevelSpec, RunLockStatus,
};
