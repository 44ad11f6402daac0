use crate::config::SettingsFile;
use crate::error::{Result, SyslockError};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

// Keeps the background log writer alive for the process lifetime
static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the process-wide tracing subscriber from lock settings.
///
/// The lock primitives emit `tracing` events with structured fields at
/// acquisition, release, stolen-lock recovery and ledger rewrites; this
/// routes them to stderr or to `log_file`, as compact text or JSON per
/// `log_format`, filtered at `log_level` (overridable via `RUST_LOG`).
/// A consumer that installs its own subscriber skips this entirely.
///
/// Errors with `InvalidState` when a subscriber is already installed.
pub fn init_logger(settings: &SettingsFile) -> Result<()> {
    let level = settings.log_level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("syslock={level}")))
        .map_err(|e| SyslockError::invalid_config(format!("Invalid log filter: {e}")))?;

    let json = settings.log_format.as_deref() == Some("json");
    let registry = tracing_subscriber::registry().with(filter);

    let res = match &settings.log_file {
        Some(path) => {
            let writer = file_writer(path);
            if json {
                registry
                    .with(fmt::layer().json().with_writer(writer))
                    .try_init()
            } else {
                registry
                    .with(fmt::layer().compact().with_target(false).with_writer(writer))
                    .try_init()
            }
        }
        None => {
            if json {
                registry
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .try_init()
            } else {
                registry
                    .with(
                        fmt::layer()
                            .compact()
                            .with_target(false)
                            .with_writer(std::io::stderr),
                    )
                    .try_init()
            }
        }
    };

    res.map_err(|e| SyslockError::invalid_state(format!("logging is already initialised: {e}")))
}

/// Non-blocking writer appending to the given file; the worker guard is
/// parked in a static so buffered events survive until process exit.
fn file_writer(path: &Path) -> NonBlocking {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let file_name = path.file_name().unwrap_or_else(|| OsStr::new("syslock.log"));
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = WRITER_GUARD.set(guard);
    writer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        let settings = SettingsFile::default();

        // First install may race other crate tests; either way the
        // subscriber slot is taken afterwards.
        let _ = init_logger(&settings);

        let err = init_logger(&settings).unwrap_err();
        assert!(matches!(err, SyslockError::InvalidState { .. }));
    }
}
