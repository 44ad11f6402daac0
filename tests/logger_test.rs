use std::path::Path;
use std::time::Duration;
use syslock::config::SettingsFile;
use syslock::{ExecutionLock, LockOptions, SyslockError, init_logger};
use tempfile::TempDir;

/// Settings-driven logging wires lock activity to the configured file,
/// and a second install is rejected. Runs as its own process, so the
/// subscriber slot is guaranteed free for the first call.
#[test]
fn test_init_from_settings() {
    let temp_dir = TempDir::new().unwrap();
    let log_path = temp_dir.path().join("locks.log");

    let settings = SettingsFile {
        log_level: Some("debug".to_string()),
        log_format: Some("json".to_string()),
        log_file: Some(log_path.clone()),
        ..SettingsFile::default()
    };
    settings.validate().unwrap();
    init_logger(&settings).unwrap();

    // Lock activity now flows through the installed subscriber
    let options = LockOptions {
        relative_to: temp_dir.path().to_path_buf(),
        blocking: false,
        timeout: Duration::from_millis(500),
        check_interval: Duration::from_millis(20),
        ..LockOptions::default()
    };
    let mut lock = ExecutionLock::new(Some(Path::new("logged.lock")), options).unwrap();
    lock.enter().unwrap();
    lock.exit().unwrap();

    assert!(log_path.exists());

    let err = init_logger(&settings).unwrap_err();
    assert!(matches!(err, SyslockError::InvalidState { .. }));
}
