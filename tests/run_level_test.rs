use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use syslock::{
    EnsureLevel, LockOptions, Phase, RunLevelHooks, RunLevelLock, RunLevelSpec, SyslockError,
};
use tempfile::TempDir;

fn test_spec() -> RunLevelSpec<&'static str> {
    RunLevelSpec {
        unlocked: "unlocked",
        base: "base",
        levels: vec![("low", 4), ("mid", 2), ("high", 1)],
        running_threshold: None,
        solo_threshold: Some("high"),
    }
}

fn test_options(root: &Path) -> LockOptions {
    LockOptions {
        relative_to: root.to_path_buf(),
        blocking: false,
        timeout: Duration::from_millis(500),
        check_interval: Duration::from_millis(20),
        ..LockOptions::default()
    }
}

fn run_lock(root: &Path) -> RunLevelLock<&'static str> {
    RunLevelLock::new(Some(Path::new("run.lock")), test_spec(), test_options(root)).unwrap()
}

/// Constructor-level validation of the level hierarchy
#[test]
fn test_construction_validation() {
    let temp_dir = TempDir::new().unwrap();
    let options = test_options(temp_dir.path());
    let path = Some(Path::new("run.lock"));

    let build = |spec: RunLevelSpec<&'static str>| {
        RunLevelLock::new(path, spec, options.clone()).map(|_| ())
    };

    // Unlocked and base must differ
    let err = build(RunLevelSpec {
        base: "unlocked",
        ..test_spec()
    })
    .unwrap_err();
    assert!(matches!(err, SyslockError::InvalidConfig { .. }));

    // Real levels must not repeat the base
    let err = build(RunLevelSpec {
        levels: vec![("base", 2)],
        ..test_spec()
    })
    .unwrap_err();
    assert!(matches!(err, SyslockError::InvalidConfig { .. }));

    // At least one real level
    let err = build(RunLevelSpec {
        levels: vec![],
        ..test_spec()
    })
    .unwrap_err();
    assert!(matches!(err, SyslockError::InvalidConfig { .. }));

    // No duplicate real levels
    let err = build(RunLevelSpec {
        levels: vec![("low", 2), ("low", 3)],
        ..test_spec()
    })
    .unwrap_err();
    assert!(matches!(err, SyslockError::InvalidConfig { .. }));

    // Caps must be positive
    let err = build(RunLevelSpec {
        levels: vec![("low", 0)],
        ..test_spec()
    })
    .unwrap_err();
    assert!(matches!(err, SyslockError::InvalidConfig { .. }));

    // Running threshold must be base or a real level
    let err = build(RunLevelSpec {
        running_threshold: Some("unlocked"),
        ..test_spec()
    })
    .unwrap_err();
    assert!(matches!(err, SyslockError::InvalidConfig { .. }));

    // Solo threshold must be a real level
    let err = build(RunLevelSpec {
        solo_threshold: Some("base"),
        ..test_spec()
    })
    .unwrap_err();
    assert!(matches!(err, SyslockError::InvalidConfig { .. }));

    // Solo threshold must not be below the running threshold
    let err = build(RunLevelSpec {
        running_threshold: Some("mid"),
        solo_threshold: Some("low"),
        ..test_spec()
    })
    .unwrap_err();
    assert!(matches!(err, SyslockError::InvalidConfig { .. }));
}

/// Boolean level tokens are rejected outright
#[test]
fn test_boolean_levels_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let spec = RunLevelSpec {
        unlocked: false,
        base: true,
        levels: vec![],
        running_threshold: None,
        solo_threshold: None,
    };
    let err = RunLevelLock::new(
        Some(Path::new("run.lock")),
        spec,
        test_options(temp_dir.path()),
    )
    .unwrap_err();
    assert!(matches!(err, SyslockError::InvalidConfig { .. }));
    assert!(err.to_string().contains("boolean"));
}

/// Escalating to a level acquires base and every intermediate counted
/// lock in ascending order; the on-disk layout reflects exactly that
#[test]
fn test_escalation_file_layout() {
    let temp_dir = TempDir::new().unwrap();
    let mut lock = run_lock(temp_dir.path());
    let base = temp_dir.path().join("run.lock");

    // Real levels need the outer region
    let err = lock.set_level(&"mid").unwrap_err();
    assert!(matches!(err, SyslockError::InvalidState { .. }));

    lock.enter().unwrap();
    assert_eq!(*lock.current_level(), "base");
    assert!(base.exists());

    lock.set_level(&"mid").unwrap();
    assert_eq!(*lock.current_level(), "mid");
    assert!(lock.current_level_satisfies(&"low").unwrap());
    assert!(lock.current_level_satisfies(&"mid").unwrap());
    assert!(!lock.current_level_satisfies(&"high").unwrap());
    assert!(temp_dir.path().join("run.lock.1").exists());
    assert!(temp_dir.path().join("run.lock.2").exists());
    assert!(!temp_dir.path().join("run.lock.3").exists());

    lock.set_level(&"high").unwrap();
    assert!(temp_dir.path().join("run.lock.1").exists());
    assert!(temp_dir.path().join("run.lock.2").exists());
    assert!(temp_dir.path().join("run.lock.3").exists());

    // De-escalation releases strictly descending; emptied ledgers vanish
    lock.set_level(&"low").unwrap();
    assert!(temp_dir.path().join("run.lock.1").exists());
    assert!(!temp_dir.path().join("run.lock.2").exists());
    assert!(!temp_dir.path().join("run.lock.3").exists());

    lock.exit().unwrap();
    assert_eq!(*lock.current_level(), "unlocked");
    assert!(!lock.locked());
    assert!(!temp_dir.path().join("run.lock.1").exists());
}

/// The running lock tracks the running threshold (default: lowest real
/// level)
#[test]
fn test_running_lock_follows_threshold() {
    let temp_dir = TempDir::new().unwrap();
    let mut lock = run_lock(temp_dir.path());

    lock.enter().unwrap();
    assert_eq!(*lock.running_threshold_level(), "low");
    assert!(!lock.running());

    lock.set_level(&"low").unwrap();
    assert!(lock.running());
    assert!(temp_dir.path().join("run.lock.r").exists());

    lock.set_level(&"base").unwrap();
    assert!(!lock.running());

    lock.exit().unwrap();
}

/// Scoped level regions compose as a maximum over all active requests
#[test]
fn test_with_level_scopes() {
    let temp_dir = TempDir::new().unwrap();
    let mut lock = run_lock(temp_dir.path());

    lock.enter().unwrap();
    lock.set_level(&"low").unwrap();

    lock.with_level(&"mid", |lock| {
        assert_eq!(*lock.current_level(), "mid");
        // An inner scope requesting less does not lower the level
        lock.with_level(&"low", |lock| {
            assert_eq!(*lock.current_level(), "mid");
            Ok(())
        })?;
        assert_eq!(*lock.current_level(), "mid");
        Ok(())
    })
    .unwrap();

    // Back to the sticky level once all scopes ended
    assert_eq!(*lock.current_level(), "low");

    // The scope unwinds on the error path as well
    let res: Result<(), SyslockError> = lock.with_level(&"high", |lock| {
        assert_eq!(*lock.current_level(), "high");
        Err(SyslockError::invalid_state("boom"))
    });
    assert!(res.is_err());
    assert_eq!(*lock.current_level(), "low");

    lock.exit().unwrap();
}

/// Solo acquisition escalates, excludes, and forbids level changes
#[test]
fn test_solo_protocol() {
    let temp_dir = TempDir::new().unwrap();
    let mut lock = run_lock(temp_dir.path());

    lock.enter().unwrap();
    lock.set_level(&"mid").unwrap();

    // Below the solo threshold without escalation permission
    let err = lock.go_solo(EnsureLevel::Keep).unwrap_err();
    assert!(matches!(err, SyslockError::InvalidState { .. }));
    assert!(!lock.is_solo());

    lock.go_solo(EnsureLevel::SoloThreshold).unwrap();
    assert!(lock.is_solo());
    assert!(lock.running());
    assert_eq!(*lock.current_level(), "high");
    assert!(temp_dir.path().join("run.lock.s").exists());

    // Level changes are rejected while solo
    let err = lock.set_level(&"mid").unwrap_err();
    assert!(matches!(err, SyslockError::InvalidState { .. }));
    // Re-stating the current level is fine
    lock.set_level(&"high").unwrap();

    lock.end_solo().unwrap();
    assert!(!lock.is_solo());
    assert!(lock.running());
    assert_eq!(*lock.current_level(), "high");
    assert!(!temp_dir.path().join("run.lock.s").exists());

    lock.exit().unwrap();
}

/// Solo mode must be enabled by a threshold
#[test]
fn test_solo_disabled() {
    let temp_dir = TempDir::new().unwrap();
    let spec = RunLevelSpec {
        solo_threshold: None,
        ..test_spec()
    };
    let mut lock = RunLevelLock::new(
        Some(Path::new("run.lock")),
        spec,
        test_options(temp_dir.path()),
    )
    .unwrap();
    assert!(!lock.solo_enabled());

    lock.enter().unwrap();
    lock.set_level(&"high").unwrap();
    let err = lock.go_solo(EnsureLevel::Keep).unwrap_err();
    assert!(matches!(err, SyslockError::InvalidState { .. }));
    lock.exit().unwrap();
}

/// A peer that holds running must yield before a solo peer can finish
/// going solo; afterwards the yielder holds running shared again
#[test]
fn test_yield_to_solo() {
    let temp_dir = TempDir::new().unwrap();
    let blocking_options = LockOptions {
        blocking: true,
        check_interval: Duration::from_millis(20),
        ..test_options(temp_dir.path())
    };

    let mut peer = RunLevelLock::new(
        Some(Path::new("run.lock")),
        test_spec(),
        blocking_options.clone(),
    )
    .unwrap();
    peer.enter().unwrap();
    peer.set_level(&"mid").unwrap();
    assert!(peer.running());
    assert!(!peer.solo_pending().unwrap());

    let solo_thread = thread::spawn(move || {
        let mut soloer =
            RunLevelLock::new(Some(Path::new("run.lock")), test_spec(), blocking_options)
                .unwrap();
        soloer.enter().unwrap();
        soloer.set_level(&"mid").unwrap();
        // Blocks re-acquiring running exclusively until the peer yields
        soloer.go_solo(EnsureLevel::SoloThreshold).unwrap();
        assert!(soloer.is_solo());
        thread::sleep(Duration::from_millis(200));
        soloer.end_solo().unwrap();
        soloer.exit().unwrap();
    });

    // The solo lock is taken before running is re-acquired, so the peer
    // observes the pending solo and yields
    let deadline = Instant::now() + Duration::from_secs(5);
    while !peer.solo_pending().unwrap() {
        assert!(Instant::now() < deadline, "solo never became pending");
        thread::sleep(Duration::from_millis(20));
    }

    peer.yield_to_solo().unwrap();
    assert!(peer.running());
    assert!(!peer.solo_pending().unwrap());

    solo_thread.join().unwrap();
    peer.exit().unwrap();
}

/// Cap updates honour the held-lock restrictions
#[test]
fn test_update_max_counts() {
    let temp_dir = TempDir::new().unwrap();
    let mut lock = run_lock(temp_dir.path());

    lock.enter().unwrap();
    lock.set_level(&"mid").unwrap();

    // Lowering a held cap is rejected
    let err = lock
        .update_max_counts(&[("mid", 1)], true, true)
        .unwrap_err();
    assert!(matches!(err, SyslockError::InvalidState { .. }));

    // Raising is fine when allowed
    lock.update_max_counts(&[("mid", 5)], true, true).unwrap();
    assert!(lock.max_counts().contains(&("mid", 5)));

    // Raising with allow_raise off is rejected too
    let err = lock
        .update_max_counts(&[("mid", 6)], true, false)
        .unwrap_err();
    assert!(matches!(err, SyslockError::InvalidState { .. }));

    // Unheld levels change freely
    lock.update_max_counts(&[("high", 3)], true, true).unwrap();

    // Pseudo levels carry no caps
    let err = lock.update_max_counts(&[("base", 2)], true, true).unwrap_err();
    assert!(matches!(err, SyslockError::InvalidConfig { .. }));

    lock.exit().unwrap();
}

/// Status snapshot spans the whole hierarchy
#[test]
fn test_lock_status() {
    let temp_dir = TempDir::new().unwrap();
    let mut lock = run_lock(temp_dir.path());

    lock.enter().unwrap();
    lock.set_level(&"mid").unwrap();

    let status = lock.lock_status(None).unwrap();
    assert!(status.base_lockable);
    assert!(status.solo_lockable);
    assert_eq!(status.levels.len(), 5);
    assert!(status.levels[0].is_none());
    assert!(status.levels[1].is_none());
    let low = status.levels[2].as_ref().unwrap();
    assert_eq!(low.fill_count, 1);
    let high = status.levels[4].as_ref().unwrap();
    assert_eq!(high.fill_count, 0);
    assert_eq!(status.processes.len(), 1);

    lock.exit().unwrap();
}

/// Transition hooks fire around every level change
#[test]
fn test_level_change_hooks() {
    struct Recorder {
        events: Arc<Mutex<Vec<(String, String, Phase)>>>,
    }

    impl RunLevelHooks<&'static str> for Recorder {
        fn on_level_change(&mut self, current: &&'static str, target: &&'static str, phase: Phase) {
            self.events
                .lock()
                .unwrap()
                .push(((*current).to_string(), (*target).to_string(), phase));
        }
    }

    let temp_dir = TempDir::new().unwrap();
    let mut lock = run_lock(temp_dir.path());
    let events = Arc::new(Mutex::new(Vec::new()));
    lock.set_hooks(Box::new(Recorder {
        events: events.clone(),
    }));

    lock.enter().unwrap();
    lock.set_level(&"mid").unwrap();
    lock.exit().unwrap();

    let events = events.lock().unwrap();
    assert_eq!(
        events[0],
        ("base".to_string(), "mid".to_string(), Phase::Before)
    );
    assert_eq!(
        events[1],
        ("base".to_string(), "mid".to_string(), Phase::After)
    );
    // The outer exit de-escalates back to unlocked
    assert_eq!(
        events[2],
        ("mid".to_string(), "unlocked".to_string(), Phase::Before)
    );
    assert_eq!(
        events[3],
        ("mid".to_string(), "unlocked".to_string(), Phase::After)
    );
}

/// Nested outer regions release only at the outermost exit
#[test]
fn test_outer_region_reentrance() {
    let temp_dir = TempDir::new().unwrap();
    let mut lock = run_lock(temp_dir.path());

    lock.enter().unwrap();
    lock.enter().unwrap();
    lock.set_level(&"low").unwrap();

    lock.exit().unwrap();
    assert!(lock.locked());
    assert_eq!(*lock.current_level(), "low");

    lock.exit().unwrap();
    assert!(!lock.locked());
    assert_eq!(*lock.current_level(), "unlocked");
}
