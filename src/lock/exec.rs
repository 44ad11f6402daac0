use crate::config::LockOptions;
use crate::error::{Result, SyslockError};
use crate::fsutil;
use crate::lock::file::LockFile;
use crate::reentrant::{EnterOutcome, ExitOutcome, ReentryState};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// System-wide execution lock tied to a lock file path.
///
/// Exclusive by default, shared on request. While held exclusive, the
/// file contains the holder's PID in the ten-byte `/var/lock` format;
/// on exclusive release the file is unlinked (best-effort), which is
/// what makes the stolen-lock recovery in [`LockFile`] necessary for
/// every waiter.
///
/// Reentrant within a process: nested `enter` calls only count, and the
/// outermost `exit` performs the real release.
#[derive(Debug)]
pub struct ExecutionLock {
    options: LockOptions,
    shared: bool,
    held_shared: bool,
    path: Option<PathBuf>,
    lock: Option<LockFile>,
    reentry: ReentryState,
}

impl ExecutionLock {
    /// Create a lock for `lock_path`, resolved against
    /// `options.relative_to` when relative. A `None` path produces an
    /// invalid lock that errors on `enter` until a path is set.
    pub fn new(lock_path: Option<&Path>, options: LockOptions) -> Result<Self> {
        options.validate()?;
        let shared = options.shared_lock;
        let mut lock = Self {
            options,
            shared,
            held_shared: shared,
            path: None,
            lock: None,
            reentry: ReentryState::default(),
        };
        lock.set_lock_path(lock_path)?;
        Ok(lock)
    }

    /// Create a lock for a sanitised name under the named-lock directory
    pub fn named(lock_name: &str, options: LockOptions) -> Result<Self> {
        let mut lock = Self::new(None, options)?;
        lock.set_lock_name(lock_name)?;
        Ok(lock)
    }

    /// Point the lock at a new path. Only permitted while unlocked and
    /// unentered.
    pub fn set_lock_path(&mut self, lock_path: Option<&Path>) -> Result<()> {
        if self.locked() || self.reentry.count() > 0 {
            return Err(SyslockError::invalid_state(format!(
                "cannot set lock path while locked/entered: tried {:?} -> {:?}",
                self.path, lock_path
            )));
        }

        match lock_path {
            None => {
                self.path = None;
                self.lock = None;
            }
            Some(lock_path) => {
                let resolved = self.options.resolve(lock_path);
                if self.options.makedirs {
                    fsutil::create_lock_dir(&resolved, self.options.dir_mode, self.options.umask)
                        .map_err(|e| {
                            SyslockError::io_error(
                                format!(
                                    "Failed to create lock directory for {}",
                                    resolved.display()
                                ),
                                e,
                            )
                        })?;
                }
                self.lock = Some(LockFile::new(
                    resolved.clone(),
                    self.options.file_mode,
                    self.options.umask,
                    true,
                ));
                self.path = Some(resolved);
            }
        }
        Ok(())
    }

    /// Re-point the lock at a named lock. Same restrictions as
    /// [`set_lock_path`](Self::set_lock_path).
    pub fn set_lock_name(&mut self, lock_name: &str) -> Result<()> {
        let path = fsutil::named_lock_path(lock_name, &self.options.relative_to);
        self.set_lock_path(Some(&path))
    }

    #[must_use]
    pub fn lock_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether the lock has a usable path
    #[must_use]
    pub const fn lock_valid(&self) -> bool {
        self.lock.is_some()
    }

    #[must_use]
    pub fn locked(&self) -> bool {
        self.lock.as_ref().is_some_and(LockFile::is_held)
    }

    /// Mode actually held at the last acquisition
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.held_shared
    }

    #[must_use]
    pub const fn enter_count(&self) -> u32 {
        self.reentry.count()
    }

    pub fn set_timeout(&mut self, timeout: Duration, check_interval: Duration, blocking: bool) {
        self.options.timeout = timeout;
        self.options.check_interval = check_interval;
        self.options.blocking = blocking;
    }

    /// Switch between shared and exclusive for subsequent acquisitions
    pub fn set_shared(&mut self, shared: bool) -> Result<()> {
        if self.locked() {
            return Err(SyslockError::invalid_state(format!(
                "cannot change lock mode while locked: {:?}",
                self.path
            )));
        }
        self.shared = shared;
        Ok(())
    }

    /// Acquire the lock (reentrant)
    pub fn enter(&mut self) -> Result<()> {
        match self.reentry.on_enter() {
            EnterOutcome::Passthrough => self.acquire(),
            EnterOutcome::Nested => Ok(()),
            EnterOutcome::First => {
                let res = self.acquire();
                self.reentry.enter_done(res.is_ok());
                res
            }
        }
    }

    /// Release the lock (reentrant; only the outermost exit releases)
    pub fn exit(&mut self) -> Result<()> {
        match self.reentry.on_exit()? {
            ExitOutcome::Passthrough => {
                self.release();
                Ok(())
            }
            ExitOutcome::Nested => Ok(()),
            ExitOutcome::Last => {
                self.release();
                self.reentry.exit_done();
                Ok(())
            }
        }
    }

    /// Run `f` while holding the lock; released on all return paths
    pub fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.enter()?;
        let out = f(self);
        let exit_res = self.exit();
        match out {
            Ok(value) => exit_res.map(|()| value),
            Err(e) => Err(e),
        }
    }

    /// Idempotent reconciliation towards the wanted state.
    ///
    /// Acquisition is skipped while the thread is unwinding a panic
    /// (unless `during_exit`), so shutdown paths cannot deadlock on a
    /// contended lock.
    pub fn ensure_locked(&mut self, want: bool, during_exit: bool) -> Result<()> {
        if want && !self.locked() && (during_exit || !thread::panicking()) {
            self.enter()?;
        }
        if !want && self.locked() {
            self.exit()?;
        }
        Ok(())
    }

    /// Probe whether the lock could be taken right now, without keeping it
    pub fn test_lockable(&mut self, shared: Option<bool>) -> Result<bool> {
        let configured = self.shared;
        let Some(lock) = self.lock.as_mut() else {
            return Err(SyslockError::invalid_state(
                "cannot test lockability with a lock path of None",
            ));
        };
        if lock.is_held() {
            return Ok(true);
        }
        lock.probe(shared.unwrap_or(configured))
    }

    /// Acquire-then-release, to wake waiters or wait out the current
    /// holder. Errors when already held in the opposite configuration.
    pub fn touch_lock(&mut self, shared: Option<bool>) -> Result<()> {
        let shared = shared.unwrap_or(self.shared);
        let (blocking, timeout, check_interval) = (
            self.options.blocking,
            self.options.timeout,
            self.options.check_interval,
        );
        let held_shared = self.held_shared;
        let Some(lock) = self.lock.as_mut() else {
            return Err(SyslockError::invalid_state(
                "cannot touch lock with a lock path of None",
            ));
        };
        if lock.is_held() {
            if shared == held_shared {
                return Ok(());
            }
            return Err(SyslockError::invalid_state(format!(
                "cannot touch lock while it is already locked in the opposite configuration: {}",
                lock.path().display()
            )));
        }
        lock.touch(shared, blocking, timeout, check_interval)
    }

    fn acquire(&mut self) -> Result<()> {
        let shared = self.shared;
        let Some(lock) = self.lock.as_mut() else {
            return Err(SyslockError::invalid_state(
                "cannot lock with a lock path of None",
            ));
        };

        lock.acquire(
            "acquiring",
            shared,
            self.options.blocking,
            self.options.timeout,
            self.options.check_interval,
        )?;
        self.held_shared = shared;

        if !shared {
            if let Err(e) = write_pid_payload(lock) {
                lock.release(true);
                return Err(e);
            }
        }

        debug!(path = %lock.path().display(), shared, "execution lock acquired");

        if !self.options.lock_delay.is_zero() {
            thread::sleep(self.options.lock_delay);
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(lock) = self.lock.as_mut() {
            if lock.is_held() {
                let exclusive = !self.held_shared;
                lock.release(exclusive);
                debug!(path = %lock.path().display(), exclusive, "execution lock released");
            }
        }
    }
}

/// Write the holder PID in the ten-byte `/var/lock` format
fn write_pid_payload(lock: &mut LockFile) -> Result<()> {
    let Some(mut file) = lock.file() else {
        return Err(SyslockError::invalid_state(
            "lock descriptor vanished before PID write",
        ));
    };
    let payload = format!("{:10}\n", std::process::id());
    file.set_len(0)
        .and_then(|()| file.seek(SeekFrom::Start(0)))
        .and_then(|_| file.write_all(payload.as_bytes()))
        .and_then(|()| file.flush())
        .map_err(|e| {
            SyslockError::io_error(
                format!("Failed to write PID to lock file {}", lock.path().display()),
                e,
            )
        })
}
