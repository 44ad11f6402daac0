use crate::config::LockOptions;
use crate::error::{Result, SyslockError};
use crate::fsutil;
use crate::lock::file::LockFile;
use crate::process::ProcessIdentity;
use crate::reentrant::{EnterOutcome, ExitOutcome, ReentryState};
use crate::signals::SignalDefer;
use std::collections::HashSet;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// Distinguishes multiple counted locks held by one process in one ledger
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// One ledger line: `"<pid> <ctime_ms_or_0> <instance_id> <max_count>"`
#[derive(Debug, Clone, PartialEq, Eq)]
struct LedgerEntry {
    id: ProcessIdentity,
    instance_id: u64,
    max_count: u32,
}

impl LedgerEntry {
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let pid: u32 = parts.next()?.parse().ok()?;
        let ctime_ms: u64 = parts.next()?.parse().ok()?;
        let instance_id: u64 = parts.next()?.parse().ok()?;
        let max_count: u32 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || max_count < 1 {
            return None;
        }
        Some(Self {
            id: ProcessIdentity {
                pid,
                ctime_ms: if ctime_ms == 0 { None } else { Some(ctime_ms) },
            },
            instance_id,
            max_count,
        })
    }

    fn encode(&self) -> String {
        format!(
            "{} {} {} {}",
            self.id.pid,
            self.id.ctime_ms.unwrap_or(0),
            self.instance_id,
            self.max_count
        )
    }
}

/// Advisory snapshot of a counted lock's ledger
#[derive(Debug, Clone)]
pub struct CLockStatus {
    pub locked: bool,
    pub processes: HashSet<ProcessIdentity>,
    pub our_max_count: u32,
    pub max_count: u32,
    pub fill_count: usize,
    pub free_count: i64,
}

/// Result of one in-memory ledger edit
struct EditOutcome {
    new_lines: Vec<String>,
    processes: HashSet<ProcessIdentity>,
    max_allowed: u32,
    locked: bool,
}

/// Counted system-wide execution lock.
///
/// The lock file is a plain-text ledger listing the current holders, one
/// entry per line. Entering takes a short exclusive critical section on
/// the ledger file, prunes stale entries, and appends our entry when the
/// holder count is below the effective cap (the minimum of every live
/// entry's `max_count` and our own). Rewrites go through a `.swp`
/// sibling and an atomic same-filesystem `rename`; the protocol is
/// unsafe on filesystems that cannot guarantee atomic rename.
///
/// Reentrant within a process, like [`ExecutionLock`](super::ExecutionLock).
#[derive(Debug)]
pub struct ExecutionCLock {
    max_count: u32,
    options: LockOptions,
    path: Option<PathBuf>,
    swap_path: Option<PathBuf>,
    lock: Option<LockFile>,
    locked: bool,
    our_id: ProcessIdentity,
    instance_id: u64,
    reentry: ReentryState,
}

impl ExecutionCLock {
    pub fn new(lock_path: Option<&Path>, max_count: u32, options: LockOptions) -> Result<Self> {
        if max_count < 1 {
            return Err(SyslockError::invalid_config(format!(
                "maximum simultaneous lock acquisition count must be a positive integer: {max_count}"
            )));
        }
        options.validate()?;
        let our_id = ProcessIdentity::ours()?;
        let mut lock = Self {
            max_count,
            options,
            path: None,
            swap_path: None,
            lock: None,
            locked: false,
            our_id,
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            reentry: ReentryState::default(),
        };
        lock.set_lock_path(lock_path)?;
        Ok(lock)
    }

    /// Counted lock for a sanitised name under the named-lock directory
    pub fn named(lock_name: &str, max_count: u32, options: LockOptions) -> Result<Self> {
        let mut lock = Self::new(None, max_count, options)?;
        lock.set_lock_name(lock_name)?;
        Ok(lock)
    }

    pub fn set_lock_path(&mut self, lock_path: Option<&Path>) -> Result<()> {
        if self.locked || self.reentry.count() > 0 {
            return Err(SyslockError::invalid_state(format!(
                "cannot set lock path while locked/entered: tried {:?} -> {:?}",
                self.path, lock_path
            )));
        }

        match lock_path {
            None => {
                self.path = None;
                self.swap_path = None;
                self.lock = None;
                self.locked = false;
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
                let mut swap = resolved.clone().into_os_string();
                swap.push(".swp");
                self.swap_path = Some(PathBuf::from(swap));
                self.lock = Some(LockFile::new(
                    resolved.clone(),
                    self.options.file_mode,
                    self.options.umask,
                    false,
                ));
                self.path = Some(resolved);
                self.locked = false;
            }
        }
        Ok(())
    }

    pub fn set_lock_name(&mut self, lock_name: &str) -> Result<()> {
        let path = fsutil::named_lock_path(lock_name, &self.options.relative_to);
        self.set_lock_path(Some(&path))
    }

    #[must_use]
    pub fn lock_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub const fn lock_valid(&self) -> bool {
        self.lock.is_some()
    }

    #[must_use]
    pub const fn locked(&self) -> bool {
        self.locked
    }

    #[must_use]
    pub const fn max_count(&self) -> u32 {
        self.max_count
    }

    pub fn set_max_count(&mut self, max_count: u32) -> Result<()> {
        if max_count < 1 {
            return Err(SyslockError::invalid_config(format!(
                "maximum simultaneous lock acquisition count must be a positive integer: {max_count}"
            )));
        }
        self.max_count = max_count;
        Ok(())
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

    /// Acquire a counted slot (reentrant)
    pub fn enter(&mut self) -> Result<()> {
        match self.reentry.on_enter() {
            EnterOutcome::Passthrough => self.update_ledger(true),
            EnterOutcome::Nested => Ok(()),
            EnterOutcome::First => {
                let res = self.update_ledger(true);
                self.reentry.enter_done(res.is_ok());
                res
            }
        }
    }

    /// Release our counted slot (reentrant)
    pub fn exit(&mut self) -> Result<()> {
        match self.reentry.on_exit()? {
            ExitOutcome::Passthrough => self.exit_ledger(),
            ExitOutcome::Nested => Ok(()),
            ExitOutcome::Last => {
                let res = self.exit_ledger();
                self.reentry.exit_done();
                res
            }
        }
    }

    fn exit_ledger(&mut self) -> Result<()> {
        if self.lock.is_none() {
            return Ok(());
        }
        self.update_ledger(false)
    }

    /// Run `f` while holding a counted slot; released on all return paths
    pub fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.enter()?;
        let out = f(self);
        let exit_res = self.exit();
        match out {
            Ok(value) => exit_res.map(|()| value),
            Err(e) => Err(e),
        }
    }

    /// Advisory snapshot of the ledger, without taking the internal lock.
    ///
    /// Stale lines are pruned in memory only; the file is untouched.
    pub fn lock_status(&self) -> Result<CLockStatus> {
        let Some(path) = &self.path else {
            return Err(SyslockError::invalid_state(
                "cannot get lock status with a lock path of None",
            ));
        };

        let (mut processes, cur_max_count) = match fs::read_to_string(path) {
            Ok(contents) => {
                let lines: Vec<String> = contents.lines().map(str::to_string).collect();
                let outcome = self.edit_contents(&lines, false, true);
                (outcome.processes, outcome.max_allowed)
            }
            Err(_) => (HashSet::new(), self.max_count),
        };

        if self.locked {
            processes.insert(self.our_id);
        }
        let fill_count = processes.len();

        Ok(CLockStatus {
            locked: self.locked,
            processes,
            our_max_count: self.max_count,
            max_count: cur_max_count,
            fill_count,
            free_count: i64::from(cur_max_count) - fill_count as i64,
        })
    }

    /// Read-modify-write cycle on the ledger under the internal exclusive
    /// lock, repeated until the wanted state is reached or the deadline
    /// expires. Runs inside a signal-deferral region so user signals
    /// cannot interrupt a half-done rewrite.
    fn update_ledger(&mut self, enter: bool) -> Result<()> {
        let (Some(path), Some(swap_path)) = (self.path.clone(), self.swap_path.clone()) else {
            return Err(SyslockError::invalid_state(
                "cannot update lock file with a lock path of None",
            ));
        };

        let action = if enter {
            "acquiring counted"
        } else {
            "releasing counted"
        };
        let start = Instant::now();
        let deadline = if self.options.blocking {
            None
        } else {
            Some(start + self.options.timeout)
        };

        let mut defer = SignalDefer::new()?;

        loop {
            // Remaining budget for this attempt; a zero remainder still
            // tries the lock exactly once before timing out.
            let attempt_timeout = match deadline {
                None => self.options.timeout,
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            };

            let blocking = self.options.blocking;
            let check_interval = self.options.check_interval;
            let Some(lock) = self.lock.as_mut() else {
                return Err(SyslockError::invalid_state(
                    "cannot update lock file with a lock path of None",
                ));
            };
            lock.acquire(action, false, blocking, attempt_timeout, check_interval)?;

            let attempt = self.edit_locked_ledger(&path, &swap_path, enter);
            if let Some(lock) = self.lock.as_mut() {
                lock.release(false);
            }
            attempt?;

            if enter == self.locked {
                break;
            }

            // Cap is full; replay any deferred signals, then retry
            defer.drain()?;
            thread::sleep(self.options.check_interval);
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(SyslockError::timeout(action, &path));
                }
            }
        }

        drop(defer);

        if enter && !self.options.lock_delay.is_zero() {
            thread::sleep(self.options.lock_delay);
        }
        Ok(())
    }

    /// One edit attempt while the internal lock is held
    fn edit_locked_ledger(&mut self, path: &Path, swap_path: &Path, enter: bool) -> Result<()> {
        let old_lines = self.read_held_ledger(path)?;
        let outcome = self.edit_contents(&old_lines, enter, false);

        if outcome.new_lines.is_empty() {
            let _ = fs::remove_file(path);
            self.locked = false;
            debug!(path = %path.display(), "counted lock ledger emptied");
            return Ok(());
        }

        if outcome.new_lines != old_lines {
            self.rewrite_ledger(path, swap_path, &outcome.new_lines)?;
        }
        self.locked = outcome.locked;
        if enter && !outcome.locked {
            debug!(
                path = %path.display(),
                holders = outcome.new_lines.len(),
                cap = outcome.max_allowed,
                "counted lock cap reached, waiting"
            );
        }
        Ok(())
    }

    fn read_held_ledger(&self, path: &Path) -> Result<Vec<String>> {
        let Some(mut file) = self.lock.as_ref().and_then(LockFile::file) else {
            return Err(SyslockError::invalid_state(
                "ledger descriptor vanished while locked",
            ));
        };
        let mut contents = String::new();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_string(&mut contents))
            .map_err(|e| {
                SyslockError::io_error(
                    format!("Failed to read lock ledger {}", path.display()),
                    e,
                )
            })?;
        Ok(contents.lines().map(str::to_string).collect())
    }

    /// Write the new ledger to the swap sibling and rename it over the
    /// ledger path. The swap data is fsynced before the rename and the
    /// directory after it, so a completed rename survives a crash.
    fn rewrite_ledger(&self, path: &Path, swap_path: &Path, lines: &[String]) -> Result<()> {
        let res = (|| {
            let mut swap = fsutil::open_lock_file(
                swap_path,
                self.options.file_mode,
                self.options.umask,
                false,
            )?;
            swap.set_len(0)?;
            let mut payload = lines.join("\n");
            payload.push('\n');
            swap.write_all(payload.as_bytes())?;
            swap.sync_all()?;
            fs::rename(swap_path, path)?;
            if let Some(dir) = path.parent() {
                fsutil::sync_dir(dir)?;
            }
            Ok(())
        })();

        res.map_err(|e: std::io::Error| {
            let _ = fs::remove_file(swap_path);
            warn!(path = %path.display(), error = %e, "ledger rewrite failed");
            SyslockError::io_error(
                format!("Failed to rewrite lock ledger {}", path.display()),
                e,
            )
        })
    }

    /// Pure in-memory edit: drop malformed lines, our own previous entry,
    /// and (when entering or force-cleaning) entries of dead processes;
    /// compute the effective cap; append our entry when permitted.
    fn edit_contents(&self, contents: &[String], enter: bool, force_clean: bool) -> EditOutcome {
        let mut new_lines = Vec::new();
        let mut processes = HashSet::new();
        let mut max_allowed = self.max_count;

        for line in contents {
            let Some(entry) = LedgerEntry::parse(line) else {
                continue;
            };

            if entry.instance_id == self.instance_id && entry.id == self.our_id {
                continue;
            }

            if (enter || force_clean) && !entry.id.is_alive() {
                debug!(pid = entry.id.pid, "pruning stale ledger entry");
                continue;
            }

            if entry.max_count < max_allowed {
                max_allowed = entry.max_count;
            }
            new_lines.push(line.clone());
            processes.insert(entry.id);
        }

        let locked = enter && new_lines.len() < max_allowed as usize;
        if locked {
            let ours = LedgerEntry {
                id: self.our_id,
                instance_id: self.instance_id,
                max_count: self.max_count,
            };
            new_lines.push(ours.encode());
            processes.insert(self.our_id);
        }

        EditOutcome {
            new_lines,
            processes,
            max_allowed,
            locked,
        }
    }
}
