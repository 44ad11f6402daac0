use crate::error::{Result, SyslockError};
use crate::fsutil;
use fs2::FileExt;
use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Advisory lock on a filesystem path.
///
/// Holding the lock means two things at once: the descriptor holds an
/// advisory `flock` (shared or exclusive), and the descriptor's inode is
/// the inode the path currently names. The second condition can be
/// violated after acquisition by a peer that unlinked and recreated the
/// file between our open and our lock; such a lock is *stolen* and must
/// be re-acquired against the fresh file.
#[derive(Debug)]
pub(crate) struct LockFile {
    path: PathBuf,
    file_mode: u32,
    umask: Option<u32>,
    dsync: bool,
    file: Option<File>,
    held_shared: bool,
}

impl LockFile {
    pub fn new(path: PathBuf, file_mode: u32, umask: Option<u32>, dsync: bool) -> Self {
        Self {
            path,
            file_mode,
            umask,
            dsync,
            file: None,
            held_shared: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn is_held(&self) -> bool {
        self.file.is_some()
    }

    pub const fn held_shared(&self) -> bool {
        self.held_shared
    }

    pub const fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    /// Acquire the advisory lock, surviving deletion races.
    ///
    /// With `blocking` the flock syscall itself blocks; otherwise lock
    /// attempts poll every `check_interval` against the deadline
    /// `start + timeout`. After each successful flock the inode identity
    /// is verified; a stolen lock is dropped and re-acquired. `action`
    /// names the operation in timeout errors.
    pub fn acquire(
        &mut self,
        action: &str,
        shared: bool,
        blocking: bool,
        timeout: Duration,
        check_interval: Duration,
    ) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }

        let deadline = if blocking {
            None
        } else {
            Some(Instant::now() + timeout)
        };

        loop {
            let file = fsutil::open_lock_file(&self.path, self.file_mode, self.umask, self.dsync)
                .map_err(|e| {
                    SyslockError::io_error(
                        format!("Failed to open lock file {}", self.path.display()),
                        e,
                    )
                })?;

            self.lock_descriptor(action, &file, shared, deadline, check_interval)?;

            if descriptor_matches_path(&file, &self.path) {
                self.file = Some(file);
                self.held_shared = shared;
                return Ok(());
            }

            // The path was unlinked/recreated since we opened it: we hold
            // a lock on an orphaned inode that no longer guards the path.
            debug!(path = %self.path.display(), "lock file replaced during acquisition, retrying");
            let _ = file.unlock();
            drop(file);

            thread::sleep(check_interval);
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(SyslockError::timeout(action, &self.path));
                }
            }
        }
    }

    fn lock_descriptor(
        &self,
        action: &str,
        file: &File,
        shared: bool,
        deadline: Option<Instant>,
        check_interval: Duration,
    ) -> Result<()> {
        let Some(deadline) = deadline else {
            let res = if shared {
                file.lock_shared()
            } else {
                file.lock_exclusive()
            };
            return res.map_err(|e| {
                SyslockError::io_error(
                    format!("Failed to lock {}", self.path.display()),
                    e,
                )
            });
        };

        let contended = fs2::lock_contended_error().raw_os_error();
        loop {
            let res = if shared {
                fs2::FileExt::try_lock_shared(file)
            } else {
                fs2::FileExt::try_lock_exclusive(file)
            };
            match res {
                Ok(()) => return Ok(()),
                Err(e) if e.raw_os_error() == contended => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SyslockError::timeout(action, &self.path));
                    }
                    thread::sleep(check_interval.min(deadline - now));
                }
                Err(e) => {
                    return Err(SyslockError::io_error(
                        format!("Failed to lock {}", self.path.display()),
                        e,
                    ));
                }
            }
        }
    }

    /// Release the lock, optionally unlinking the path first.
    ///
    /// Unlinking is only safe while the lock is still held; the path
    /// stays guarded until the descriptor closes. Both the unlink and
    /// the unlock are best-effort.
    pub fn release(&mut self, unlink: bool) {
        let Some(file) = self.file.take() else {
            return;
        };
        if unlink {
            let _ = fs::remove_file(&self.path);
        }
        let _ = file.unlock();
        self.held_shared = false;
    }

    /// Non-blocking probe: acquire and immediately release.
    ///
    /// An exclusive probe unlinks the file before releasing, which is
    /// safe under the momentarily held lock.
    pub fn probe(&mut self, shared: bool) -> Result<bool> {
        if self.file.is_some() {
            return Ok(true);
        }

        let file = fsutil::open_lock_file(&self.path, self.file_mode, self.umask, self.dsync)
            .map_err(|e| {
                SyslockError::io_error(
                    format!("Failed to open lock file {}", self.path.display()),
                    e,
                )
            })?;

        let res = if shared {
            fs2::FileExt::try_lock_shared(&file)
        } else {
            fs2::FileExt::try_lock_exclusive(&file)
        };
        match res {
            Ok(()) => {
                if !shared {
                    let _ = fs::remove_file(&self.path);
                }
                let _ = file.unlock();
                Ok(true)
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(false),
            Err(e) => Err(SyslockError::io_error(
                format!("Failed to probe lock {}", self.path.display()),
                e,
            )),
        }
    }

    /// Acquire then immediately release, to wake waiters or wait out a
    /// current holder.
    pub fn touch(
        &mut self,
        shared: bool,
        blocking: bool,
        timeout: Duration,
        check_interval: Duration,
    ) -> Result<()> {
        self.acquire("touching", shared, blocking, timeout, check_interval)?;
        self.release(!shared);
        Ok(())
    }
}

/// True iff the descriptor's inode is the inode the path names now
fn descriptor_matches_path(file: &File, path: &Path) -> bool {
    let Ok(fd_meta) = file.metadata() else {
        return false;
    };
    match fs::metadata(path) {
        Ok(path_meta) => path_meta.ino() == fd_meta.ino(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const INTERVAL: Duration = Duration::from_millis(20);

    #[test]
    fn test_acquire_verifies_inode() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.lock");

        let mut lock = LockFile::new(path.clone(), 0o666, None, false);
        lock.acquire("acquiring", false, false, Duration::from_secs(1), INTERVAL)
            .unwrap();
        assert!(lock.is_held());

        let held_ino = lock.file().unwrap().metadata().unwrap().ino();
        assert_eq!(held_ino, fs::metadata(&path).unwrap().ino());

        lock.release(true);
        assert!(!lock.is_held());
        assert!(!path.exists());
    }

    #[test]
    fn test_exclusive_excludes_second_handle() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.lock");

        let mut first = LockFile::new(path.clone(), 0o666, None, false);
        first
            .acquire("acquiring", false, false, Duration::from_secs(1), INTERVAL)
            .unwrap();

        // flock is per open file description, so a second handle in the
        // same process contends like a foreign process would.
        let mut second = LockFile::new(path.clone(), 0o666, None, false);
        let err = second
            .acquire("acquiring", false, false, Duration::from_millis(100), INTERVAL)
            .unwrap_err();
        assert!(err.is_timeout());

        first.release(true);
        second
            .acquire("acquiring", false, false, Duration::from_secs(1), INTERVAL)
            .unwrap();
        second.release(true);
    }

    #[test]
    fn test_shared_handles_coexist() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.lock");

        let mut first = LockFile::new(path.clone(), 0o666, None, false);
        let mut second = LockFile::new(path.clone(), 0o666, None, false);
        first
            .acquire("acquiring", true, false, Duration::from_secs(1), INTERVAL)
            .unwrap();
        second
            .acquire("acquiring", true, false, Duration::from_secs(1), INTERVAL)
            .unwrap();
        assert!(first.held_shared() && second.held_shared());

        // An exclusive probe fails while shared holders exist
        let mut probe = LockFile::new(path.clone(), 0o666, None, false);
        assert!(!probe.probe(false).unwrap());
        assert!(probe.probe(true).unwrap());

        first.release(false);
        second.release(false);
    }

    #[test]
    fn test_probe_exclusive_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.lock");

        let mut probe = LockFile::new(path.clone(), 0o666, None, false);
        assert!(probe.probe(false).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_touch_waits_for_holder() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.lock");

        let mut holder = LockFile::new(path.clone(), 0o666, None, false);
        holder
            .acquire("acquiring", false, false, Duration::from_secs(1), INTERVAL)
            .unwrap();

        let mut toucher = LockFile::new(path.clone(), 0o666, None, false);
        let err = toucher
            .touch(true, false, Duration::from_millis(100), INTERVAL)
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("touching"));

        holder.release(true);
        toucher
            .touch(true, false, Duration::from_secs(1), INTERVAL)
            .unwrap();
        assert!(!toucher.is_held());
    }
}
