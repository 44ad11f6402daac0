#![allow(unsafe_code)]

use std::fs::{DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

/// Scoped change of the process umask; the previous mask is restored on
/// drop. `None` leaves the current umask untouched.
#[derive(Debug)]
pub(crate) struct UmaskGuard {
    prev: Option<libc::mode_t>,
}

impl UmaskGuard {
    pub fn set(umask: Option<u32>) -> Self {
        let prev = umask.map(|mask| unsafe { libc::umask(mask as libc::mode_t) });
        Self { prev }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.prev {
            unsafe {
                libc::umask(prev);
            }
        }
    }
}

/// Recursively create the parent directory of a lock path with the given
/// creation mode, under a temporary umask.
pub(crate) fn create_lock_dir(lock_path: &Path, dir_mode: u32, umask: Option<u32>) -> io::Result<()> {
    let Some(dir) = lock_path.parent() else {
        return Ok(());
    };
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    let _umask = UmaskGuard::set(umask);
    DirBuilder::new().recursive(true).mode(dir_mode).create(dir)
}

/// Open (creating if absent) a lock file with the given creation mode,
/// under a temporary umask. `dsync` adds `O_DSYNC` so payload writes are
/// durable before the lock is released.
pub(crate) fn open_lock_file(
    path: &Path,
    file_mode: u32,
    umask: Option<u32>,
    dsync: bool,
) -> io::Result<File> {
    let _umask = UmaskGuard::set(umask);
    let mut options = OpenOptions::new();
    options
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(file_mode);
    if dsync {
        options.custom_flags(libc::O_DSYNC);
    }
    options.open(path)
}

/// Flush a directory so that a completed rename within it survives a crash
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Coerce a string into a legal unix filename with minimal changes:
/// '/' becomes '_', NUL bytes are dropped, the result is capped at 255
/// bytes, and the reserved names "." / ".." / "" are replaced.
#[must_use]
pub fn ensure_filename(name: &str) -> String {
    let mut out: String = name
        .chars()
        .filter(|&c| c != '\0')
        .map(|c| if c == '/' { '_' } else { c })
        .collect();
    if out.len() > 255 {
        let mut end = 255;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
    }
    if out == "." || out == ".." {
        out = "...".to_string();
    }
    if out.is_empty() {
        out = "_".to_string();
    }
    out
}

/// Resolve a lock name to its path under the named-lock directory
#[must_use]
pub fn named_lock_path(lock_name: &str, relative_to: &Path) -> PathBuf {
    relative_to
        .join("named")
        .join(ensure_filename(&format!("{lock_name}.lock")))
}
