#![allow(unsafe_code)]

use crate::error::{Result, SyslockError};
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::OnceLock;

/// Compound process identity: a PID plus the process creation time.
///
/// The creation time disambiguates PID reuse. Some environments cannot
/// report it, so equality is tolerant: identities match when the PIDs
/// match and either both creation times agree or at least one side is
/// missing. A stored creation time of zero counts as missing.
#[derive(Debug, Clone, Copy)]
pub struct ProcessIdentity {
    /// Process identifier (PID)
    pub pid: u32,
    /// Process creation time in milliseconds since the epoch, if known
    pub ctime_ms: Option<u64>,
}

impl ProcessIdentity {
    /// Resolve the identity of a live process from its PID.
    ///
    /// Fails when no such process exists. When the process is alive but
    /// its creation time cannot be read, the identity carries
    /// `ctime_ms: None`.
    pub fn from_pid(pid: u32) -> Result<Self> {
        match creation_time_ms(pid) {
            Ok(ctime_ms) => Ok(Self {
                pid,
                ctime_ms: Some(ctime_ms),
            }),
            Err(e) => {
                if kill0_alive(pid) {
                    Ok(Self { pid, ctime_ms: None })
                } else {
                    Err(SyslockError::io_error(
                        format!("Failed to retrieve identity for PID {pid}"),
                        e,
                    ))
                }
            }
        }
    }

    /// Identity of the current process, computed once and cached.
    pub fn ours() -> Result<Self> {
        static OURS: OnceLock<ProcessIdentity> = OnceLock::new();
        if let Some(id) = OURS.get() {
            return Ok(*id);
        }
        let id = Self::from_pid(std::process::id())?;
        Ok(*OURS.get_or_init(|| id))
    }

    /// Whether the process this identity refers to is still alive.
    ///
    /// Equivalent to `from_pid(self.pid) == *self`; false on any OS error.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        Self::from_pid(self.pid).map(|cur| cur == *self).unwrap_or(false)
    }

    /// Creation time with zero normalised to missing
    fn ctime(&self) -> Option<u64> {
        match self.ctime_ms {
            Some(0) | None => None,
            other => other,
        }
    }
}

impl PartialEq for ProcessIdentity {
    fn eq(&self, other: &Self) -> bool {
        if self.pid != other.pid {
            return false;
        }
        match (self.ctime(), other.ctime()) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl Eq for ProcessIdentity {}

impl Hash for ProcessIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // The tolerant equality means the creation time cannot take part
        // in the hash without breaking the Hash/Eq contract.
        self.pid.hash(state);
    }
}

/// Null-signal existence probe; EPERM means the process exists but is
/// owned by someone else.
fn kill0_alive(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(target_os = "linux")]
fn creation_time_ms(pid: u32) -> io::Result<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;

    // Field 22 is the start time in clock ticks since boot. The comm
    // field may itself contain spaces and parentheses, so split after
    // the last ')'.
    let after_comm = stat
        .rfind(')')
        .map(|idx| &stat[idx + 1..])
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed /proc stat line"))?;
    let start_ticks: u64 = after_comm
        .split_whitespace()
        .nth(19)
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing process start time"))?;

    let ticks_per_sec = clock_ticks_per_sec()?;
    Ok(boot_time_secs()? * 1000 + start_ticks * 1000 / ticks_per_sec)
}

#[cfg(not(target_os = "linux"))]
fn creation_time_ms(_pid: u32) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process creation time unavailable on this platform",
    ))
}

#[cfg(target_os = "linux")]
fn boot_time_secs() -> io::Result<u64> {
    static BTIME: OnceLock<Option<u64>> = OnceLock::new();
    let btime = *BTIME.get_or_init(|| {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        stat.lines()
            .find_map(|line| line.strip_prefix("btime "))
            .and_then(|rest| rest.trim().parse().ok())
    });
    btime.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no btime in /proc/stat"))
}

#[cfg(target_os = "linux")]
fn clock_ticks_per_sec() -> io::Result<u64> {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "sysconf(_SC_CLK_TCK) failed",
        ));
    }
    Ok(ticks as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ours_is_alive() {
        let ours = ProcessIdentity::ours().unwrap();
        assert_eq!(ours.pid, std::process::id());
        assert!(ours.is_alive());
        // Cached value is stable
        assert_eq!(ProcessIdentity::ours().unwrap(), ours);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_ours_has_creation_time() {
        let ours = ProcessIdentity::ours().unwrap();
        assert!(ours.ctime_ms.unwrap() > 0);
    }

    #[test]
    fn test_from_pid_absent_process() {
        // PID far above any default pid_max
        assert!(ProcessIdentity::from_pid(999_999_999).is_err());
    }

    #[test]
    fn test_tolerant_equality() {
        let with_ctime = ProcessIdentity {
            pid: 42,
            ctime_ms: Some(1000),
        };
        let other_ctime = ProcessIdentity {
            pid: 42,
            ctime_ms: Some(2000),
        };
        let no_ctime = ProcessIdentity {
            pid: 42,
            ctime_ms: None,
        };
        let zero_ctime = ProcessIdentity {
            pid: 42,
            ctime_ms: Some(0),
        };
        let other_pid = ProcessIdentity {
            pid: 43,
            ctime_ms: Some(1000),
        };

        assert_eq!(with_ctime, no_ctime);
        assert_eq!(with_ctime, zero_ctime);
        assert_ne!(with_ctime, other_ctime);
        assert_ne!(with_ctime, other_pid);
        assert_ne!(no_ctime, other_pid);
    }

    #[test]
    fn test_equal_identities_hash_equal() {
        let a = ProcessIdentity {
            pid: 7,
            ctime_ms: Some(1234),
        };
        let b = ProcessIdentity {
            pid: 7,
            ctime_ms: None,
        };

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        set.insert(b);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_stale_identity_not_alive() {
        let ours = ProcessIdentity::ours().unwrap();
        if let Some(ctime) = ours.ctime_ms {
            let stale = ProcessIdentity {
                pid: ours.pid,
                ctime_ms: Some(ctime + 1),
            };
            assert!(!stale.is_alive());
        }
    }
}
