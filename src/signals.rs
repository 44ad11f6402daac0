#![allow(unsafe_code)]

use crate::error::{Result, SyslockError};
use std::io;
use std::mem;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use tracing::debug;

const QUEUE_CAP: usize = 32;

/// Fixed-capacity FIFO of recorded signal numbers.
///
/// Pushed from the signal handler, so only lock-free atomics are used.
/// Signals past the capacity are dropped.
struct DeferQueue {
    slots: [AtomicI32; QUEUE_CAP],
    len: AtomicUsize,
}

impl DeferQueue {
    const fn new() -> Self {
        Self {
            slots: [const { AtomicI32::new(0) }; QUEUE_CAP],
            len: AtomicUsize::new(0),
        }
    }

    fn push(&self, sig: i32) {
        let idx = self.len.fetch_add(1, Ordering::SeqCst);
        if idx < QUEUE_CAP {
            self.slots[idx].store(sig, Ordering::SeqCst);
        }
    }

    fn drain(&self) -> Vec<i32> {
        let count = self.len.swap(0, Ordering::SeqCst).min(QUEUE_CAP);
        (0..count)
            .map(|i| self.slots[i].swap(0, Ordering::SeqCst))
            .filter(|&sig| sig != 0)
            .collect()
    }

    fn clear(&self) {
        self.len.store(0, Ordering::SeqCst);
        for slot in &self.slots {
            slot.store(0, Ordering::SeqCst);
        }
    }
}

// Signal dispositions are process-global, so the recording queue is too.
static QUEUE: DeferQueue = DeferQueue::new();
static DEPTH: AtomicUsize = AtomicUsize::new(0);

extern "C" fn record_signal(sig: libc::c_int) {
    QUEUE.push(sig);
}

/// Scoped deferral of a set of signals.
///
/// While the region is alive, arriving signals from the set are recorded
/// instead of delivered. On drop the previous dispositions are restored
/// and the recorded signals are re-raised to the current process in FIFO
/// order. Lock implementations wrap ledger rewrites in such a region so
/// user signals cannot interrupt half-written state.
///
/// Regions nest: an inner region saves the outer region's recording
/// handler like any other disposition, so signals replayed on inner exit
/// are re-recorded by the outer region and delivered when it ends.
#[derive(Debug)]
pub struct SignalDefer {
    saved: Vec<(i32, libc::sigaction)>,
}

impl SignalDefer {
    /// Signals deferred by `new`: hangup, interrupt, terminate
    pub const DEFAULT_SIGNALS: [i32; 3] = [libc::SIGHUP, libc::SIGINT, libc::SIGTERM];

    pub fn new() -> Result<Self> {
        Self::with_signals(&Self::DEFAULT_SIGNALS)
    }

    pub fn with_signals(signals: &[i32]) -> Result<Self> {
        if DEPTH.fetch_add(1, Ordering::SeqCst) == 0 {
            QUEUE.clear();
        }

        let mut region = Self { saved: Vec::new() };
        for &sig in signals {
            match install_recorder(sig) {
                Ok(old) => region.saved.push((sig, old)),
                Err(e) => {
                    // Roll back the handlers installed so far; the drop of
                    // `region` rebalances the nesting depth.
                    region.restore_handlers();
                    region.saved.clear();
                    return Err(SyslockError::io_error(
                        format!("Failed to install deferral handler for signal {sig}"),
                        e,
                    ));
                }
            }
        }
        Ok(region)
    }

    /// Mid-region drain point: temporarily restore the previous handlers,
    /// replay any queued signals, then resume deferring.
    pub fn drain(&mut self) -> Result<()> {
        self.restore_handlers();
        replay_queued();
        for i in 0..self.saved.len() {
            let sig = self.saved[i].0;
            match install_recorder(sig) {
                Ok(old) => self.saved[i].1 = old,
                Err(e) => {
                    return Err(SyslockError::io_error(
                        format!("Failed to re-install deferral handler for signal {sig}"),
                        e,
                    ));
                }
            }
        }
        Ok(())
    }

    fn restore_handlers(&self) {
        for (sig, old) in self.saved.iter().rev() {
            unsafe {
                libc::sigaction(*sig, old, std::ptr::null_mut());
            }
        }
    }
}

impl Drop for SignalDefer {
    fn drop(&mut self) {
        self.restore_handlers();
        replay_queued();
        DEPTH.fetch_sub(1, Ordering::SeqCst);
    }
}

fn install_recorder(sig: i32) -> io::Result<libc::sigaction> {
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = record_signal as usize;
    action.sa_flags = libc::SA_RESTART;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }
    let mut old: libc::sigaction = unsafe { mem::zeroed() };
    let rc = unsafe { libc::sigaction(sig, &action, &mut old) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(old)
}

fn replay_queued() {
    for sig in QUEUE.drain() {
        debug!(signal = sig, "re-raising deferred signal");
        unsafe {
            libc::raise(sig);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    static RECEIVED: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn counting_handler(_sig: libc::c_int) {
        RECEIVED.fetch_add(1, Ordering::SeqCst);
    }

    fn install_counter(sig: i32) -> libc::sigaction {
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = counting_handler as usize;
        action.sa_flags = libc::SA_RESTART;
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
        }
        let mut old: libc::sigaction = unsafe { mem::zeroed() };
        assert_eq!(unsafe { libc::sigaction(sig, &action, &mut old) }, 0);
        old
    }

    fn restore(sig: i32, old: &libc::sigaction) {
        unsafe {
            libc::sigaction(sig, old, std::ptr::null_mut());
        }
    }

    #[test]
    #[serial]
    fn test_signals_deferred_and_replayed() {
        RECEIVED.store(0, Ordering::SeqCst);
        let old = install_counter(libc::SIGUSR1);

        {
            let defer = SignalDefer::with_signals(&[libc::SIGUSR1]).unwrap();
            unsafe {
                libc::raise(libc::SIGUSR1);
            }
            // Recorded, not delivered to the outer handler
            assert_eq!(RECEIVED.load(Ordering::SeqCst), 0);
            drop(defer);
        }

        // Replayed into the restored outer handler on region exit
        assert_eq!(RECEIVED.load(Ordering::SeqCst), 1);
        restore(libc::SIGUSR1, &old);
    }

    #[test]
    #[serial]
    fn test_drain_replays_mid_region() {
        RECEIVED.store(0, Ordering::SeqCst);
        let old = install_counter(libc::SIGUSR1);

        let mut defer = SignalDefer::with_signals(&[libc::SIGUSR1]).unwrap();
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        assert_eq!(RECEIVED.load(Ordering::SeqCst), 0);

        defer.drain().unwrap();
        assert_eq!(RECEIVED.load(Ordering::SeqCst), 1);

        // Still deferring after the drain point
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        assert_eq!(RECEIVED.load(Ordering::SeqCst), 1);
        drop(defer);
        assert_eq!(RECEIVED.load(Ordering::SeqCst), 2);

        restore(libc::SIGUSR1, &old);
    }

    #[test]
    #[serial]
    fn test_nested_regions_chain() {
        RECEIVED.store(0, Ordering::SeqCst);
        let old = install_counter(libc::SIGUSR2);

        let outer = SignalDefer::with_signals(&[libc::SIGUSR2]).unwrap();
        {
            let inner = SignalDefer::with_signals(&[libc::SIGUSR2]).unwrap();
            unsafe {
                libc::raise(libc::SIGUSR2);
            }
            assert_eq!(RECEIVED.load(Ordering::SeqCst), 0);
            drop(inner);
        }
        // The inner replay lands in the still-active outer region
        assert_eq!(RECEIVED.load(Ordering::SeqCst), 0);

        drop(outer);
        assert_eq!(RECEIVED.load(Ordering::SeqCst), 1);
        restore(libc::SIGUSR2, &old);
    }

    #[test]
    #[serial]
    fn test_fifo_replay_order() {
        QUEUE.clear();
        QUEUE.push(libc::SIGUSR1);
        QUEUE.push(libc::SIGUSR2);
        QUEUE.push(libc::SIGUSR1);
        assert_eq!(
            QUEUE.drain(),
            vec![libc::SIGUSR1, libc::SIGUSR2, libc::SIGUSR1]
        );
        assert!(QUEUE.drain().is_empty());
    }
}
