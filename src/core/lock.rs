//! Component C — Lock Manager.
//!
//! Two independent layers guard a bus device, and the ordering between
//! them is load-bearing (spec §4.C): the in-process lock is always
//! acquired first, and the advisory whole-file `flock` second. Releasing
//! happens in reverse. Getting this backwards is how two threads in the
//! same process can deadlock against a second process doing the same
//! thing in the opposite order.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use nix::fcntl::{flock, FlockArg};

use crate::core::error::{HotplugError, Result};

/// Per-busno mutex state. A plain `Mutex<bool>` held for the guard's
/// lifetime would do, but callers need both a non-blocking attempt and a
/// bounded wait, which `std::sync::Mutex` alone cannot express — hence
/// the explicit held-flag plus condvar, mirroring a wait-queue.
struct BusLock {
    held: Mutex<bool>,
    cv: Condvar,
}

impl BusLock {
    fn new() -> Self {
        BusLock {
            held: Mutex::new(false),
            cv: Condvar::new(),
        }
    }
}

/// Process-wide table of per-bus in-process locks (component C, spec §4.C).
///
/// One [`LockManager`] is meant to be shared (behind an `Arc`) by every
/// collaborator in a process — the registry, the watcher, and anything
/// calling [`crate::core::gateway::BusHandle::open`] directly.
pub struct LockManager {
    buses: Mutex<HashMap<i32, Arc<BusLock>>>,
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            buses: Mutex::new(HashMap::new()),
        }
    }

    fn bus_lock(&self, busno: i32) -> Arc<BusLock> {
        self.buses
            .lock()
            .unwrap()
            .entry(busno)
            .or_insert_with(|| Arc::new(BusLock::new()))
            .clone()
    }

    /// Acquires the in-process lock for `busno` immediately, failing with
    /// [`HotplugError::Locked`] if another holder already has it.
    pub fn acquire_no_wait(&self, busno: i32) -> Result<InProcessGuard> {
        let lock = self.bus_lock(busno);
        let mut held = lock.held.lock().unwrap();
        if *held {
            return Err(HotplugError::Locked(busno));
        }
        *held = true;
        drop(held);
        Ok(InProcessGuard { lock, busno })
    }

    /// Acquires the in-process lock for `busno`, waiting up to `timeout`
    /// for the current holder to release it.
    pub fn acquire_wait(&self, busno: i32, timeout: Duration) -> Result<InProcessGuard> {
        let lock = self.bus_lock(busno);
        let deadline = Instant::now() + timeout;
        let mut held = lock.held.lock().unwrap();
        while *held {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HotplugError::Locked(busno));
            }
            let (guard, timed_out) = lock.cv.wait_timeout(held, remaining).unwrap();
            held = guard;
            if timed_out.timed_out() && *held {
                return Err(HotplugError::Locked(busno));
            }
        }
        *held = true;
        drop(held);
        Ok(InProcessGuard { lock, busno })
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a bus's in-process lock until dropped.
pub struct InProcessGuard {
    lock: Arc<BusLock>,
    busno: i32,
}

impl InProcessGuard {
    pub fn busno(&self) -> i32 {
        self.busno
    }
}

impl Drop for InProcessGuard {
    fn drop(&mut self) {
        *self.lock.held.lock().unwrap() = false;
        self.lock.cv.notify_one();
    }
}

/// Holds the advisory whole-file `flock(2)` until dropped. Release is
/// unconditional: an error unlocking on drop is logged, never propagated,
/// since the OS releases the lock anyway when the descriptor closes.
pub struct FileLockGuard {
    fd: i32,
    busno: i32,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = flock(self.fd, FlockArg::Unlock) {
            log::debug!("unlocking bus {}: {e}", self.busno);
        }
    }
}

/// Attempts `flock(LOCK_EX | LOCK_NB)` on `file`, retrying every
/// `poll_interval` until `max_wait` elapses (spec §4.C).
pub fn flock_acquire(
    file: &File,
    busno: i32,
    poll_interval: Duration,
    max_wait: Duration,
) -> Result<FileLockGuard> {
    let fd = file.as_raw_fd();
    let deadline = Instant::now() + max_wait;
    loop {
        match flock(fd, FlockArg::LockExclusiveNonblock) {
            Ok(()) => return Ok(FileLockGuard { fd, busno }),
            Err(nix::errno::Errno::EWOULDBLOCK) => {
                if Instant::now() >= deadline {
                    return Err(HotplugError::Flocked(busno));
                }
                std::thread::sleep(poll_interval);
            }
            Err(e) => return Err(HotplugError::io(busno, "flock", e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;

    #[test]
    fn no_wait_fails_when_held() {
        let mgr = LockManager::new();
        let _g1 = mgr.acquire_no_wait(3).unwrap();
        assert!(matches!(mgr.acquire_no_wait(3), Err(HotplugError::Locked(3))));
    }

    #[test]
    fn release_unblocks_waiter() {
        let mgr = StdArc::new(LockManager::new());
        let g1 = mgr.acquire_no_wait(7).unwrap();
        let mgr2 = mgr.clone();
        let handle = thread::spawn(move || mgr2.acquire_wait(7, Duration::from_millis(500)).is_ok());
        thread::sleep(Duration::from_millis(50));
        drop(g1);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn distinct_buses_do_not_contend() {
        let mgr = LockManager::new();
        let _g1 = mgr.acquire_no_wait(1).unwrap();
        assert!(mgr.acquire_no_wait(2).is_ok());
    }

    #[test]
    fn wait_times_out_when_never_released() {
        let mgr = StdArc::new(LockManager::new());
        let _g1 = mgr.acquire_no_wait(9).unwrap();
        let start = Instant::now();
        let err = mgr.acquire_wait(9, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, HotplugError::Locked(9)));
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
