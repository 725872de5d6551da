//! Waiting for new products.
//!
//! Inserting processes send SIGCONT to their process group; readers park
//! in `suspend` until it arrives or the timeout passes.

use std::time::Duration;

use log::debug;

use crate::Result;

/// Why `suspend` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// A SIGCONT arrived.
    Notified,
    TimedOut,
    /// A handler for one of the unblocked signals ran.
    Interrupted,
}

/// Signals readers in the process group that a product was inserted.
pub fn notify_waiters() {
    let rc = unsafe { libc::kill(0, libc::SIGCONT) };
    if rc != 0 {
        debug!(
            "notifying waiters failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// SIGCONT blocked on this thread. Block before checking the queue for
/// new products, then `wait`, so a notification sent in between is not
/// lost. Dropping restores the previous mask.
pub struct SuspendGuard {
    previous: libc::sigset_t,
}

impl SuspendGuard {
    pub fn block() -> Result<Self> {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGCONT);
            let mut previous: libc::sigset_t = std::mem::zeroed();
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous);
            if rc != 0 {
                return Err(crate::Error::Io(std::io::Error::from_raw_os_error(rc)));
            }
            Ok(Self { previous })
        }
    }

    /// Waits up to `max` for SIGCONT. Handlers of the `unblock` signals
    /// may run during the wait and end it early.
    #[cfg(target_os = "linux")]
    pub fn wait(self, max: Duration, unblock: &[i32]) -> Result<Wakeup> {
        use libc::{sigset_t, timespec, EAGAIN, EINTR, SIGCONT};

        unsafe {
            if !unblock.is_empty() {
                let mut open: sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut open);
                for &sig in unblock {
                    libc::sigaddset(&mut open, sig);
                }
                libc::pthread_sigmask(libc::SIG_UNBLOCK, &open, std::ptr::null_mut());
            }
            let mut wait_set: sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut wait_set);
            libc::sigaddset(&mut wait_set, SIGCONT);
            let ts = timespec {
                tv_sec: max.as_secs() as libc::time_t,
                tv_nsec: max.subsec_nanos() as libc::c_long,
            };
            let res = libc::sigtimedwait(&wait_set, std::ptr::null_mut(), &ts);
            if res == SIGCONT {
                return Ok(Wakeup::Notified);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(EAGAIN) => Ok(Wakeup::TimedOut),
                Some(EINTR) => Ok(Wakeup::Interrupted),
                _ => Err(crate::Error::Io(err)),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn wait(self, max: Duration, _unblock: &[i32]) -> Result<Wakeup> {
        std::thread::sleep(max);
        Ok(Wakeup::TimedOut)
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        let rc = unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut())
        };
        if rc != 0 {
            debug!(
                "restoring signal mask failed: {}",
                std::io::Error::from_raw_os_error(rc)
            );
        }
    }
}

/// Waits up to `max` for an insert notification.
pub fn suspend(max: Duration) -> Result<Wakeup> {
    SuspendGuard::block()?.wait(max, &[])
}

/// Like `suspend`, but handlers of `unblock` signals may end the wait.
pub fn suspend_and_unblock(max: Duration, unblock: &[i32]) -> Result<Wakeup> {
    SuspendGuard::block()?.wait(max, unblock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_returns_within_timeout() {
        // Concurrent tests may insert and notify the process group.
        let wakeup = suspend(Duration::from_millis(20)).expect("suspend");
        assert_ne!(wakeup, Wakeup::Interrupted);
    }
}
