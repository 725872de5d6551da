//! Advisory record locks and the signal-blocking critical section.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use log::error;

use crate::{Error, Result};

fn record(kind: libc::c_int, offset: u64, len: u64) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind as _;
    fl.l_whence = libc::SEEK_SET as _;
    fl.l_start = offset as libc::off_t;
    fl.l_len = len as libc::off_t;
    fl
}

/// Pid holding a lock that conflicts with `[offset, offset + len)`.
pub(crate) fn conflicting_pid(file: &File, offset: u64, len: u64, write: bool) -> Option<i32> {
    let kind = if write { libc::F_WRLCK } else { libc::F_RDLCK };
    let mut fl = record(kind, offset, len);
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETLK, &mut fl) };
    if rc == -1 || fl.l_type as libc::c_int == libc::F_UNLCK {
        return None;
    }
    Some(fl.l_pid as i32)
}

/// Locks a byte range. Without `wait` a conflicting lock yields
/// `Error::Locked`.
pub(crate) fn lock_range(
    file: &File,
    offset: u64,
    len: u64,
    write: bool,
    wait: bool,
) -> Result<()> {
    let kind = if write { libc::F_WRLCK } else { libc::F_RDLCK };
    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
    let fl = record(kind, offset, len);
    loop {
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) if wait => continue,
            Some(code) if !wait && (code == libc::EAGAIN || code == libc::EACCES) => {
                return Err(Error::Locked);
            }
            Some(libc::EDEADLK) => {
                match conflicting_pid(file, offset, len, write) {
                    Some(pid) => error!(
                        "deadlock locking [{offset}, +{len}) against pid {pid}"
                    ),
                    None => error!("deadlock locking [{offset}, +{len})"),
                }
                return Err(Error::Io(err));
            }
            _ => {
                error!("fcntl lock [{offset}, +{len}) failed: {err}");
                return Err(Error::Io(err));
            }
        }
    }
}

pub(crate) fn unlock_range(file: &File, offset: u64, len: u64) -> Result<()> {
    let fl = record(libc::F_UNLCK, offset, len);
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        error!("fcntl unlock [{offset}, +{len}) failed: {err}");
        return Err(Error::Io(err));
    }
    Ok(())
}

/// Blocks asynchronous signals while the control block is being modified.
/// Synchronous fault signals stay deliverable. Dropping restores the mask.
pub(crate) struct SignalGuard {
    previous: libc::sigset_t,
}

impl SignalGuard {
    pub(crate) fn block() -> Result<Self> {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigfillset(&mut set);
            for sig in [
                libc::SIGABRT,
                libc::SIGFPE,
                libc::SIGILL,
                libc::SIGSEGV,
                libc::SIGBUS,
            ] {
                libc::sigdelset(&mut set, sig);
            }
            let mut previous: libc::sigset_t = std::mem::zeroed();
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous);
            if rc != 0 {
                return Err(Error::Io(std::io::Error::from_raw_os_error(rc)));
            }
            Ok(Self { previous })
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        let rc = unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut())
        };
        if rc != 0 {
            error!(
                "restoring signal mask failed: {}",
                std::io::Error::from_raw_os_error(rc)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_unlock_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(dir.path().join("lock"))
            .expect("open");
        file.set_len(4096).expect("set_len");
        lock_range(&file, 0, 512, true, false).expect("lock");
        // Own locks never conflict within one process.
        assert_eq!(conflicting_pid(&file, 0, 512, true), None);
        unlock_range(&file, 0, 512).expect("unlock");
    }

    #[test]
    fn signal_guard_restores_mask() {
        let read_mask = || unsafe {
            let mut current: libc::sigset_t = std::mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut current);
            libc::sigismember(&current, libc::SIGUSR1)
        };
        assert_eq!(read_mask(), 0);
        {
            let _guard = SignalGuard::block().expect("block");
            assert_eq!(read_mask(), 1);
        }
        assert_eq!(read_mask(), 0);
    }
}
