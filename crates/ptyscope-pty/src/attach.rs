//! Controlling-terminal attachment for the forked child
//!
//! Everything here runs between `fork` and `exec` in a process that may have been
//! forked from a multi-threaded parent, so only async-signal-safe calls are made: no
//! allocation, no locks, no tracing.

use crate::child::ChildFailure;
use nix::errno::Errno;
use nix::unistd::{dup2, setsid};
use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd};

/// A child-side setup step that failed, with the errno it failed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupError {
    pub failure: ChildFailure,
    pub errno: Errno,
}

impl SetupError {
    pub fn new(failure: ChildFailure, errno: Errno) -> Self {
        Self { failure, errno }
    }

    /// Classify a failed `exec`
    pub fn exec(errno: Errno) -> Self {
        let failure = match errno {
            Errno::ENOENT | Errno::ENOTDIR => ChildFailure::NotFound,
            _ => ChildFailure::NotExecutable,
        };
        Self { failure, errno }
    }
}

/// Make `slave` the controlling terminal of a fresh session and rebind stdio to it.
///
/// On success the calling process leads a new session and process group, the slave
/// is that session's controlling terminal with the caller's group in the foreground
/// (so the interrupt character signals it), and fds 0, 1 and 2 all refer to the slave.
pub fn attach(slave: OwnedFd) -> Result<(), SetupError> {
    // A process can only acquire a controlling terminal while it has none.
    setsid().map_err(|e| SetupError::new(ChildFailure::NewSession, e))?;

    let fd = slave.as_raw_fd();
    if unsafe { libc::ioctl(fd, libc::TIOCSCTTY as _, 0 as libc::c_int) } < 0 {
        return Err(SetupError::new(
            ChildFailure::ControllingTerminal,
            Errno::last(),
        ));
    }

    for target in [
        libc::STDIN_FILENO,
        libc::STDOUT_FILENO,
        libc::STDERR_FILENO,
    ] {
        if fd != target {
            dup2(fd, target).map_err(|e| SetupError::new(ChildFailure::Redirect, e))?;
        }
    }

    if fd <= libc::STDERR_FILENO {
        // Already one of the standard streams; keep it open.
        let _ = slave.into_raw_fd();
    }
    Ok(())
}

/// Report a child-side setup failure on stderr and terminate the child branch.
pub fn abort_child(err: SetupError) -> ! {
    let parts: [&[u8]; 5] = [
        b"ptyscope: child ",
        err.failure.stage().as_bytes(),
        b" failed: ",
        err.errno.desc().as_bytes(),
        b"\n",
    ];
    for part in parts {
        unsafe {
            libc::write(libc::STDERR_FILENO, part.as_ptr().cast(), part.len());
        }
    }
    unsafe { libc::_exit(err.failure.exit_code()) }
}
