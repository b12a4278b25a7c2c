//! Low-level PTY allocation and the async master handle
//!
//! The pair is obtained straight from the multiplexer device: open it, clear the
//! slave lock, derive the slave path from the kernel-assigned number, open the slave.

use crate::PtyError;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::debug;

/// The PTY multiplexer device
pub const PTMX_PATH: &str = "/dev/ptmx";

/// A freshly allocated pseudo-terminal pair
///
/// Both descriptors are owned; dropping the pair (including on an early error path)
/// closes whatever is still held.
#[derive(Debug)]
pub struct PtyPair {
    master: OwnedFd,
    slave: OwnedFd,
    slave_path: PathBuf,
}

impl PtyPair {
    /// Allocate a new PTY pair from the system multiplexer
    pub fn allocate() -> Result<Self, PtyError> {
        Self::allocate_from(Path::new(PTMX_PATH))
    }

    /// Allocate a new PTY pair from the given multiplexer device
    ///
    /// Only Linux opens `multiplexer` itself; other systems always go through
    /// `posix_openpt`.
    pub fn allocate_from(multiplexer: &Path) -> Result<Self, PtyError> {
        let (master, slave_path) = open_master(multiplexer)?;
        let slave = open_slave(&slave_path)?;

        debug!(
            master = master.as_raw_fd(),
            slave = slave.as_raw_fd(),
            path = %slave_path.display(),
            "PTY pair allocated"
        );

        Ok(Self {
            master,
            slave,
            slave_path,
        })
    }

    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    pub fn slave(&self) -> BorrowedFd<'_> {
        self.slave.as_fd()
    }

    /// Device path of the slave side, e.g. `/dev/pts/3`
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Split into (master, slave, slave path)
    pub fn into_parts(self) -> (OwnedFd, OwnedFd, PathBuf) {
        (self.master, self.slave, self.slave_path)
    }
}

#[cfg(target_os = "linux")]
fn open_master(multiplexer: &Path) -> Result<(OwnedFd, PathBuf), PtyError> {
    let master: OwnedFd = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(multiplexer)
        .map_err(|source| PtyError::DeviceOpen {
            path: multiplexer.to_path_buf(),
            source,
        })?
        .into();

    unlock(&master).map_err(PtyError::Unlock)?;
    let slave_path = slave_path(&master).map_err(PtyError::NumberQuery)?;
    Ok((master, slave_path))
}

#[cfg(target_os = "linux")]
fn unlock(master: &OwnedFd) -> io::Result<()> {
    let unlock: libc::c_int = 0;
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCSPTLCK,
            &unlock as *const libc::c_int,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn slave_path(master: &OwnedFd) -> io::Result<PathBuf> {
    let mut number: libc::c_uint = 0;
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCGPTN,
            &mut number as *mut libc::c_uint,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PathBuf::from(format!("/dev/pts/{number}")))
}

/// `ptsname` returns a pointer into static storage.
#[cfg(not(target_os = "linux"))]
static PTSNAME_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(not(target_os = "linux"))]
fn open_master(multiplexer: &Path) -> Result<(OwnedFd, PathBuf), PtyError> {
    use nix::pty::{grantpt, posix_openpt, ptsname, unlockpt};
    use std::os::unix::io::{FromRawFd, IntoRawFd};

    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(|e| {
        PtyError::DeviceOpen {
            path: multiplexer.to_path_buf(),
            source: e.into(),
        }
    })?;

    grantpt(&master)
        .and_then(|()| unlockpt(&master))
        .map_err(|e| PtyError::Unlock(e.into()))?;

    let name = {
        let _guard = PTSNAME_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        unsafe { ptsname(&master) }
    }
    .map_err(|e| PtyError::NumberQuery(e.into()))?;

    let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
    Ok((master, PathBuf::from(name)))
}

/// Open the slave side without acquiring it as a controlling terminal
pub(crate) fn open_slave(path: &Path) -> Result<OwnedFd, PtyError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)
        .map(OwnedFd::from)
        .map_err(|source| PtyError::SlaveOpen {
            path: path.to_path_buf(),
            source,
        })
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Whether a master-side error means the slave side has been hung up.
///
/// Linux reports `EIO` on the master once every slave descriptor is closed.
pub fn is_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

/// Async wrapper for the PTY master
///
/// Reads and writes take `&self`, so one handle can be shared between the reader
/// task and the writer; the kernel serializes the two directions.
#[derive(Debug)]
pub struct AsyncPtyMaster {
    inner: AsyncFd<OwnedFd>,
}

impl AsyncPtyMaster {
    /// Register the master with the reactor. Switches it to non-blocking mode.
    pub fn new(master: OwnedFd) -> io::Result<Self> {
        set_nonblocking(master.as_raw_fd())?;
        let inner = AsyncFd::with_interest(master, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self { inner })
    }

    /// Read whatever the line discipline has routed to the master
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(inner.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write bytes into the line discipline's input side
    ///
    /// Fails with `EIO` once the slave has hung up and the input side is full, since
    /// nothing will ever drain it.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.writable().await?;
            // try_io clears the guard's readiness on WouldBlock.
            let ready = guard.ready();
            match guard.try_io(|inner| {
                let n = unsafe { libc::write(inner.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                // A hang-up stays ready forever, so waiting again would spin.
                Err(_would_block) if ready.is_write_closed() => {
                    return Err(io::Error::from_raw_os_error(libc::EIO));
                }
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// Foreground process group of the terminal's session, as seen from the master.
    ///
    /// Zero until some session has acquired the slave as its controlling terminal.
    pub fn foreground_process_group(&self) -> io::Result<Pid> {
        let pgrp = unsafe { libc::tcgetpgrp(self.as_raw_fd()) };
        if pgrp < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Pid::from_raw(pgrp))
    }

    /// Deregister from the reactor and hand back the descriptor
    pub fn into_inner(self) -> OwnedFd {
        self.inner.into_inner()
    }
}

impl AsRawFd for AsyncPtyMaster {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_allocation() {
        let pty = PtyPair::allocate().unwrap();
        assert!(pty.master().as_raw_fd() > 0);
        assert!(pty.slave().as_raw_fd() > 0);
        assert_ne!(pty.master().as_raw_fd(), pty.slave().as_raw_fd());
        assert!(pty.slave_path().exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_slave_path_follows_pty_number() {
        let pty = PtyPair::allocate().unwrap();
        let path = pty.slave_path().to_string_lossy().into_owned();
        let number = path.strip_prefix("/dev/pts/").expect("devpts path");
        assert!(number.parse::<u32>().is_ok(), "unexpected slave path {path}");
    }

    #[test]
    fn test_pairs_are_independent() {
        let first = PtyPair::allocate().unwrap();
        let second = PtyPair::allocate().unwrap();
        assert_ne!(first.slave_path(), second.slave_path());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_missing_multiplexer() {
        let err = PtyPair::allocate_from(Path::new("/nonexistent/ptmx")).unwrap_err();
        assert!(matches!(err, PtyError::DeviceOpen { .. }));
        assert!(err.is_allocation());
    }

    #[test]
    fn test_invalid_slave_path_fails_fast() {
        let err = open_slave(Path::new("/dev/pts/not-a-number")).unwrap_err();
        assert!(matches!(err, PtyError::SlaveOpen { .. }));
    }

    #[tokio::test]
    async fn test_master_sees_local_echo() {
        let (master, _slave, _) = PtyPair::allocate().unwrap().into_parts();
        let master = AsyncPtyMaster::new(master).unwrap();

        master.write_all(b"hi").await.unwrap();

        let mut echoed = Vec::new();
        let mut buf = [0u8; 16];
        while echoed.len() < 2 {
            let n = tokio::time::timeout(std::time::Duration::from_secs(2), master.read(&mut buf))
                .await
                .expect("echo within timeout")
                .unwrap();
            echoed.extend_from_slice(&buf[..n]);
        }
        assert_eq!(echoed, b"hi");
    }

    #[tokio::test]
    async fn test_write_fails_once_slave_hung_up() {
        let (master, slave, _) = PtyPair::allocate().unwrap().into_parts();
        let master = AsyncPtyMaster::new(master).unwrap();
        drop(slave);

        let chunk = [b'x'; 256];
        let err = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            for _ in 0..16 * 1024 {
                if let Err(e) = master.write_all(&chunk).await {
                    return Some(e);
                }
            }
            None
        })
        .await
        .expect("write returns instead of waiting forever")
        .expect("a hung-up slave eventually refuses input");
        assert!(is_hangup(&err), "unexpected error: {err}");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_no_foreground_group_before_attach() {
        let (master, _slave, _) = PtyPair::allocate().unwrap().into_parts();
        let master = AsyncPtyMaster::new(master).unwrap();
        assert_eq!(master.foreground_process_group().unwrap(), Pid::from_raw(0));
    }
}
