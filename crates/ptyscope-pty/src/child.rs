//! Launching the target program on the slave side and reaping it

use crate::attach::{abort_child, attach, SetupError};
use crate::pty::PtyPair;
use crate::PtyError;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::ffi::{CStr, CString, OsStr};
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::OwnedFd;
use tracing::{debug, info};

/// Why the child branch gave up before running the target program.
///
/// The child reports these only through its exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildFailure {
    /// `setsid` failed
    NewSession,
    /// The slave could not be made the controlling terminal
    ControllingTerminal,
    /// Rebinding stdin/stdout/stderr to the slave failed
    Redirect,
    /// The program exists but could not be executed
    NotExecutable,
    /// The program was not found
    NotFound,
}

impl ChildFailure {
    pub fn exit_code(self) -> i32 {
        match self {
            ChildFailure::NewSession => 120,
            ChildFailure::ControllingTerminal => 121,
            ChildFailure::Redirect => 122,
            ChildFailure::NotExecutable => 126,
            ChildFailure::NotFound => 127,
        }
    }

    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            120 => Some(ChildFailure::NewSession),
            121 => Some(ChildFailure::ControllingTerminal),
            122 => Some(ChildFailure::Redirect),
            126 => Some(ChildFailure::NotExecutable),
            127 => Some(ChildFailure::NotFound),
            _ => None,
        }
    }

    /// Short name of the step that failed
    pub fn stage(self) -> &'static str {
        match self {
            ChildFailure::NewSession => "setsid",
            ChildFailure::ControllingTerminal => "TIOCSCTTY",
            ChildFailure::Redirect => "dup2",
            ChildFailure::NotExecutable | ChildFailure::NotFound => "exec",
        }
    }

    /// Attachment failures happen before the program is even looked up.
    pub fn is_attachment(self) -> bool {
        matches!(
            self,
            ChildFailure::NewSession | ChildFailure::ControllingTerminal | ChildFailure::Redirect
        )
    }
}

/// How the child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(Signal),
}

impl ChildExit {
    /// Shell-style exit code: the status, or 128 + signal number
    pub fn code(&self) -> i32 {
        match self {
            ChildExit::Exited(code) => *code,
            ChildExit::Signaled(signal) => 128 + *signal as i32,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ChildExit::Exited(0))
    }

    /// The setup failure encoded in the status, if the child never ran the program.
    ///
    /// A program may legitimately exit with one of these codes too; the decoding is
    /// only meaningful for a session whose program does not.
    pub fn failure(&self) -> Option<ChildFailure> {
        match self {
            ChildExit::Exited(code) => ChildFailure::from_exit_code(*code),
            ChildExit::Signaled(_) => None,
        }
    }

    fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ChildExit::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ChildExit::Signaled(signal)),
            _ => None,
        }
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildExit::Exited(code) => write!(f, "exited with status {code}"),
            ChildExit::Signaled(signal) => write!(f, "killed by {signal}"),
        }
    }
}

/// Program and arguments to run on the slave side
///
/// Strings are converted up front so nothing needs allocating after the fork.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    program: CString,
    argv: Vec<CString>,
}

impl ChildCommand {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Result<Self, PtyError> {
        let program = to_cstring(program.as_ref())?;
        Ok(Self {
            argv: vec![program.clone()],
            program,
        })
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Result<Self, PtyError> {
        self.argv.push(to_cstring(arg.as_ref())?);
        Ok(self)
    }

    pub fn args<I, S>(mut self, args: I) -> Result<Self, PtyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg)?;
        }
        Ok(self)
    }

    pub fn program(&self) -> &CStr {
        &self.program
    }

    /// Arguments including argv[0]
    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    /// Fork, attach the child to the slave, and exec the program.
    ///
    /// Returns the child and the master descriptor. The parent's copy of the slave is
    /// closed before returning; the child closes its copy of the master. Setup or exec
    /// failures in the child surface only through its exit status ([`ChildFailure`]).
    pub fn spawn(&self, pair: PtyPair) -> Result<(ChildProcess, OwnedFd), PtyError> {
        let (master, slave, slave_path) = pair.into_parts();

        let mut argv: Vec<*const libc::c_char> = self.argv.iter().map(|a| a.as_ptr()).collect();
        argv.push(std::ptr::null());

        match unsafe { fork() }.map_err(PtyError::Fork)? {
            ForkResult::Parent { child } => {
                drop(slave);
                info!(
                    pid = child.as_raw(),
                    program = %self.program.to_string_lossy(),
                    slave = %slave_path.display(),
                    "Child spawned"
                );
                Ok((ChildProcess { pid: child }, master))
            }
            ForkResult::Child => {
                drop(master);
                if let Err(err) = attach(slave) {
                    abort_child(err);
                }
                unsafe {
                    libc::execvp(self.program.as_ptr(), argv.as_ptr());
                }
                abort_child(SetupError::exec(Errno::last()))
            }
        }
    }
}

fn to_cstring(s: &OsStr) -> Result<CString, PtyError> {
    CString::new(s.as_bytes())
        .map_err(|_| PtyError::InvalidCommand(format!("{s:?} contains a NUL byte")))
}

/// A child process running on the slave side
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
}

impl ChildProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn signal(&self, signal: Signal) -> Result<(), PtyError> {
        signal::kill(self.pid, signal).map_err(|e| PtyError::IoError(io::Error::from(e)))
    }

    /// Block until the child exits and reap it. Consumes the handle, so a child is
    /// reaped at most once.
    pub fn wait_blocking(self) -> Result<ChildExit, PtyError> {
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some(exit) = ChildExit::from_wait_status(status) {
                        debug!(pid = self.pid.as_raw(), %exit, "Child reaped");
                        return Ok(exit);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(PtyError::Wait {
                        pid: self.pid.as_raw(),
                        source,
                    })
                }
            }
        }
    }

    /// Wait for exit on the blocking pool
    pub async fn wait(self) -> Result<ChildExit, PtyError> {
        tokio::task::spawn_blocking(move || self.wait_blocking())
            .await
            .map_err(|e| PtyError::IoError(io::Error::new(io::ErrorKind::Other, e)))?
    }
}
