//! Session supervision
//!
//! Sequences one bounded session: allocate the pair, fork the child onto the slave,
//! start the reader, type the script, wait for the child, stop the reader, close the
//! master.

use crate::{
    child::{ChildCommand, ChildExit, ChildProcess},
    pty::{AsyncPtyMaster, PtyPair, PTMX_PATH},
    reader::{MasterReader, ReaderReport},
    script::Script,
    writer::{InjectReport, ScriptedWriter},
    PtyError,
};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

/// Program run on the slave when no command is configured
const DEFAULT_PROGRAM: &str = "cat";

/// Lifecycle of a session. States are only ever entered in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Init,
    PtyAllocated,
    ChildSpawned,
    ReaderStarted,
    Injecting,
    AwaitingChildExit,
    ShuttingDownReader,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "init",
            SessionState::PtyAllocated => "pty-allocated",
            SessionState::ChildSpawned => "child-spawned",
            SessionState::ReaderStarted => "reader-started",
            SessionState::Injecting => "injecting",
            SessionState::AwaitingChildExit => "awaiting-child-exit",
            SessionState::ShuttingDownReader => "shutting-down-reader",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Program attached to the slave; `cat` when unset
    pub command: Option<ChildCommand>,

    /// Bytes typed into the master
    pub script: Script,

    /// PTY multiplexer device
    pub multiplexer: PathBuf,

    /// Pause between two injected bytes
    pub keystroke_delay: Duration,

    /// How long to wait for the child to own the terminal before typing
    pub attach_timeout: Duration,

    /// How long the reader keeps draining after a stop request once output goes quiet
    pub drain_grace: Duration,

    /// How long a stopping reader may take before it is aborted
    pub stop_timeout: Duration,

    /// Kill the child if it has not exited this long after the script was typed
    pub child_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: None,
            script: Script::demo(),
            multiplexer: PathBuf::from(PTMX_PATH),
            keystroke_delay: Duration::from_millis(10),
            attach_timeout: Duration::from_secs(2),
            drain_grace: Duration::from_millis(50),
            stop_timeout: Duration::from_secs(1),
            child_timeout: None,
        }
    }
}

/// What happened during a session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub slave_path: PathBuf,
    pub child_pid: i32,
    pub exit: ChildExit,
    pub injected: InjectReport,
    pub reader: ReaderReport,
    /// Every state entered, in order, starting with `Init`
    pub transitions: Vec<SessionState>,
}

/// Drives one PTY session from allocation to close
pub struct SessionSupervisor {
    config: SessionConfig,
    state: SessionState,
    transitions: Vec<SessionState>,
}

impl SessionSupervisor {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Init,
            transitions: vec![SessionState::Init],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run the session, forwarding everything read from the master to `sink`.
    ///
    /// A supervisor runs once; afterwards it is `Closed` whether the run succeeded or not.
    pub async fn run<W>(&mut self, sink: W) -> Result<SessionReport, PtyError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if self.state != SessionState::Init {
            return Err(PtyError::SessionClosed);
        }

        let result = self.run_session(sink).await;
        if self.state != SessionState::Closed {
            self.enter(SessionState::Closed);
        }
        result
    }

    async fn run_session<W>(&mut self, sink: W) -> Result<SessionReport, PtyError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let command = match &self.config.command {
            Some(command) => command.clone(),
            None => ChildCommand::new(DEFAULT_PROGRAM)?,
        };

        let pair = PtyPair::allocate_from(&self.config.multiplexer)?;
        let slave_path = pair.slave_path().to_path_buf();
        info!(slave = %slave_path.display(), "PTY allocated");
        self.enter(SessionState::PtyAllocated);

        let (child, master) = command.spawn(pair)?;
        let pid = child.pid();
        self.enter(SessionState::ChildSpawned);

        let master = match AsyncPtyMaster::new(master) {
            Ok(master) => Arc::new(master),
            Err(e) => {
                let _ = child.signal(Signal::SIGKILL);
                let _ = child.wait().await;
                return Err(e.into());
            }
        };

        let reader = MasterReader::spawn(master.clone(), sink, self.config.drain_grace);
        self.enter(SessionState::ReaderStarted);

        wait_for_attachment(&master, pid, self.config.attach_timeout).await;

        self.enter(SessionState::Injecting);
        let injected = ScriptedWriter::new(master.clone(), self.config.keystroke_delay)
            .inject(&self.config.script)
            .await;

        self.enter(SessionState::AwaitingChildExit);
        let exit = self.await_child(child).await;
        match &exit {
            Ok(exit) => info!(pid = pid.as_raw(), %exit, "Child finished"),
            Err(e) => warn!(pid = pid.as_raw(), "Lost track of child: {}", e),
        }

        self.enter(SessionState::ShuttingDownReader);
        let reader_report = reader.stop(self.config.stop_timeout).await;
        debug!(bytes = reader_report.bytes_forwarded, end = ?reader_report.end, "Reader stopped");

        release_master(master);
        self.enter(SessionState::Closed);

        Ok(SessionReport {
            slave_path,
            child_pid: pid.as_raw(),
            exit: exit?,
            injected,
            reader: reader_report,
            transitions: self.transitions.clone(),
        })
    }

    async fn await_child(&self, child: ChildProcess) -> Result<ChildExit, PtyError> {
        let pid = child.pid();
        let mut waiter = tokio::task::spawn_blocking(move || child.wait_blocking());

        let joined = match self.config.child_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut waiter).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(pid = pid.as_raw(), ?limit, "Child still running, killing it");
                    let _ = signal::kill(pid, Signal::SIGKILL);
                    waiter.await
                }
            },
            None => waiter.await,
        };

        joined.map_err(|e| PtyError::IoError(io::Error::new(io::ErrorKind::Other, e)))?
    }

    fn enter(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "{} -> {}", self.state, next);
        debug!(from = %self.state, to = %next, "Session state");
        self.state = next;
        self.transitions.push(next);
    }
}

/// Wait until the child's process group is in the terminal's foreground, which means
/// it has become the session leader owning the slave.
async fn wait_for_attachment(master: &AsyncPtyMaster, pid: Pid, timeout: Duration) {
    if cfg!(not(target_os = "linux")) {
        tokio::time::sleep(timeout.min(Duration::from_millis(50))).await;
        return;
    }

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match master.foreground_process_group() {
            Ok(pgrp) if pgrp == pid => {
                debug!(pid = pid.as_raw(), "Child owns the terminal");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Cannot query foreground process group: {}", e);
                return;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(pid = pid.as_raw(), ?timeout, "Child did not take the terminal in time");
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn release_master(master: Arc<AsyncPtyMaster>) {
    match Arc::try_unwrap(master) {
        Ok(master) => {
            let fd = master.into_inner();
            debug!(fd = ?fd, "Closing PTY master");
            drop(fd);
        }
        Err(_) => warn!("PTY master still shared at close"),
    }
}

/// Builder for creating PTY sessions
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
        }
    }

    /// Set the program to attach to the slave
    pub fn command(mut self, command: ChildCommand) -> Self {
        self.config.command = Some(command);
        self
    }

    pub fn script(mut self, script: Script) -> Self {
        self.config.script = script;
        self
    }

    pub fn multiplexer(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.multiplexer = path.into();
        self
    }

    pub fn keystroke_delay(mut self, delay: Duration) -> Self {
        self.config.keystroke_delay = delay;
        self
    }

    pub fn attach_timeout(mut self, timeout: Duration) -> Self {
        self.config.attach_timeout = timeout;
        self
    }

    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.config.drain_grace = grace;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    pub fn child_timeout(mut self, timeout: Duration) -> Self {
        self.config.child_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> SessionSupervisor {
        SessionSupervisor::new(self.config)
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
