//! PTY session plumbing for Ptyscope
//!
//! Allocates a master/slave pseudo-terminal pair, attaches a child program to the
//! slave as its controlling terminal, and drives the kernel line discipline from the
//! master side: a paced writer injects keystrokes while a background reader forwards
//! everything the discipline echoes or the child prints.

pub mod attach;
pub mod child;
pub mod pty;
pub mod reader;
pub mod script;
pub mod session;
pub mod writer;

pub use child::{ChildCommand, ChildExit, ChildFailure, ChildProcess};
pub use pty::{AsyncPtyMaster, PtyPair};
pub use reader::{MasterReader, ReaderEnd, ReaderReport};
pub use script::{Script, ScriptError};
pub use session::{SessionBuilder, SessionConfig, SessionReport, SessionState, SessionSupervisor};
pub use writer::{InjectReport, ScriptedWriter};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY multiplexer {}: {source}", .path.display())]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to unlock PTY slave: {0}")]
    Unlock(#[source] std::io::Error),

    #[error("Failed to query PTY number: {0}")]
    NumberQuery(#[source] std::io::Error),

    #[error("Failed to open PTY slave {}: {source}", .path.display())]
    SlaveOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("Invalid child command: {0}")]
    InvalidCommand(String),

    #[error("Failed to wait for child {pid}: {source}")]
    Wait {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("Session already closed")]
    SessionClosed,

    #[error("PTY I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PtyError {
    /// Whether the error happened while obtaining the terminal pair itself.
    pub fn is_allocation(&self) -> bool {
        matches!(
            self,
            PtyError::DeviceOpen { .. }
                | PtyError::Unlock(_)
                | PtyError::NumberQuery(_)
                | PtyError::SlaveOpen { .. }
        )
    }

    /// Process exit code used when this error aborts the program.
    pub fn exit_code(&self) -> u8 {
        if self.is_allocation() {
            return 2;
        }
        match self {
            PtyError::Fork(_) | PtyError::InvalidCommand(_) => 3,
            _ => 1,
        }
    }
}
