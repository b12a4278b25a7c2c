//! Paced keystroke injection into the master side

use crate::pty::AsyncPtyMaster;
use crate::script::Script;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of one injection run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectReport {
    /// Bytes actually written, always a prefix of the script
    pub written: usize,
    pub total: usize,
    /// The write failure that truncated the script, if any
    pub error: Option<String>,
}

impl InjectReport {
    pub fn completed(&self) -> bool {
        self.error.is_none() && self.written == self.total
    }
}

/// Types a script into the master one byte at a time
///
/// Single-byte writes with a pause in between let the line discipline echo and
/// buffer exactly as it would for a person at a keyboard.
pub struct ScriptedWriter {
    master: Arc<AsyncPtyMaster>,
    delay: Duration,
}

impl ScriptedWriter {
    pub fn new(master: Arc<AsyncPtyMaster>, delay: Duration) -> Self {
        Self { master, delay }
    }

    /// Write every byte of `script` in order. A failed write stops the injection; it
    /// is reported, never retried.
    pub async fn inject(&self, script: &Script) -> InjectReport {
        let bytes = script.as_bytes();
        let mut report = InjectReport {
            written: 0,
            total: bytes.len(),
            error: None,
        };

        for (i, byte) in bytes.iter().enumerate() {
            if i > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Err(e) = self.master.write_all(std::slice::from_ref(byte)).await {
                warn!(offset = i, error = %e, "Write to PTY master failed, truncating script");
                report.error = Some(e.to_string());
                return report;
            }
            report.written += 1;
        }

        debug!(bytes = report.written, "Script injected");
        report
    }
}
