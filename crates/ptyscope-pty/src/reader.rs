//! Background drain of the PTY master into an observation sink

use crate::pty::{is_hangup, AsyncPtyMaster};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Why the reader stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEnd {
    /// The master reported end-of-stream or hang-up
    EndOfStream,
    /// Stopped on request after draining pending output
    Stopped,
    /// A master read failed
    ReadError(String),
    /// Writing to the sink failed
    SinkError(String),
    /// Did not stop within the timeout and was cancelled
    Aborted,
    /// The task panicked
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderReport {
    pub bytes_forwarded: u64,
    pub end: ReaderEnd,
}

/// Handle to the reader task
pub struct MasterReader {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<ReaderReport>,
    forwarded: Arc<AtomicU64>,
}

impl MasterReader {
    /// Start forwarding everything that arrives on `master` to `sink`, verbatim and in
    /// arrival order.
    ///
    /// After a stop request the reader keeps draining until no data has arrived for
    /// `drain_grace`.
    pub fn spawn<W>(master: Arc<AsyncPtyMaster>, sink: W, drain_grace: Duration) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let forwarded = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(forward_loop(
            master,
            sink,
            shutdown_rx,
            drain_grace,
            forwarded.clone(),
        ));

        Self {
            shutdown_tx,
            handle,
            forwarded,
        }
    }

    /// Bytes forwarded so far
    pub fn bytes_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Ask the reader to stop and wait for it. If it has not finished within `timeout`
    /// the task is aborted. The task is always joined before this returns.
    pub async fn stop(mut self, timeout: Duration) -> ReaderReport {
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                error!("Reader task failed: {}", e);
                ReaderReport {
                    bytes_forwarded: self.bytes_forwarded(),
                    end: ReaderEnd::Failed(e.to_string()),
                }
            }
            Err(_) => {
                warn!(?timeout, "Reader did not stop in time, aborting");
                self.handle.abort();
                let _ = (&mut self.handle).await;
                ReaderReport {
                    bytes_forwarded: self.bytes_forwarded(),
                    end: ReaderEnd::Aborted,
                }
            }
        }
    }
}

async fn forward_loop<W>(
    master: Arc<AsyncPtyMaster>,
    mut sink: W,
    mut shutdown_rx: watch::Receiver<bool>,
    drain_grace: Duration,
    forwarded: Arc<AtomicU64>,
) -> ReaderReport
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buffer = vec![0u8; 4096];
    let report = |end| ReaderReport {
        bytes_forwarded: forwarded.load(Ordering::Relaxed),
        end,
    };

    loop {
        tokio::select! {
            result = master.read(&mut buffer) => {
                match result {
                    Ok(0) => {
                        debug!("PTY master closed");
                        return report(ReaderEnd::EndOfStream);
                    }
                    Ok(n) => {
                        if let Err(e) = forward(&mut sink, &buffer[..n]).await {
                            error!("Sink write error: {}", e);
                            return report(ReaderEnd::SinkError(e.to_string()));
                        }
                        forwarded.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) if is_hangup(&e) => {
                        debug!("PTY slave hung up");
                        return report(ReaderEnd::EndOfStream);
                    }
                    Err(e) => {
                        error!("PTY read error: {}", e);
                        return report(ReaderEnd::ReadError(e.to_string()));
                    }
                }
            }

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Reader shutdown requested");
                    break;
                }
            }
        }
    }

    // Pick up output that was still in flight when the stop request arrived.
    loop {
        match tokio::time::timeout(drain_grace, master.read(&mut buffer)).await {
            Err(_) | Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if let Err(e) = forward(&mut sink, &buffer[..n]).await {
                    error!("Sink write error: {}", e);
                    return report(ReaderEnd::SinkError(e.to_string()));
                }
                forwarded.fetch_add(n as u64, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                if !is_hangup(&e) {
                    debug!("PTY read error while draining: {}", e);
                }
                break;
            }
        }
    }

    report(ReaderEnd::Stopped)
}

async fn forward<W: AsyncWrite + Unpin>(sink: &mut W, data: &[u8]) -> std::io::Result<()> {
    sink.write_all(data).await?;
    sink.flush().await
}
