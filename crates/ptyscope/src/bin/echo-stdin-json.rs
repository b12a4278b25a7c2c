//! Demonstration child: reports every read from stdin as a JSON string, so the
//! line discipline's edits are visible byte for byte.

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};

const TAG: &str = "[echo-stdin-json]";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Register before the first read so an early ctrl+c is not lost.
    let mut interrupt = signal(SignalKind::interrupt())?;

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                stdout.write_all(format!("{TAG}[signal]: SIGINT (2)\n").as_bytes()).await?;
                stdout.flush().await?;
                // A blocking stdin read may still be parked on the runtime.
                std::process::exit(0);
            }

            read = stdin.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                let json = serde_json::to_string(&String::from_utf8_lossy(&buf[..n]))?;
                stdout.write_all(format!("{TAG}[stdin]: {json}\n").as_bytes()).await?;
                stdout.flush().await?;
            }
        }
    }

    Ok(())
}
