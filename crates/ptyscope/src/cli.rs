//! Command-line front end

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use ptyscope_pty::{ChildCommand, ChildFailure, Script, SessionBuilder};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Name of the bundled demonstration child, installed next to `ptyscope`
pub const BUNDLED_CHILD: &str = "echo-stdin-json";

/// Exit code when the child never got to run its program
pub const CHILD_SETUP_FAILED: u8 = 4;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Ptyscope - type a script into a pseudo-terminal and watch the line discipline"
)]
struct Args {
    /// Program to run on the PTY slave (defaults to the bundled echo-stdin-json)
    #[arg(short, long)]
    program: Option<PathBuf>,

    /// Script to type, with \r \n \t \0 \\ \e and \xHH escapes (defaults to the built-in demo)
    #[arg(short, long, conflicts_with = "script_file")]
    script: Option<String>,

    /// Read the script verbatim from a file
    #[arg(long)]
    script_file: Option<PathBuf>,

    /// Delay between keystrokes in milliseconds
    #[arg(short, long, default_value = "10")]
    delay_ms: u64,

    /// How long to keep draining output after the child exits, in milliseconds
    #[arg(long, default_value = "50")]
    drain_ms: u64,

    /// How long to wait for the child to take the terminal, in milliseconds
    #[arg(long, default_value = "2000")]
    attach_timeout_ms: u64,

    /// Kill the child if it is still running this long after the script, in milliseconds
    #[arg(long)]
    child_timeout_ms: Option<u64>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value = "warn")]
    log_level: LogLevel,

    /// Arguments passed to the program
    #[arg(last = true)]
    args: Vec<String>,
}

impl Args {
    fn script(&self) -> Result<Script> {
        if let Some(path) = &self.script_file {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read script file: {}", path.display()))?;
            return Ok(Script::from_bytes(bytes));
        }
        match &self.script {
            Some(text) => Script::from_escaped(text).context("Invalid --script"),
            None => Ok(Script::demo()),
        }
    }

    fn program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => {
                let exe = std::env::current_exe().context("Cannot locate own executable")?;
                Ok(exe.with_file_name(BUNDLED_CHILD))
            }
        }
    }

    fn session(&self) -> Result<SessionBuilder> {
        let command = ChildCommand::new(self.program()?)?.args(&self.args)?;

        let mut builder = SessionBuilder::new()
            .command(command)
            .script(self.script()?)
            .keystroke_delay(Duration::from_millis(self.delay_ms))
            .drain_grace(Duration::from_millis(self.drain_ms))
            .attach_timeout(Duration::from_millis(self.attach_timeout_ms));
        if let Some(ms) = self.child_timeout_ms {
            builder = builder.child_timeout(Duration::from_millis(ms));
        }
        Ok(builder)
    }
}

fn init_logging(level: LogLevel) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    // stdout carries the terminal output, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

fn setup_failure_message(failure: ChildFailure) -> String {
    let what = if failure.is_attachment() {
        "child could not attach to the terminal"
    } else {
        "child could not start the program"
    };
    format!("{what} ({} failed)", failure.stage())
}

pub async fn run() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.log_level);

    let mut supervisor = args.session()?.build();
    info!(
        program = %args.program()?.display(),
        bytes = supervisor.config().script.len(),
        "Starting session"
    );

    let report = supervisor.run(tokio::io::stdout()).await?;

    eprintln!(
        "ptyscope: {} child {}; typed {}/{} bytes; observed {} bytes",
        report.slave_path.display(),
        report.exit,
        report.injected.written,
        report.injected.total,
        report.reader.bytes_forwarded
    );
    if let Some(error) = &report.injected.error {
        warn!("Script truncated: {}", error);
    }

    if let Some(failure) = report.exit.failure() {
        eprintln!("ptyscope: {}", setup_failure_message(failure));
        return Ok(ExitCode::from(CHILD_SETUP_FAILED));
    }
    Ok(ExitCode::SUCCESS)
}
