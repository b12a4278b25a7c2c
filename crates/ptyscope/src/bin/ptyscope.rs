use ptyscope_pty::PtyError;
use std::io::{self, Write};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let result = ptyscope::cli::run().await;

    let _ = io::stdout().flush();

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ptyscope: {e:#}");
            let code = e
                .downcast_ref::<PtyError>()
                .map(PtyError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}
