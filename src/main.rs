//! Service Account Key Rotation CLI
//!
//! This is the main entry point for the CLI application.

use std::process::ExitCode;

use clap::Parser;
use sa_key_rotator::cli;
use sa_key_rotator::error::{exit_code_for, RotationError};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Initialize tracing; stdout is reserved for the command's own output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Parse CLI arguments
    let cli = cli::Cli::parse();

    // Execute the command
    match cli::execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.chain().find_map(|e| e.downcast_ref::<RotationError>()) {
                Some(rotation) => eprintln!(
                    "Error: rotation stopped in {} state: {:#}",
                    rotation.state(),
                    err
                ),
                None => eprintln!("Error: {:#}", err),
            }
            ExitCode::from(exit_code_for(&err))
        }
    }
}
