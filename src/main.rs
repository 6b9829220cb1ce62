//! agent-relay - coordinator service and queue inspection CLI.

use clap::Parser;
use std::process::ExitCode;

use agent_relay::cli::Commands;
use agent_relay::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Commands::parse();

    let settings = match args.load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Keep the guard so the file writer flushes on exit
    let _guard = match logging::init(&settings.logging) {
        Ok((guard, _)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match args.run(&settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
