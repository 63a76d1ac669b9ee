use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cryoboss_client::config::USAGE;
use cryoboss_client::{CliArgs, Cryoboss};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Errors are reported once by `main`, after the log guard has flushed.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::from_env()?;
    if cli.show_help {
        println!("{}", USAGE);
        return Ok(());
    }

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _guard = setup_logging(&cli.log_dir, cli.json_logs);
    info!("Starting cryoboss client");

    let Some(setpoint) = cli.setpoint else {
        eprintln!("{}", USAGE);
        return Err("--setpoint is required".into());
    };
    let config = cli.session_config()?;

    let client = match Cryoboss::connect(config) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to connect to cryoboss: {}", e);
            return Err(Box::new(e));
        }
    };

    let ack = client.propose_setpoint(setpoint)?;
    println!("{}", ack.text().trim_end());
    info!("Client shutting down");
    Ok(())
}

fn setup_logging(log_dir: &Path, json: bool) -> WorkerGuard {
    let file_appender = rolling::daily(log_dir, "cryoboss.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cryoboss_client=debug"));

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
    guard
}
