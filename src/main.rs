mod app;
mod cli;
mod config;
mod error;
mod report;
mod services;

use app::App;
use clap::Parser;
use cli::Cli;
use config::Config;
use error::{Status, TransferError};

use anyhow::{Context, Result};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_file.as_deref()) {
        eprintln!("pvr-transfer: {:#}", e);
        return ExitCode::from(Status::Config.code());
    }

    tracing::info!("Starting pvr-transfer {}", env!("CARGO_PKG_VERSION"));

    let status = match build_app(&cli) {
        Ok(app) => app.run(cli.mode()).await,
        Err(e) => {
            tracing::error!("{}", e);
            e.status()
        }
    };

    tracing::info!("Finished with exit status {}", status.code());
    ExitCode::from(status.code())
}

fn build_app(cli: &Cli) -> Result<App, TransferError> {
    let config = Config::load(cli.config.as_deref())
        .and_then(|config| config.validate().map(|_| config))
        .map_err(|e| TransferError::ConfigError(format!("{:#}", e)))?;

    App::new(config)
}

/// Log to stderr, and append to `log_file` when given; `RUST_LOG` overrides the `info` default
fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::io::stderr.and(Mutex::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    Ok(())
}
