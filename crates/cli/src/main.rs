//! CLI entry point for the HLS relay
//!
//! Parses command line arguments, loads configuration and runs the relay
//! until Ctrl-C or SIGTERM.

use clap::Parser;
use hls_relay::logging::init_logging;
use hls_relay::{shutdown_signal, Config, RelayService};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

/// HLS relay - on-demand RTSP/RTMP to HLS transcoding with shared sessions
#[derive(Parser, Debug)]
#[command(name = "hls-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults plus environment when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding config and environment
    #[arg(short, long)]
    bind: Option<String>,

    /// Skip the encoder probe (version and codecs)
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn load_config(args: &Args) -> Result<Config, hls_relay::config::ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match &args.config {
        Some(path) => info!(config = %path.display(), "HLS relay starting"),
        None => info!("HLS relay starting with default configuration"),
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let service = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        RelayService::new_without_checks(config).await
    } else {
        RelayService::new(config).await
    };

    let service = match service {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to initialize relay: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let token = service.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    if let Err(e) = service.run().await {
        error!("Relay error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("HLS relay stopped");
    ExitCode::SUCCESS
}
