//! Server entry point for the encode queue
//!
//! Parses command line arguments, loads the configuration and runs the
//! server until it is ended by a client or interrupted.

use clap::Parser;
use encode_queue::{run_startup_checks, Collaborators, Config, EncodeServer};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Encode queue server
#[derive(Parser, Debug)]
#[command(name = "encode-queue-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the data directory from the configuration
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Override the RPC port from the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Skip startup checks (encoder and prober lookup). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(args: &Args) -> Result<Config, String> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).map_err(|e| format!("{}: {}", path.display(), e))?,
        None => Config::from_env(),
    };
    if let Some(dir) = &args.data_dir {
        config.server.data_dir = dir.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        error!(error = %e, "startup checks failed");
        return ExitCode::FAILURE;
    }

    let collaborators = Collaborators::from_config(&config);
    let server = EncodeServer::new(config, collaborators);
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to start");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    match server.run(listener).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}
