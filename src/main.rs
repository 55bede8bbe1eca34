//! file-distributor daemon.

use clap::Parser;
use file_distributor::logging::{init_logging, LogFormat};
use file_distributor::{
    ControlPlane, ControlServer, DistributionEngine, DistributorConfig, Result, SqliteTaskStore,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "file-distributor")]
#[command(about = "Distribute repository files to target servers")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "./config.yaml")]
    config: PathBuf,

    /// Log verbosity: trace, debug, info, warn, error (RUST_LOG overrides)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let format = match cli.log_format.parse::<LogFormat>() {
        Ok(format) => format,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(&cli.log_level, format) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "file-distributor exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = DistributorConfig::load(&cli.config)?;
    info!(
        config = %cli.config.display(),
        repository = %config.repository.display(),
        targets = config.targets.len(),
        "Configuration loaded"
    );

    let store = Arc::new(SqliteTaskStore::open(&config.store).await?);
    let control_address = config.control_address.clone();

    let mut engine = DistributionEngine::with_store(config, Arc::clone(&store));
    engine.start().await?;

    let control: Arc<dyn ControlPlane> = Arc::new(engine.handle());
    let server = match ControlServer::bind(&control_address, control).await {
        Ok(server) => server,
        Err(e) => {
            engine.shutdown().await;
            store.close().await;
            return Err(e);
        }
    };
    let (stop_tx, stop_rx) = watch::channel(false);
    let listener = tokio::spawn(server.run(stop_rx));

    match wait_for_signal().await {
        Ok(name) => info!(signal = name, "Received signal, shutting down"),
        Err(e) => warn!(error = %e, "Signal handler failed, shutting down"),
    }

    stop_tx.send_replace(true);
    if let Err(e) = listener.await {
        warn!(error = %e, "Control listener panicked");
    }
    engine.shutdown().await;
    store.close().await;
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}
