use anyhow::{Context, Result};
use clap::Parser;
use procmaster_common::SupervisorError;
use procmaster_remote::RemoteServer;
use procmaster_supervisor::{SupervisorConfig, SupervisorService};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// procmaster - remote process supervisor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (YAML); defaults apply when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Listen address, tcp://host:port or unix:///path (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Resurrect the saved process set on start (overrides config)
    #[arg(long)]
    resurrect: bool,

    /// Run duration in seconds (for testing)
    #[arg(long)]
    run_duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match args.config {
        Some(ref path) => SupervisorConfig::load_from_file(path)?,
        None => SupervisorConfig::default(),
    };
    if let Some(listen) = args.listen.clone() {
        config.supervisor.listen = listen;
    }
    if args.resurrect {
        config.supervisor.resurrect_on_start = true;
    }
    config.validate().context("Invalid configuration")?;

    initialize_logging(args.debug, &config.supervisor.log_level);

    info!("Starting procmaster");
    if let Some(ref path) = args.config {
        info!("Config file: {}", path);
    }
    info!("Snapshot file: {}", config.snapshot_path().display());

    let service = SupervisorService::new(&config);

    if config.supervisor.resurrect_on_start {
        resurrect_on_start(&service).await;
    }

    let address = config.listen_address()?;
    let server = RemoteServer::bind(&address, service.clone())
        .await
        .with_context(|| format!("Failed to start remote server on {}", address))?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(server.run(async move {
        let _ = stop_rx.await;
    }));

    if let Some(duration) = args.run_duration {
        info!("Running for {} seconds (test mode)", duration);
        tokio::time::sleep(tokio::time::Duration::from_secs(duration)).await;
    } else {
        shutdown_signal().await;
    }

    info!("Shutting down procmaster...");
    let _ = stop_tx.send(());
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Remote server failed: {}", e),
        Err(e) => error!("Remote server task failed: {}", e),
    }

    if config.supervisor.save_on_shutdown {
        match service.save().await {
            Ok(count) => info!("Saved {} process(es) before shutdown", count),
            Err(e) => error!("Failed to save before shutdown: {}", e),
        }
    }

    service
        .shutdown()
        .await
        .map_err(|e| anyhow::anyhow!("Shutdown failed: {}", e))?;
    info!("procmaster shut down successfully");

    Ok(())
}

fn initialize_logging(debug: bool, configured_level: &str) {
    let level = if debug { "debug" } else { configured_level };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();
}

/// A missing snapshot is normal on first start; anything else is reported
/// and the daemon keeps going with whatever did start.
async fn resurrect_on_start(service: &SupervisorService) {
    match service.resurrect().await {
        Ok(summary) => info!(
            "Resurrected {} process(es), {} already present",
            summary.started.len(),
            summary.skipped.len()
        ),
        Err(SupervisorError::Persistence { path, reason }) => {
            warn!("Nothing resurrected from {}: {}", path, reason);
        }
        Err(SupervisorError::Resurrect {
            failures,
            started,
            skipped,
        }) => {
            for failure in &failures {
                error!("Failed to resurrect {}", failure);
            }
            info!(
                "Resurrected {} process(es), {} already present",
                started.len(),
                skipped.len()
            );
        }
        Err(e) => error!("Resurrect failed: {}", e),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM signal");
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT signal");
                    }
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers ({}); waiting for Ctrl+C", e);
            }
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C signal"),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
}
