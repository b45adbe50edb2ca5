//! Guest agent entry point.

use std::time::Duration;

use anyhow::Result;
use gce_guest_agent::{config::Config, logging, service};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Upper bound on waiting for the watcher after shutdown is signalled.
/// A hanging request may be in flight for up to the client timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(75);

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    logging::init(&config.log_level);

    info!(
        metadata_url = %config.metadata_url,
        state_path = %config.state_path.display(),
        serial_port = %config.serial_port.display(),
        "Starting guest agent"
    );

    let capabilities = service::linux_capabilities(&config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut agent = tokio::spawn(service::run(config, capabilities, shutdown_rx));

    tokio::select! {
        signalled = shutdown_signal() => {
            if let Err(e) = signalled {
                error!(error = %e, "Failed to install signal handlers");
            }
        }
        result = &mut agent => {
            match result {
                Ok(Ok(())) => info!("Agent exited"),
                Ok(Err(e)) => error!(error = %e, "Agent error"),
                Err(e) => error!(error = %e, "Agent task panicked"),
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for the metadata watcher to stop...");
    match tokio::time::timeout(SHUTDOWN_GRACE, agent).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Agent error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "Agent task panicked"),
        Err(_) => warn!("Watcher did not stop in time"),
    }

    info!("Guest agent shutdown complete");
    Ok(())
}
