//! # Bascula daemon
//!
//! Reads a serial scale and broadcasts its readings to dashboard clients
//! over WebSocket.
//!
//! ## Features
//! - Serial polling with automatic reconnect, or simulated readings in test mode
//! - Live configuration, log inspection and flushing over the WebSocket protocol
//! - Password-protected dashboard with session cookies and login lockout
//! - Health, ping and Prometheus metrics endpoints
//! - Graceful shutdown on Ctrl-C or SIGTERM

use bascula_daemon::{config::BuildInfo, daemon::Service};
use tracing::info;

/// Entry point for the daemon.
///
/// Loads the build inputs from the environment, runs the service and stops it
/// on a termination signal or when it quits on its own.
///
/// # Errors
/// Returns an error if the build inputs are invalid or the service cannot start.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();

    let build = BuildInfo::from_env()?;
    build.validate()?;

    let mut service = Service::new(build);
    service.init()?;
    service.start()?;

    let quit = service.quit_signal();
    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = quit.wait() => info!("Service quit on its own"),
    }

    service.stop().await?;
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
