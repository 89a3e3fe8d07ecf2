//! Process shutdown on SIGINT/SIGTERM.

use crate::manager::PreviewManager;
use std::sync::Arc;
use tracing::{info, warn};

/// Resolve once the process receives ctrl-c or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Stop every preview so no listener or directory outlives the process.
pub async fn drain_previews(manager: &Arc<PreviewManager>) {
    let active = manager.active_servers().await.len();
    info!(active, "Stopping preview servers before exit");
    manager.shutdown().await;
}
