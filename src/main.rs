use clap::Parser;
use preview_manager::config::Cli;
use preview_manager::{http_server, shutdown, PreviewManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("preview_manager=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.manager_config();
    info!(
        bind_host = %config.bind_host,
        base_port = config.base_port,
        max_servers = config.max_servers,
        previews_dir = %config.previews_dir.display(),
        "Preview manager configured"
    );

    let manager = Arc::new(PreviewManager::new(config));
    let addr = SocketAddr::new(cli.bind_host, cli.port);

    let result = http_server::run_server(addr, manager.clone(), shutdown::shutdown_signal()).await;
    if let Err(e) = &result {
        error!(error = %e, "Control API failed");
    }

    shutdown::drain_previews(&manager).await;
    info!("Shut down gracefully");

    if result.is_err() {
        std::process::exit(1);
    }
}
