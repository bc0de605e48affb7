//! flowsync server: hosts workflow rooms over WebSocket and runs the
//! checkpoint loop until interrupted.

mod args;

use std::sync::Arc;

use clap::Parser;
use flowsync_collab::{InMemoryCatalog, SyncServer};
use log::{error, info, warn};

use args::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    )
    .init();

    let config = cli.to_config(|key| std::env::var(key).ok());
    let catalog = match &cli.templates {
        Some(path) => match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|json| InMemoryCatalog::from_json(&json).map_err(|e| e.to_string()))
        {
            Ok(catalog) => catalog,
            Err(e) => {
                error!("Could not load templates from {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => InMemoryCatalog::new(),
    };

    let server = match SyncServer::new(config) {
        Ok(server) => server.with_catalog(Arc::new(catalog)),
        Err(e) => {
            error!("Could not start server: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "Storage: {}",
        server
            .config()
            .storage_path
            .as_ref()
            .map_or("in-memory".to_string(), |p| p.display().to_string())
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    let report = server.flush().await;
    if report.failed.is_empty() {
        info!("Final checkpoint: {} written, {} unchanged", report.written, report.unchanged);
    } else {
        warn!("Final checkpoint failed for {:?}", report.failed);
        std::process::exit(1);
    }
}
