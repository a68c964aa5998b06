//! Controller server binary: the replication control plane's REST ingress
//! over the typed controller API.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;

use replicore_controller::controller::Controller;
use replicore_controller::http::{router, HttpState};
use replicore_controller::service_provider::ServiceProvider;
use replicore_shared::config::ReplicoreConfig;
use replicore_shared::logging;

#[derive(Debug, Parser)]
#[command(name = "replicore-server", about = "Replicore controller server")]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "/etc/replicore/replicore.toml")]
    config: std::path::PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    if args.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    logging::init_tracing();

    info!("starting controller server");
    info!("   version: {}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(ReplicoreConfig::load(&args.config)?);
    let provider = ServiceProvider::new(Arc::clone(&config)).await?;
    let controller = Controller::new(provider);

    let addr = format!("0.0.0.0:{}", config.controller.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "REST ingress listening");

    let app = router(HttpState { controller });
    tokio::select! {
        result = async { axum::serve(listener, app).await } => {
            result?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }
    info!("controller server stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
