//! Worker server binary: wire protocol endpoint, ingest HTTP surface and
//! the asynchronous loader pool of one storage worker.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use replicore_shared::config::ReplicoreConfig;
use replicore_shared::logging;
use replicore_worker::context::WorkerContext;
use replicore_worker::http::{router, start_loader_pool, IngestHttpState};
use replicore_worker::ingest::{recovery, IngestRequestMgr};
use replicore_worker::processor::WorkerProcessor;
use replicore_worker::server::WorkerServer;

#[derive(Debug, Parser)]
#[command(name = "replicore-worker", about = "Replicore storage worker server")]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "/etc/replicore/replicore.toml")]
    config: std::path::PathBuf,

    /// Name of this worker in the configuration
    #[arg(long)]
    worker: String,

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

    info!(worker = %args.worker, "starting worker server");
    info!("   version: {}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(ReplicoreConfig::load(&args.config)?);
    let ctx = WorkerContext::new(Arc::clone(&config), &args.worker).await?;

    // Request processor and the wire endpoint
    let processor = WorkerProcessor::new(Arc::clone(&ctx));
    processor.start();
    let wire_addr = format!("{}:{}", ctx.worker.host, ctx.worker.port);
    let wire_listener = tokio::net::TcpListener::bind(&wire_addr).await?;
    let wire_server = WorkerServer::new(Arc::clone(&ctx), Arc::clone(&processor));
    tokio::spawn(async move {
        if let Err(e) = wire_server.serve(wire_listener).await {
            error!("wire server failed: {e}");
        }
    });
    info!(addr = %wire_addr, "wire server started");

    // Ingest manager with crash recovery, then the loader pool and the
    // HTTP surface
    let mgr = IngestRequestMgr::new(
        Arc::clone(&ctx.db),
        ctx.worker.name.clone(),
        config.worker.num_async_loader_processing_threads,
    );
    let (resubmitted, failed) = recovery::bootstrap(&mgr, &ctx).await?;
    info!(resubmitted, failed, "ingest recovery complete");

    let state = IngestHttpState {
        ctx: Arc::clone(&ctx),
        mgr: Arc::clone(&mgr),
        processor: Arc::clone(&processor),
    };
    start_loader_pool(state.clone());

    let http_addr = format!("{}:{}", ctx.worker.host, ctx.worker.http_port);
    let http_listener = tokio::net::TcpListener::bind(&http_addr).await?;
    info!(addr = %http_addr, "ingest HTTP server started");
    let app = router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, app).await {
            error!("ingest HTTP server failed: {e}");
        }
    });

    info!("worker is up; press Ctrl+C to shut down");
    shutdown_signal().await;
    info!("shutdown signal received");
    processor.shutdown();
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
