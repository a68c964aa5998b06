//! Admin CLI of the replication control plane.
//!
//! Manages the catalog metadata of the persistent store and the per-worker
//! export folders. Database and path names are validated before any state
//! changes; the binary exits 0 on success and non-zero with a human message
//! on stderr otherwise.

mod commands;

use clap::{Parser, Subcommand};

use replicore_shared::logging;

#[derive(Debug, Parser)]
#[command(name = "replicore-ctl", about = "Replicore catalog administration")]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "/etc/replicore/replicore.toml")]
    config: std::path::PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the schema objects of the persistent store
    #[command(name = "installMeta")]
    InstallMeta,

    /// Drop the schema objects of the persistent store
    #[command(name = "destroyMeta")]
    DestroyMeta,

    /// Print the catalog metadata
    #[command(name = "printMeta")]
    PrintMeta,

    /// Register a database in the catalog
    #[command(name = "registerDb")]
    RegisterDb { database: String },

    /// Remove a database from the catalog
    #[command(name = "unregisterDb")]
    UnregisterDb { database: String },

    /// List registered databases
    #[command(name = "listDbs")]
    ListDbs,

    /// Create export folders, for one database or all registered ones
    #[command(name = "createExportPaths")]
    CreateExportPaths { database: Option<String> },

    /// Re-create export folders from scratch
    #[command(name = "rebuildExportPaths")]
    RebuildExportPaths { database: Option<String> },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    logging::init_tracing();

    if let Err(e) = run(args).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let context = commands::CtlContext::new(&args.config).await?;
    match args.command {
        Command::InstallMeta => context.install_meta().await,
        Command::DestroyMeta => context.destroy_meta().await,
        Command::PrintMeta => context.print_meta().await,
        Command::RegisterDb { database } => context.register_db(&database).await,
        Command::UnregisterDb { database } => context.unregister_db(&database).await,
        Command::ListDbs => context.list_dbs().await,
        Command::CreateExportPaths { database } => {
            context.create_export_paths(database.as_deref(), false).await
        }
        Command::RebuildExportPaths { database } => {
            context.create_export_paths(database.as_deref(), true).await
        }
    }
}
