//! Command handlers of the admin CLI.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tracing::debug;

use replicore_shared::config::{is_valid_name, is_valid_path, ReplicoreConfig};
use replicore_shared::database::PooledDatabaseServices;

/// Folder under each worker's data directory holding per-database export
/// trees
const EXPORT_FOLDER: &str = "export";

pub(crate) struct CtlContext {
    config: ReplicoreConfig,
    db: PooledDatabaseServices,
}

impl CtlContext {
    pub(crate) async fn new(config_path: &Path) -> anyhow::Result<Self> {
        let config = ReplicoreConfig::load(config_path)
            .with_context(|| format!("loading configuration from {}", config_path.display()))?;
        let db = PooledDatabaseServices::from_config(&config)
            .await
            .context("connecting to the persistent store")?;
        Ok(Self { config, db })
    }

    pub(crate) async fn install_meta(&self) -> anyhow::Result<()> {
        self.db.install_meta().await?;
        println!("metadata schema installed");
        Ok(())
    }

    pub(crate) async fn destroy_meta(&self) -> anyhow::Result<()> {
        self.db.destroy_meta().await?;
        println!("metadata schema destroyed");
        Ok(())
    }

    pub(crate) async fn print_meta(&self) -> anyhow::Result<()> {
        let databases = self.db.list_databases().await?;
        println!("registered databases: {}", databases.len());
        for name in &databases {
            println!("  {name}");
        }
        let transactions = self.db.transactions(None).await?;
        println!("transactions: {}", transactions.len());
        for transaction in &transactions {
            println!(
                "  {}  {}  {}",
                transaction.id, transaction.database, transaction.state
            );
        }
        Ok(())
    }

    pub(crate) async fn register_db(&self, database: &str) -> anyhow::Result<()> {
        validate_db_name(database)?;
        self.db.register_database(database).await?;
        println!("registered database '{database}'");
        Ok(())
    }

    pub(crate) async fn unregister_db(&self, database: &str) -> anyhow::Result<()> {
        validate_db_name(database)?;
        self.db.unregister_database(database).await?;
        println!("unregistered database '{database}'");
        Ok(())
    }

    pub(crate) async fn list_dbs(&self) -> anyhow::Result<()> {
        for name in self.db.list_databases().await? {
            println!("{name}");
        }
        Ok(())
    }

    /// Create (or, with `rebuild`, re-create) the export folders of one or
    /// all registered databases under every worker's data directory.
    pub(crate) async fn create_export_paths(
        &self,
        database: Option<&str>,
        rebuild: bool,
    ) -> anyhow::Result<()> {
        let databases = match database {
            Some(name) => {
                validate_db_name(name)?;
                let registered = self.db.list_databases().await?;
                if !registered.iter().any(|d| d == name) {
                    bail!("database '{name}' is not registered");
                }
                vec![name.to_string()]
            }
            None => self.db.list_databases().await?,
        };
        if databases.is_empty() {
            bail!("no registered databases");
        }
        for worker in &self.config.workers {
            for database in &databases {
                let path = export_path(&worker.data_dir, database)?;
                if rebuild && path.exists() {
                    std::fs::remove_dir_all(&path)
                        .with_context(|| format!("removing {}", path.display()))?;
                    debug!(path = %path.display(), "removed stale export folder");
                }
                std::fs::create_dir_all(&path)
                    .with_context(|| format!("creating {}", path.display()))?;
                println!("{}", path.display());
            }
        }
        Ok(())
    }
}

fn validate_db_name(database: &str) -> anyhow::Result<()> {
    if !is_valid_name(database) {
        bail!("invalid database name '{database}': only [A-Za-z0-9_] is allowed");
    }
    Ok(())
}

/// Build and validate one export folder path
fn export_path(data_dir: &Path, database: &str) -> anyhow::Result<PathBuf> {
    let path = data_dir.join(EXPORT_FOLDER).join(database);
    let rendered = path.display().to_string();
    if !is_valid_path(&rendered) {
        bail!("invalid export path '{rendered}'");
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_name_validation() {
        assert!(validate_db_name("Obj_2024").is_ok());
        assert!(validate_db_name("bad-name").is_err());
        assert!(validate_db_name("semi;colon").is_err());
        assert!(validate_db_name("").is_err());
    }

    #[test]
    fn test_export_path_shape() {
        let path = export_path(Path::new("/var/lib/replicore/W1"), "D").unwrap();
        assert_eq!(path, PathBuf::from("/var/lib/replicore/W1/export/D"));
    }

    #[test]
    fn test_export_path_rejects_bad_components() {
        assert!(export_path(Path::new("/data;x"), "D").is_err());
    }
}
