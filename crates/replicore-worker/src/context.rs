//! Worker-side service wiring.
//!
//! One [`WorkerContext`] is constructed in `main` and injected through
//! constructors; there is no lazy global state.

use std::sync::Arc;

use replicore_shared::config::{ReplicoreConfig, WorkerIdentity};
use replicore_shared::database::PooledDatabaseServices;
use replicore_shared::errors::{ReplicaError, ReplicaResult};

use crate::fetcher::ReplicaFetcher;
use crate::sql_backend::SqlBackend;

/// Shared state of one worker process
#[derive(Debug)]
pub struct WorkerContext {
    pub config: Arc<ReplicoreConfig>,
    /// This worker's identity from the configuration
    pub worker: WorkerIdentity,
    pub db: Arc<PooledDatabaseServices>,
    /// The embedded query/schema service of this worker
    pub sql: Arc<SqlBackend>,
    /// Transport for pulling replica files from peer workers
    pub fetcher: ReplicaFetcher,
    /// Serializes concurrent data-folder activity of the request family
    pub data_folder_lock: tokio::sync::Mutex<()>,
    /// Replicas announced to the query service via the management channel
    pub chunk_registry: std::sync::Mutex<std::collections::HashSet<(String, u32)>>,
}

impl WorkerContext {
    pub async fn new(config: Arc<ReplicoreConfig>, worker_name: &str) -> ReplicaResult<Arc<Self>> {
        let worker = config.worker(worker_name)?.clone();
        let db = Arc::new(PooledDatabaseServices::from_config(&config).await?);
        let fetcher = ReplicaFetcher::from_config(&config, worker_name)?;
        Ok(Arc::new(Self {
            config,
            worker,
            db,
            sql: Arc::new(SqlBackend::new()),
            fetcher,
            data_folder_lock: tokio::sync::Mutex::new(()),
            chunk_registry: std::sync::Mutex::new(std::collections::HashSet::new()),
        }))
    }

    /// Build a context over pre-constructed collaborators (tests)
    pub fn with_parts(
        config: Arc<ReplicoreConfig>,
        worker_name: &str,
        db: Arc<PooledDatabaseServices>,
        sql: Arc<SqlBackend>,
        fetcher: ReplicaFetcher,
    ) -> ReplicaResult<Arc<Self>> {
        let worker = config.worker(worker_name)?.clone();
        Ok(Arc::new(Self {
            config,
            worker,
            db,
            sql,
            fetcher,
            data_folder_lock: tokio::sync::Mutex::new(()),
            chunk_registry: std::sync::Mutex::new(std::collections::HashSet::new()),
        }))
    }

    /// The data folder of one database at this worker
    pub fn database_dir(&self, database: &str) -> ReplicaResult<std::path::PathBuf> {
        if !replicore_shared::config::is_valid_name(database) {
            return Err(ReplicaError::invalid_argument(format!(
                "invalid database name '{database}'"
            )));
        }
        Ok(self.worker.data_dir.join(database))
    }
}
