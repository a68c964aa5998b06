//! Bounded pool of database-service handles.
//!
//! The pool is the only cross-component blocking primitive of the system:
//! `allocate()` parks the caller until a handle is free, and the RAII guard
//! returns the handle on every exit path, exceptions included. The pool size
//! is fixed at construction for the process lifetime.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::config::ReplicoreConfig;
use crate::errors::ReplicaResult;
use crate::ingest::{ContribStatus, TransactionContribInfo, TransactionInfo, TransactionState};
use crate::replica::ReplicaInfo;

use super::{DatabaseServices, JobPersistentState, RequestPersistentState};

/// The bounded handle pool
#[derive(Debug)]
pub struct DatabaseServicesPool {
    available: Mutex<Vec<DatabaseServices>>,
    notify: Notify,
    size: usize,
}

impl DatabaseServicesPool {
    /// Build the pool from configuration: `database.services_pool_size`
    /// Postgres handles when a store URL is configured, otherwise that many
    /// handles onto one shared in-memory store.
    pub async fn from_config(config: &ReplicoreConfig) -> ReplicaResult<Self> {
        let size = config.database.services_pool_size;
        let mut services = Vec::with_capacity(size);
        match &config.database.url {
            Some(url) => {
                for _ in 0..size {
                    services.push(DatabaseServices::Postgres(
                        super::PostgresDatabaseServices::connect(url).await?,
                    ));
                }
            }
            None => {
                let store = super::InMemoryDatabaseServices::new();
                for _ in 0..size {
                    services.push(DatabaseServices::InMemory(store.shared()));
                }
            }
        }
        Ok(Self::new(services))
    }

    /// Build the pool over a pre-constructed set of handles
    pub fn new(services: Vec<DatabaseServices>) -> Self {
        let size = services.len();
        Self {
            available: Mutex::new(services),
            notify: Notify::new(),
            size,
        }
    }

    /// Number of handles managed by the pool
    pub fn size(&self) -> usize {
        self.size
    }

    /// Handles currently not allocated
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DatabaseServices>> {
        self.available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a handle, waiting until one is free
    pub async fn allocate(&self) -> PooledServiceGuard<'_> {
        let mut waited = false;
        loop {
            if let Some(service) = self.lock().pop() {
                if waited {
                    tracing::debug!("database service handle obtained after waiting");
                }
                return PooledServiceGuard {
                    pool: self,
                    service: Some(service),
                };
            }
            waited = true;
            self.notify.notified().await;
        }
    }

    fn release(&self, service: DatabaseServices) {
        self.lock().push(service);
        self.notify.notify_one();
    }
}

/// RAII guard over one allocated handle
#[derive(Debug)]
pub struct PooledServiceGuard<'a> {
    pool: &'a DatabaseServicesPool,
    service: Option<DatabaseServices>,
}

impl PooledServiceGuard<'_> {
    pub fn service(&self) -> &DatabaseServices {
        self.service
            .as_ref()
            .expect("the handle is only taken on drop")
    }
}

impl Drop for PooledServiceGuard<'_> {
    fn drop(&mut self) {
        if let Some(service) = self.service.take() {
            self.pool.release(service);
        }
    }
}

/// The persistence facade used by every component: each operation allocates
/// a handle, performs the call and returns the handle, propagating the
/// original error unchanged.
#[derive(Debug)]
pub struct PooledDatabaseServices {
    pool: DatabaseServicesPool,
}

impl PooledDatabaseServices {
    pub fn new(pool: DatabaseServicesPool) -> Self {
        Self { pool }
    }

    pub async fn from_config(config: &ReplicoreConfig) -> ReplicaResult<Self> {
        Ok(Self::new(DatabaseServicesPool::from_config(config).await?))
    }

    /// The underlying pool, for introspection in tests
    pub fn pool(&self) -> &DatabaseServicesPool {
        &self.pool
    }

    pub async fn install_meta(&self) -> ReplicaResult<()> {
        let guard = self.pool.allocate().await;
        guard.service().install_meta().await
    }

    pub async fn destroy_meta(&self) -> ReplicaResult<()> {
        let guard = self.pool.allocate().await;
        guard.service().destroy_meta().await
    }

    pub async fn save_controller_state(
        &self,
        instance_id: &str,
        start_time: u64,
    ) -> ReplicaResult<()> {
        let guard = self.pool.allocate().await;
        guard
            .service()
            .save_controller_state(instance_id, start_time)
            .await
    }

    pub async fn save_request_state(&self, state: &RequestPersistentState) -> ReplicaResult<()> {
        let guard = self.pool.allocate().await;
        guard.service().save_request_state(state).await
    }

    pub async fn save_job_state(&self, state: &JobPersistentState) -> ReplicaResult<()> {
        let guard = self.pool.allocate().await;
        guard.service().save_job_state(state).await
    }

    pub async fn update_job_heartbeat(&self, job_id: &str, time: u64) -> ReplicaResult<()> {
        let guard = self.pool.allocate().await;
        guard.service().update_job_heartbeat(job_id, time).await
    }

    pub async fn save_replica_info_collection(
        &self,
        worker: &str,
        database: &str,
        replicas: &[ReplicaInfo],
    ) -> ReplicaResult<()> {
        let guard = self.pool.allocate().await;
        guard
            .service()
            .save_replica_info_collection(worker, database, replicas)
            .await
    }

    pub async fn find_database_replicas(&self, database: &str) -> ReplicaResult<Vec<ReplicaInfo>> {
        let guard = self.pool.allocate().await;
        guard.service().find_database_replicas(database).await
    }

    pub async fn begin_transaction(&self, database: &str) -> ReplicaResult<TransactionInfo> {
        let guard = self.pool.allocate().await;
        guard.service().begin_transaction(database).await
    }

    pub async fn end_transaction(&self, id: u32, abort: bool) -> ReplicaResult<TransactionInfo> {
        let guard = self.pool.allocate().await;
        guard.service().end_transaction(id, abort).await
    }

    pub async fn transaction(&self, id: u32) -> ReplicaResult<TransactionInfo> {
        let guard = self.pool.allocate().await;
        guard.service().transaction(id).await
    }

    pub async fn transactions(
        &self,
        state: Option<TransactionState>,
    ) -> ReplicaResult<Vec<TransactionInfo>> {
        let guard = self.pool.allocate().await;
        guard.service().transactions(state).await
    }

    pub async fn save_new_contrib(
        &self,
        contrib: &mut TransactionContribInfo,
    ) -> ReplicaResult<()> {
        let guard = self.pool.allocate().await;
        guard.service().save_new_contrib(contrib).await
    }

    pub async fn save_contrib(&self, contrib: &TransactionContribInfo) -> ReplicaResult<()> {
        let guard = self.pool.allocate().await;
        guard.service().save_contrib(contrib).await
    }

    pub async fn save_last_contrib_retry(
        &self,
        contrib: &TransactionContribInfo,
    ) -> ReplicaResult<()> {
        let guard = self.pool.allocate().await;
        guard.service().save_last_contrib_retry(contrib).await
    }

    pub async fn contrib(&self, id: u32) -> ReplicaResult<TransactionContribInfo> {
        let guard = self.pool.allocate().await;
        guard.service().contrib(id).await
    }

    pub async fn transaction_contribs(
        &self,
        transaction_id: u32,
        status: Option<ContribStatus>,
        worker: Option<&str>,
    ) -> ReplicaResult<Vec<TransactionContribInfo>> {
        let guard = self.pool.allocate().await;
        guard
            .service()
            .transaction_contribs(transaction_id, status, worker)
            .await
    }

    pub async fn register_database(&self, name: &str) -> ReplicaResult<()> {
        let guard = self.pool.allocate().await;
        guard.service().register_database(name).await
    }

    pub async fn unregister_database(&self, name: &str) -> ReplicaResult<()> {
        let guard = self.pool.allocate().await;
        guard.service().unregister_database(name).await
    }

    pub async fn list_databases(&self) -> ReplicaResult<Vec<String>> {
        let guard = self.pool.allocate().await;
        guard.service().list_databases().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryDatabaseServices;
    use std::sync::Arc;
    use std::time::Duration;

    fn in_memory_pool(size: usize) -> DatabaseServicesPool {
        let store = InMemoryDatabaseServices::new();
        let services = (0..size)
            .map(|_| DatabaseServices::InMemory(store.shared()))
            .collect();
        DatabaseServicesPool::new(services)
    }

    #[tokio::test]
    async fn test_allocate_release_cycle() {
        let pool = in_memory_pool(2);
        assert_eq!(pool.available(), 2);
        {
            let _a = pool.allocate().await;
            let _b = pool.allocate().await;
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_allocate_blocks_until_release() {
        let pool = Arc::new(in_memory_pool(1));
        let guard = pool.allocate().await;

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let _guard = pool.allocate().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .expect("waiter should not panic");
    }

    #[tokio::test]
    async fn test_handle_returned_after_error() {
        let pool = PooledDatabaseServices::new(in_memory_pool(1));
        // Heartbeat of an unknown job fails, but the handle must come back
        assert!(pool.update_job_heartbeat("absent", 1).await.is_err());
        assert_eq!(pool.pool().available(), 1);
    }

    #[tokio::test]
    async fn test_operations_share_state_across_handles() {
        let pool = PooledDatabaseServices::new(in_memory_pool(2));
        let transaction = pool.begin_transaction("D").await.unwrap();
        let found = pool.transaction(transaction.id).await.unwrap();
        assert_eq!(found.database, "D");
    }
}
