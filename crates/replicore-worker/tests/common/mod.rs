//! Shared fixtures for the worker integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use replicore_shared::config::{
    CommonConfig, ControllerConfig, DatabaseInfo, DatabaseStoreConfig, FamilyConfig,
    ReplicoreConfig, WorkerConfig, WorkerIdentity,
};
use replicore_shared::database::{
    DatabaseServices, DatabaseServicesPool, InMemoryDatabaseServices, PooledDatabaseServices,
};
use replicore_worker::context::WorkerContext;
use replicore_worker::fetcher::ReplicaFetcher;
use replicore_worker::sql_backend::SqlBackend;

/// A configuration over temp-dir backed workers `W1`, `W2` and one family
/// `production` with databases `D` (tables `Obj`, `Src`)
pub fn test_config(w1_dir: &Path, w2_dir: &Path) -> ReplicoreConfig {
    ReplicoreConfig {
        common: CommonConfig {
            instance_id: "qtest".to_string(),
            request_buf_size_bytes: 1024 * 1024,
            request_retry_interval_sec: 60,
        },
        controller: ControllerConfig {
            request_timeout_sec: 30,
            job_timeout_sec: 60,
            job_heartbeat_timeout_sec: 0,
            http_port: 0,
            auth_key: "secret".to_string(),
        },
        worker: WorkerConfig {
            num_svc_processing_threads: 2,
            num_async_loader_processing_threads: 2,
            async_loader_cleanup_on_resume: 0,
            async_loader_auto_resume: 0,
            ingest_num_retries: 0,
            ingest_max_retries: 4,
            ingest_charset_name: "latin1".to_string(),
            ingest_max_warnings: 16,
        },
        database: DatabaseStoreConfig {
            services_pool_size: 2,
            qserv_master_tmp_dir: std::env::temp_dir().join("replicore-test-master"),
            url: None,
        },
        workers: vec![
            WorkerIdentity {
                name: "W1".to_string(),
                host: "127.0.0.1".to_string(),
                port: 0,
                http_port: 0,
                loader_port: 0,
                data_dir: w1_dir.to_path_buf(),
            },
            WorkerIdentity {
                name: "W2".to_string(),
                host: "127.0.0.1".to_string(),
                port: 0,
                http_port: 0,
                loader_port: 0,
                data_dir: w2_dir.to_path_buf(),
            },
        ],
        families: vec![FamilyConfig {
            name: "production".to_string(),
            min_replication_level: 2,
        }],
        databases: vec![DatabaseInfo {
            name: "D".to_string(),
            family: "production".to_string(),
            director_table: "Obj".to_string(),
            partitioned_tables: vec!["Obj".to_string(), "Src".to_string()],
            regular_tables: vec!["Filter".to_string()],
            is_published: false,
        }],
    }
}

/// A pooled facade over one shared in-memory store
pub fn in_memory_db(store: &InMemoryDatabaseServices, size: usize) -> Arc<PooledDatabaseServices> {
    let services = (0..size)
        .map(|_| DatabaseServices::InMemory(store.shared()))
        .collect();
    Arc::new(PooledDatabaseServices::new(DatabaseServicesPool::new(
        services,
    )))
}

/// A worker context for `worker_name` over the shared store
pub fn test_context(
    config: ReplicoreConfig,
    worker_name: &str,
    store: &InMemoryDatabaseServices,
) -> Arc<WorkerContext> {
    let config = Arc::new(config);
    let db = in_memory_db(store, config.database.services_pool_size);
    let fetcher = ReplicaFetcher::local(&config, worker_name);
    WorkerContext::with_parts(
        config,
        worker_name,
        db,
        Arc::new(SqlBackend::new()),
        fetcher,
    )
    .expect("worker context")
}

/// Seed one table file with the given content
pub fn seed_file(dir: &Path, database: &str, name: &str, content: &[u8]) {
    let db_dir = dir.join(database);
    std::fs::create_dir_all(&db_dir).expect("create database dir");
    std::fs::write(db_dir.join(name), content).expect("write table file");
}
