//! Shared fixture for the controller integration tests: two full worker
//! stacks on ephemeral ports plus a controller wired over the same
//! in-memory persistent store.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use replicore_controller::controller::Controller;
use replicore_controller::messenger::Messenger;
use replicore_controller::service_provider::ServiceProvider;
use replicore_shared::config::{
    CommonConfig, ControllerConfig, DatabaseInfo, DatabaseStoreConfig, FamilyConfig,
    ReplicoreConfig, WorkerConfig, WorkerIdentity,
};
use replicore_shared::database::{
    DatabaseServices, DatabaseServicesPool, InMemoryDatabaseServices, PooledDatabaseServices,
};
use replicore_worker::context::WorkerContext;
use replicore_worker::fetcher::ReplicaFetcher;
use replicore_worker::processor::WorkerProcessor;
use replicore_worker::server::WorkerServer;
use replicore_worker::sql_backend::SqlBackend;

pub struct Fleet {
    pub controller: Arc<Controller>,
    pub config: Arc<ReplicoreConfig>,
    pub store: InMemoryDatabaseServices,
    pub w1_dir: PathBuf,
    pub w2_dir: PathBuf,
    pub w1: WorkerEnd,
    pub w2: WorkerEnd,
}

pub struct WorkerEnd {
    pub ctx: Arc<WorkerContext>,
    pub processor: Arc<WorkerProcessor>,
}

fn pooled(store: &InMemoryDatabaseServices, size: usize) -> Arc<PooledDatabaseServices> {
    let services = (0..size)
        .map(|_| DatabaseServices::InMemory(store.shared()))
        .collect();
    Arc::new(PooledDatabaseServices::new(DatabaseServicesPool::new(
        services,
    )))
}

async fn spawn_worker(
    config: &Arc<ReplicoreConfig>,
    name: &str,
    store: &InMemoryDatabaseServices,
    listener: tokio::net::TcpListener,
) -> WorkerEnd {
    let ctx = WorkerContext::with_parts(
        Arc::clone(config),
        name,
        pooled(store, config.database.services_pool_size),
        Arc::new(SqlBackend::new()),
        ReplicaFetcher::local(config, name),
    )
    .expect("worker context");
    let processor = WorkerProcessor::new(Arc::clone(&ctx));
    processor.start();
    let server = WorkerServer::new(Arc::clone(&ctx), Arc::clone(&processor));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    WorkerEnd { ctx, processor }
}

/// Spin a two-worker fleet; `mutate` may adjust the configuration before
/// anything starts.
pub async fn fleet(mutate: impl FnOnce(&mut ReplicoreConfig)) -> Fleet {
    let w1_dir = tempfile::tempdir().unwrap().keep();
    let w2_dir = tempfile::tempdir().unwrap().keep();
    let master_tmp = tempfile::tempdir().unwrap().keep();

    let l1 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let l2 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let p1 = l1.local_addr().unwrap().port();
    let p2 = l2.local_addr().unwrap().port();

    let mut config = ReplicoreConfig {
        common: CommonConfig {
            instance_id: "qtest".to_string(),
            request_buf_size_bytes: 1024 * 1024,
            request_retry_interval_sec: 8,
        },
        controller: ControllerConfig {
            request_timeout_sec: 30,
            job_timeout_sec: 120,
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
            qserv_master_tmp_dir: master_tmp,
            url: None,
        },
        workers: vec![
            WorkerIdentity {
                name: "W1".to_string(),
                host: "127.0.0.1".to_string(),
                port: p1,
                http_port: 0,
                loader_port: 0,
                data_dir: w1_dir.clone(),
            },
            WorkerIdentity {
                name: "W2".to_string(),
                host: "127.0.0.1".to_string(),
                port: p2,
                http_port: 0,
                loader_port: 0,
                data_dir: w2_dir.clone(),
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
            regular_tables: vec![],
            is_published: false,
        }],
    };
    mutate(&mut config);
    let config = Arc::new(config);
    let store = InMemoryDatabaseServices::new();

    let w1 = spawn_worker(&config, "W1", &store, l1).await;
    let w2 = spawn_worker(&config, "W2", &store, l2).await;

    let provider = ServiceProvider::with_parts(
        Arc::clone(&config),
        pooled(&store, config.database.services_pool_size),
        Messenger::new(Arc::clone(&config)),
    );
    let controller = Controller::new(provider);

    Fleet {
        controller,
        config,
        store,
        w1_dir,
        w2_dir,
        w1,
        w2,
    }
}

/// Seed every required base file of `(database, chunk)` at a worker
pub fn seed_complete_chunk(dir: &Path, database: &str, tables: &[&str], chunk: u32) {
    let db_dir = dir.join(database);
    std::fs::create_dir_all(&db_dir).expect("create database dir");
    for table in tables {
        for ext in ["frm", "MYD", "MYI"] {
            std::fs::write(
                db_dir.join(format!("{table}_{chunk}.{ext}")),
                format!("{table}:{chunk}:{ext}").as_bytes(),
            )
            .expect("write table file");
        }
    }
}
