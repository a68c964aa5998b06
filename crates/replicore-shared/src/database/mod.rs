//! # Database Services
//!
//! Controller- and worker-side persistence behind one facade. The concrete
//! backend is selected by configuration: a Postgres backend for production
//! deployments, or a transient in-memory backend for tests and ephemeral
//! runs. Dispatch is by enum, not trait objects.
//!
//! Callers never talk to a backend directly: the bounded
//! [`pool::DatabaseServicesPool`] serializes access to a fixed set of
//! handles, and [`pool::PooledDatabaseServices`] wraps every public
//! persistence operation in an allocate/operate/release cycle that releases
//! the handle on all exit paths.

pub mod memory;
pub mod pool;
pub mod postgres;

use serde::{Deserialize, Serialize};

use crate::errors::{ReplicaError, ReplicaResult};
use crate::ingest::{ContribStatus, TransactionContribInfo, TransactionInfo, TransactionState};
use crate::protocol::Performance;
use crate::replica::ReplicaInfo;

pub use memory::InMemoryDatabaseServices;
pub use pool::{DatabaseServicesPool, PooledDatabaseServices};
pub use postgres::PostgresDatabaseServices;

/// Persisted snapshot of a controller-side request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPersistentState {
    pub id: String,
    pub job_id: Option<String>,
    pub kind: String,
    pub worker: String,
    pub priority: i32,
    pub state: String,
    pub extended_state: String,
    pub server_status: String,
    pub performance: Performance,
}

/// Persisted snapshot of a controller-side job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPersistentState {
    pub id: String,
    pub parent_id: Option<String>,
    pub kind: String,
    pub state: String,
    pub extended_state: String,
    pub priority: i32,
    pub exclusive: bool,
    pub preemptable: bool,
    pub begin_time: u64,
    pub end_time: u64,
    pub heartbeat_time: u64,
}

/// One persistence backend handle.
///
/// All variants expose the same async operation set; the enum forwards.
#[derive(Debug, Clone)]
pub enum DatabaseServices {
    Postgres(PostgresDatabaseServices),
    InMemory(InMemoryDatabaseServices),
}

macro_rules! forward {
    ($self:ident, $service:ident => $body:expr) => {
        match $self {
            DatabaseServices::Postgres($service) => $body,
            DatabaseServices::InMemory($service) => $body,
        }
    };
}

impl DatabaseServices {
    /// Create the schema objects of the persistent store
    pub async fn install_meta(&self) -> ReplicaResult<()> {
        forward!(self, s => s.install_meta().await)
    }

    /// Drop the schema objects of the persistent store
    pub async fn destroy_meta(&self) -> ReplicaResult<()> {
        forward!(self, s => s.destroy_meta().await)
    }

    /// Record a controller startup
    pub async fn save_controller_state(
        &self,
        instance_id: &str,
        start_time: u64,
    ) -> ReplicaResult<()> {
        forward!(self, s => s.save_controller_state(instance_id, start_time).await)
    }

    /// Upsert the persistent state of a request
    pub async fn save_request_state(&self, state: &RequestPersistentState) -> ReplicaResult<()> {
        forward!(self, s => s.save_request_state(state).await)
    }

    /// Upsert the persistent state of a job
    pub async fn save_job_state(&self, state: &JobPersistentState) -> ReplicaResult<()> {
        forward!(self, s => s.save_job_state(state).await)
    }

    /// Refresh a job's heartbeat timestamp
    pub async fn update_job_heartbeat(&self, job_id: &str, time: u64) -> ReplicaResult<()> {
        forward!(self, s => s.update_job_heartbeat(job_id, time).await)
    }

    /// Replace the persisted census of `(worker, database)` with the given
    /// collection
    pub async fn save_replica_info_collection(
        &self,
        worker: &str,
        database: &str,
        replicas: &[ReplicaInfo],
    ) -> ReplicaResult<()> {
        forward!(self, s => s.save_replica_info_collection(worker, database, replicas).await)
    }

    /// All persisted replicas of a database
    pub async fn find_database_replicas(&self, database: &str) -> ReplicaResult<Vec<ReplicaInfo>> {
        forward!(self, s => s.find_database_replicas(database).await)
    }

    /// Open a new ingest transaction against a database
    pub async fn begin_transaction(&self, database: &str) -> ReplicaResult<TransactionInfo> {
        forward!(self, s => s.begin_transaction(database).await)
    }

    /// Close an ingest transaction, committing or aborting it
    pub async fn end_transaction(&self, id: u32, abort: bool) -> ReplicaResult<TransactionInfo> {
        forward!(self, s => s.end_transaction(id, abort).await)
    }

    /// Look up one transaction
    pub async fn transaction(&self, id: u32) -> ReplicaResult<TransactionInfo> {
        forward!(self, s => s.transaction(id).await)
    }

    /// All transactions, optionally restricted to one state
    pub async fn transactions(
        &self,
        state: Option<TransactionState>,
    ) -> ReplicaResult<Vec<TransactionInfo>> {
        forward!(self, s => s.transactions(state).await)
    }

    /// Persist a new contribution, assigning its id
    pub async fn save_new_contrib(
        &self,
        contrib: &mut TransactionContribInfo,
    ) -> ReplicaResult<()> {
        forward!(self, s => s.save_new_contrib(contrib).await)
    }

    /// Persist the full state of an existing contribution
    pub async fn save_contrib(&self, contrib: &TransactionContribInfo) -> ReplicaResult<()> {
        forward!(self, s => s.save_contrib(contrib).await)
    }

    /// Persist a contribution whose most recent retry snapshot was just
    /// recorded
    pub async fn save_last_contrib_retry(
        &self,
        contrib: &TransactionContribInfo,
    ) -> ReplicaResult<()> {
        forward!(self, s => s.save_last_contrib_retry(contrib).await)
    }

    /// Look up one contribution
    pub async fn contrib(&self, id: u32) -> ReplicaResult<TransactionContribInfo> {
        forward!(self, s => s.contrib(id).await)
    }

    /// Contributions of a transaction, optionally filtered by status and
    /// worker
    pub async fn transaction_contribs(
        &self,
        transaction_id: u32,
        status: Option<ContribStatus>,
        worker: Option<&str>,
    ) -> ReplicaResult<Vec<TransactionContribInfo>> {
        forward!(self, s => s.transaction_contribs(transaction_id, status, worker).await)
    }

    /// Register a database in the catalog metadata
    pub async fn register_database(&self, name: &str) -> ReplicaResult<()> {
        forward!(self, s => s.register_database(name).await)
    }

    /// Remove a database from the catalog metadata
    pub async fn unregister_database(&self, name: &str) -> ReplicaResult<()> {
        forward!(self, s => s.unregister_database(name).await)
    }

    /// All registered database names
    pub async fn list_databases(&self) -> ReplicaResult<Vec<String>> {
        forward!(self, s => s.list_databases().await)
    }
}

/// Map a missing-row condition onto the facade's error contract
pub(crate) fn not_found(what: impl std::fmt::Display) -> ReplicaError {
    ReplicaError::not_found(what.to_string())
}
