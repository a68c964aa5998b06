//! Transient in-memory persistence backend.
//!
//! Every handle created by [`InMemoryDatabaseServices::shared`] views the
//! same state, matching the semantics of pool handles against one Postgres
//! instance. Used by tests and ephemeral deployments; nothing survives the
//! process.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::errors::ReplicaResult;
use crate::ingest::{ContribStatus, TransactionContribInfo, TransactionInfo, TransactionState};
use crate::protocol::now_ms;
use crate::replica::ReplicaInfo;

use super::{not_found, JobPersistentState, RequestPersistentState};

#[derive(Debug, Default)]
struct State {
    installed: bool,
    controller_starts: Vec<(String, u64)>,
    requests: BTreeMap<String, RequestPersistentState>,
    jobs: BTreeMap<String, JobPersistentState>,
    /// `(worker, database) -> census`
    replicas: BTreeMap<(String, String), Vec<ReplicaInfo>>,
    transactions: BTreeMap<u32, TransactionInfo>,
    next_transaction_id: u32,
    contribs: BTreeMap<u32, TransactionContribInfo>,
    next_contrib_id: u32,
    registered_databases: BTreeMap<String, ()>,
}

/// In-memory backend handle; cheap to clone, shares state with its siblings
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabaseServices {
    state: Arc<Mutex<State>>,
}

impl InMemoryDatabaseServices {
    /// A fresh store with no shared siblings
    pub fn new() -> Self {
        Self::default()
    }

    /// Another handle onto the same store
    pub fn shared(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn install_meta(&self) -> ReplicaResult<()> {
        self.lock().installed = true;
        Ok(())
    }

    pub async fn destroy_meta(&self) -> ReplicaResult<()> {
        let mut state = self.lock();
        *state = State::default();
        Ok(())
    }

    pub async fn save_controller_state(
        &self,
        instance_id: &str,
        start_time: u64,
    ) -> ReplicaResult<()> {
        self.lock()
            .controller_starts
            .push((instance_id.to_string(), start_time));
        Ok(())
    }

    pub async fn save_request_state(&self, state: &RequestPersistentState) -> ReplicaResult<()> {
        self.lock().requests.insert(state.id.clone(), state.clone());
        Ok(())
    }

    /// Test accessor: the persisted snapshot of one request
    pub fn request_state(&self, id: &str) -> Option<RequestPersistentState> {
        self.lock().requests.get(id).cloned()
    }

    pub async fn save_job_state(&self, state: &JobPersistentState) -> ReplicaResult<()> {
        self.lock().jobs.insert(state.id.clone(), state.clone());
        Ok(())
    }

    pub async fn update_job_heartbeat(&self, job_id: &str, time: u64) -> ReplicaResult<()> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| not_found(format!("job '{job_id}'")))?;
        job.heartbeat_time = time;
        Ok(())
    }

    /// Test accessor: the persisted snapshot of one job
    pub fn job_state(&self, id: &str) -> Option<JobPersistentState> {
        self.lock().jobs.get(id).cloned()
    }

    pub async fn save_replica_info_collection(
        &self,
        worker: &str,
        database: &str,
        replicas: &[ReplicaInfo],
    ) -> ReplicaResult<()> {
        self.lock()
            .replicas
            .insert((worker.to_string(), database.to_string()), replicas.to_vec());
        Ok(())
    }

    pub async fn find_database_replicas(&self, database: &str) -> ReplicaResult<Vec<ReplicaInfo>> {
        let state = self.lock();
        Ok(state
            .replicas
            .iter()
            .filter(|((_, db), _)| db == database)
            .flat_map(|(_, replicas)| replicas.iter().cloned())
            .collect())
    }

    pub async fn begin_transaction(&self, database: &str) -> ReplicaResult<TransactionInfo> {
        let mut state = self.lock();
        state.next_transaction_id += 1;
        let transaction = TransactionInfo {
            id: state.next_transaction_id,
            database: database.to_string(),
            state: TransactionState::Started,
            begin_time: now_ms(),
            end_time: 0,
        };
        state.transactions.insert(transaction.id, transaction.clone());
        Ok(transaction)
    }

    pub async fn end_transaction(&self, id: u32, abort: bool) -> ReplicaResult<TransactionInfo> {
        let mut state = self.lock();
        let transaction = state
            .transactions
            .get_mut(&id)
            .ok_or_else(|| not_found(format!("transaction {id}")))?;
        transaction.state = if abort {
            TransactionState::Aborted
        } else {
            TransactionState::Finished
        };
        transaction.end_time = now_ms();
        Ok(transaction.clone())
    }

    pub async fn transaction(&self, id: u32) -> ReplicaResult<TransactionInfo> {
        self.lock()
            .transactions
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(format!("transaction {id}")))
    }

    pub async fn transactions(
        &self,
        state_filter: Option<TransactionState>,
    ) -> ReplicaResult<Vec<TransactionInfo>> {
        Ok(self
            .lock()
            .transactions
            .values()
            .filter(|t| state_filter.is_none_or(|s| t.state == s))
            .cloned()
            .collect())
    }

    pub async fn save_new_contrib(
        &self,
        contrib: &mut TransactionContribInfo,
    ) -> ReplicaResult<()> {
        let mut state = self.lock();
        state.next_contrib_id += 1;
        contrib.id = state.next_contrib_id;
        state.contribs.insert(contrib.id, contrib.clone());
        Ok(())
    }

    pub async fn save_contrib(&self, contrib: &TransactionContribInfo) -> ReplicaResult<()> {
        let mut state = self.lock();
        if !state.contribs.contains_key(&contrib.id) {
            return Err(not_found(format!("contribution {}", contrib.id)));
        }
        state.contribs.insert(contrib.id, contrib.clone());
        Ok(())
    }

    pub async fn save_last_contrib_retry(
        &self,
        contrib: &TransactionContribInfo,
    ) -> ReplicaResult<()> {
        self.save_contrib(contrib).await
    }

    pub async fn contrib(&self, id: u32) -> ReplicaResult<TransactionContribInfo> {
        self.lock()
            .contribs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(format!("contribution {id}")))
    }

    pub async fn transaction_contribs(
        &self,
        transaction_id: u32,
        status: Option<ContribStatus>,
        worker: Option<&str>,
    ) -> ReplicaResult<Vec<TransactionContribInfo>> {
        Ok(self
            .lock()
            .contribs
            .values()
            .filter(|c| c.transaction_id == transaction_id)
            .filter(|c| status.is_none_or(|s| c.status == s))
            .filter(|c| worker.is_none_or(|w| c.worker == w))
            .cloned()
            .collect())
    }

    pub async fn register_database(&self, name: &str) -> ReplicaResult<()> {
        self.lock().registered_databases.insert(name.to_string(), ());
        Ok(())
    }

    pub async fn unregister_database(&self, name: &str) -> ReplicaResult<()> {
        let mut state = self.lock();
        state
            .registered_databases
            .remove(name)
            .ok_or_else(|| not_found(format!("database '{name}'")))?;
        Ok(())
    }

    pub async fn list_databases(&self) -> ReplicaResult<Vec<String>> {
        Ok(self.lock().registered_databases.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_handles_view_same_state() {
        let a = InMemoryDatabaseServices::new();
        let b = a.shared();
        let transaction = a.begin_transaction("D").await.unwrap();
        assert_eq!(b.transaction(transaction.id).await.unwrap(), transaction);
    }

    #[tokio::test]
    async fn test_contrib_id_assignment() {
        let store = InMemoryDatabaseServices::new();
        let mut c1 = TransactionContribInfo::new(0, 1, "W1", "D", "Obj", 1, false, "");
        let mut c2 = TransactionContribInfo::new(0, 1, "W1", "D", "Obj", 2, false, "");
        store.save_new_contrib(&mut c1).await.unwrap();
        store.save_new_contrib(&mut c2).await.unwrap();
        assert_ne!(c1.id, c2.id);
        assert_eq!(store.contrib(c1.id).await.unwrap().chunk, 1);
    }

    #[tokio::test]
    async fn test_transaction_lifecycle() {
        let store = InMemoryDatabaseServices::new();
        let transaction = store.begin_transaction("D").await.unwrap();
        assert_eq!(transaction.state, TransactionState::Started);
        let started = store
            .transactions(Some(TransactionState::Started))
            .await
            .unwrap();
        assert_eq!(started.len(), 1);
        let aborted = store.end_transaction(transaction.id, true).await.unwrap();
        assert_eq!(aborted.state, TransactionState::Aborted);
        assert!(store
            .transactions(Some(TransactionState::Started))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_census_replacement() {
        let store = InMemoryDatabaseServices::new();
        let replica = ReplicaInfo::new(crate::replica::ReplicaStatus::Complete, "W1", "D", 7);
        store
            .save_replica_info_collection("W1", "D", std::slice::from_ref(&replica))
            .await
            .unwrap();
        store
            .save_replica_info_collection("W1", "D", &[])
            .await
            .unwrap();
        assert!(store.find_database_replicas("D").await.unwrap().is_empty());
    }
}
