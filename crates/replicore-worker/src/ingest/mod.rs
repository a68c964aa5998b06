//! # Ingest Request Manager
//!
//! Queue-of-queues for asynchronous bulk ingest on one worker: a FIFO input
//! queue per database, an in-progress set, and per-database concurrency
//! caps. Loader tasks block in [`IngestRequestMgr::next`] until an eligible
//! request exists; eligibility favors the database with the lowest
//! concurrency-to-cap ratio, tie-broken by the oldest front-of-queue
//! contribution.
//!
//! Submission order within one database is preserved; no order is
//! guaranteed across databases.

pub mod recovery;
pub mod request;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use replicore_shared::database::PooledDatabaseServices;
use replicore_shared::errors::{ReplicaError, ReplicaResult};
use replicore_shared::ingest::{ContribStatus, TransactionContribInfo};

/// One contribution travelling through the manager
#[derive(Debug)]
pub struct IngestRequest {
    pub contrib: TransactionContribInfo,
    pub cancel: CancellationToken,
}

impl IngestRequest {
    pub fn new(contrib: TransactionContribInfo) -> Self {
        Self {
            contrib,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug)]
struct InProgressEntry {
    database: String,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct MgrState {
    input: HashMap<String, VecDeque<IngestRequest>>,
    in_progress: HashMap<u32, InProgressEntry>,
    concurrency: HashMap<String, usize>,
    max_concurrency: HashMap<String, usize>,
    /// Final snapshots of completed contributions, until disposed by age
    output: HashMap<u32, TransactionContribInfo>,
}

/// The per-worker ingest scheduler
#[derive(Debug)]
pub struct IngestRequestMgr {
    state: std::sync::Mutex<MgrState>,
    notify: Notify,
    db: Arc<PooledDatabaseServices>,
    worker: String,
    default_max_concurrency: usize,
}

impl IngestRequestMgr {
    pub fn new(
        db: Arc<PooledDatabaseServices>,
        worker: impl Into<String>,
        default_max_concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: std::sync::Mutex::new(MgrState::default()),
            notify: Notify::new(),
            db,
            worker: worker.into(),
            default_max_concurrency: default_max_concurrency.max(1),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MgrState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Override the concurrency cap of one database
    pub fn set_max_concurrency(&self, database: &str, cap: usize) {
        self.lock()
            .max_concurrency
            .insert(database.to_string(), cap.max(1));
        self.notify.notify_waiters();
    }

    /// Enqueue a contribution at the back of its database's input queue
    pub fn submit(&self, request: IngestRequest) -> ReplicaResult<()> {
        let contrib = &request.contrib;
        if contrib.status != ContribStatus::InProgress || contrib.start_time != 0 {
            return Err(ReplicaError::illegal_state(format!(
                "contribution {} has already been processed",
                contrib.id
            )));
        }
        {
            let mut state = self.lock();
            state.output.remove(&contrib.id);
            state
                .input
                .entry(contrib.database.clone())
                .or_default()
                .push_back(request);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take the next eligible request, waiting for one to appear.
    ///
    /// Returns the request and accounts it against its database's
    /// concurrency cap until [`Self::completed`] is called for it.
    pub async fn next(&self) -> IngestRequest {
        loop {
            if let Some(request) = self.try_next() {
                return request;
            }
            self.notify.notified().await;
        }
    }

    /// Timed variant of [`Self::next`]
    pub async fn next_timeout(&self, ival: Duration) -> ReplicaResult<IngestRequest> {
        tokio::time::timeout(ival, self.next())
            .await
            .map_err(|_| ReplicaError::IngestTimerExpired)
    }

    fn try_next(&self) -> Option<IngestRequest> {
        let mut state = self.lock();
        let default_cap = self.default_max_concurrency;

        // The database with the lowest concurrency ratio wins; ties go to
        // the oldest waiting contribution
        let mut best: Option<(String, f64, u64)> = None;
        for (database, queue) in state.input.iter() {
            let front = match queue.front() {
                Some(front) => front,
                None => continue,
            };
            let cap = *state.max_concurrency.get(database).unwrap_or(&default_cap);
            let concurrency = *state.concurrency.get(database).unwrap_or(&0);
            if concurrency >= cap {
                continue;
            }
            let ratio = concurrency as f64 / cap as f64;
            let age = front.contrib.create_time;
            let better = match &best {
                None => true,
                Some((_, best_ratio, best_age)) => {
                    ratio < *best_ratio || (ratio == *best_ratio && age < *best_age)
                }
            };
            if better {
                best = Some((database.clone(), ratio, age));
            }
        }

        let (database, _, _) = best?;
        let request = state
            .input
            .get_mut(&database)
            .and_then(VecDeque::pop_front)
            .expect("the chosen queue has a front");
        *state.concurrency.entry(database.clone()).or_insert(0) += 1;
        state.in_progress.insert(
            request.contrib.id,
            InProgressEntry {
                database,
                cancel: request.cancel.clone(),
            },
        );
        Some(request)
    }

    /// Account a finished contribution and free its concurrency slot
    pub fn completed(&self, id: u32, final_contrib: TransactionContribInfo) -> ReplicaResult<()> {
        {
            let mut state = self.lock();
            let entry = state
                .in_progress
                .remove(&id)
                .ok_or_else(|| ReplicaError::not_found(format!("contribution {id}")))?;
            let slot = state.concurrency.entry(entry.database).or_insert(1);
            *slot = slot.saturating_sub(1);
            state.output.insert(id, final_contrib);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Locate a contribution wherever it currently sits
    pub async fn find(&self, id: u32) -> ReplicaResult<TransactionContribInfo> {
        {
            let state = self.lock();
            for queue in state.input.values() {
                if let Some(request) = queue.iter().find(|r| r.contrib.id == id) {
                    return Ok(request.contrib.clone());
                }
            }
            if let Some(snapshot) = state.output.get(&id) {
                return Ok(snapshot.clone());
            }
        }
        // Executing or historical: the persisted record is the truth
        self.db.contrib(id).await
    }

    /// Cancel a contribution.
    ///
    /// Deterministic while the request waits in the input queue; advisory
    /// while it is executing (the loader observes the flag at its next safe
    /// checkpoint). Completed contributions are returned as-is.
    pub async fn cancel(&self, id: u32) -> ReplicaResult<TransactionContribInfo> {
        let queued: Option<IngestRequest> = {
            let mut state = self.lock();
            let mut found = None;
            for queue in state.input.values_mut() {
                if let Some(position) = queue.iter().position(|r| r.contrib.id == id) {
                    found = queue.remove(position);
                    break;
                }
            }
            found
        };
        if let Some(mut request) = queued {
            request.cancel.cancel();
            request.contrib.status = ContribStatus::Cancelled;
            self.db.save_contrib(&request.contrib).await?;
            let snapshot = request.contrib.clone();
            self.lock().output.insert(id, request.contrib);
            debug!(id, "queued contribution cancelled");
            return Ok(snapshot);
        }

        let executing = {
            let state = self.lock();
            state.in_progress.get(&id).map(|entry| entry.cancel.clone())
        };
        if let Some(token) = executing {
            token.cancel();
            debug!(id, "cancellation requested for an executing contribution");
            return self.db.contrib(id).await;
        }

        {
            let state = self.lock();
            if let Some(snapshot) = state.output.get(&id) {
                return Ok(snapshot.clone());
            }
        }
        self.db.contrib(id).await
    }

    /// Number of contributions waiting in the input queues
    pub fn num_queued(&self) -> usize {
        self.lock().input.values().map(VecDeque::len).sum()
    }

    /// Number of contributions currently executing
    pub fn num_in_progress(&self) -> usize {
        self.lock().in_progress.len()
    }

    /// Current concurrency of one database (tests, census)
    pub fn concurrency_of(&self, database: &str) -> usize {
        *self.lock().concurrency.get(database).unwrap_or(&0)
    }
}
