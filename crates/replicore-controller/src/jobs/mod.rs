//! # Job Family
//!
//! Controller-level aggregates over many requests. The shared core owns the
//! `CREATED → IN_PROGRESS → FINISHED` transitions, the heartbeat and
//! expiration timers and the child-request registry; each concrete job
//! contributes its planning and completion predicate.
//!
//! Every started job is driven by one owning task that races the job body
//! against cancellation and the expiration deadline; both interruptions
//! cancel the precursor job (if any) and every running child request before
//! the terminal state is latched.

pub mod find_all;
pub mod fixup;
pub mod index;
pub mod purge;
pub mod rebalance;
pub mod replicate;
pub mod sql;
pub mod verify;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use replicore_shared::database::JobPersistentState;
use replicore_shared::errors::{ReplicaError, ReplicaResult};
use replicore_shared::protocol::{now_ms, Priority, SqlRequestBody};
use replicore_shared::replica::ReplicaInfo;

use crate::controller::Controller;
use crate::requests::{RequestHandle, RequestSpec, RequestStatus};

/// Primary state of a job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Created,
    InProgress,
    Finished,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::InProgress => "IN_PROGRESS",
            JobState::Finished => "FINISHED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refined state of a finished job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobExtendedState {
    None,
    Success,
    Failed,
    /// The query-service notification of a replica change failed
    QservFailed,
    /// The query service refused to release a replica still in use
    QservInUse,
    Expired,
    Cancelled,
}

impl JobExtendedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobExtendedState::None => "NONE",
            JobExtendedState::Success => "SUCCESS",
            JobExtendedState::Failed => "FAILED",
            JobExtendedState::QservFailed => "QSERV_FAILED",
            JobExtendedState::QservInUse => "QSERV_IN_USE",
            JobExtendedState::Expired => "EXPIRED",
            JobExtendedState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobExtendedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job scheduling options
#[derive(Clone, Copy, Debug)]
pub struct JobOptions {
    pub priority: Priority,
    pub exclusive: bool,
    pub preemptable: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: Priority::default(),
            exclusive: false,
            preemptable: true,
        }
    }
}

/// Submission parameters of one job
#[derive(Clone, Debug, Default)]
pub struct JobSpec {
    pub options: JobOptions,
    pub parent_job_id: Option<String>,
}

/// The job kinds of the family
#[derive(Clone, Debug)]
pub enum JobKind {
    /// Census sweep over every worker and database of a family
    FindAll { family: String, save_replica_info: bool },
    /// Restore chunk co-location in a family
    FixUp { family: String },
    /// Bring every chunk up to the family's replication level
    Replicate { family: String },
    /// Even out chunk holdings across the worker fleet
    Rebalance { family: String },
    /// Remove replicas beyond the family's replication level
    Purge { family: String },
    /// Re-verify replicas with control sums and flag inconsistencies
    Verify { family: String },
    /// Broadcast one SQL operation to every worker
    SqlBroadcast { body: SqlRequestBody },
    /// Extract and consolidate the director index of a database
    DirectorIndex {
        database: String,
        has_transactions: bool,
        transaction_id: u32,
    },
}

impl JobKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::FindAll { .. } => "FIND_ALL",
            JobKind::FixUp { .. } => "FIXUP",
            JobKind::Replicate { .. } => "REPLICATE",
            JobKind::Rebalance { .. } => "REBALANCE",
            JobKind::Purge { .. } => "PURGE",
            JobKind::Verify { .. } => "VERIFY",
            JobKind::SqlBroadcast { .. } => "SQL_BROADCAST",
            JobKind::DirectorIndex { .. } => "DIRECTOR_INDEX",
        }
    }
}

/// Kind-specific result data of a finished job
#[derive(Clone, Debug, Default)]
pub enum JobResultData {
    #[default]
    None,
    /// Aggregated replica census
    Census(Vec<ReplicaInfo>),
    /// Kind-specific counters
    Stats(Value),
    /// Consolidated director-index file
    Index { file: std::path::PathBuf, total_bytes: u64 },
}

/// Outcome of a job body
#[derive(Debug)]
pub struct JobOutcome {
    pub extended: JobExtendedState,
    pub result: JobResultData,
    pub log: Vec<(String, Value)>,
}

#[derive(Clone, Debug)]
pub struct JobStatus {
    pub state: JobState,
    pub extended_state: JobExtendedState,
    pub begin_time: u64,
    pub end_time: u64,
    pub heartbeat_time: u64,
    pub result: JobResultData,
    /// Event entries persisted alongside the job for post-mortems
    pub log: Vec<(String, Value)>,
}

pub(crate) struct JobInner {
    pub id: String,
    pub kind: JobKind,
    pub options: JobOptions,
    pub parent_job_id: Option<String>,
    status: std::sync::Mutex<JobStatus>,
    children: std::sync::Mutex<HashMap<String, RequestHandle>>,
    child_jobs: std::sync::Mutex<Vec<JobHandle>>,
    cancel: CancellationToken,
    finished_tx: watch::Sender<bool>,
    finished_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for JobInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobInner")
            .field("id", &self.id)
            .field("kind", &self.kind.type_name())
            .finish()
    }
}

/// The shareable handle onto one job
#[derive(Clone, Debug)]
pub struct JobHandle {
    pub(crate) inner: Arc<JobInner>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn type_name(&self) -> &'static str {
        self.inner.kind.type_name()
    }

    pub fn status(&self) -> JobStatus {
        self.inner.lock_status().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.status().state == JobState::Finished
    }

    /// Event entries recorded by the job, e.g. `failed-worker`
    pub fn persistent_log_data(&self) -> Vec<(String, Value)> {
        self.status().log
    }

    pub async fn wait(&self) {
        let mut rx = self.inner.finished_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Idempotent, non-blocking cancellation of the job, its precursor and
    /// every running child
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }
}

impl JobInner {
    fn lock_status(&self) -> std::sync::MutexGuard<'_, JobStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn register_child(&self, child: &RequestHandle) {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(child.id().to_string(), child.clone());
    }

    pub(crate) fn register_child_job(&self, child: &JobHandle) {
        self.child_jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(child.clone());
    }

    fn cancel_children(&self) {
        for child in self
            .child_jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
        {
            child.cancel();
        }
        for child in self
            .children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
        {
            child.cancel();
        }
    }

    fn persistent_state(&self) -> JobPersistentState {
        let status = self.lock_status();
        JobPersistentState {
            id: self.id.clone(),
            parent_id: self.parent_job_id.clone(),
            kind: self.kind.type_name().to_string(),
            state: status.state.as_str().to_string(),
            extended_state: status.extended_state.as_str().to_string(),
            priority: self.options.priority as i32,
            exclusive: self.options.exclusive,
            preemptable: self.options.preemptable,
            begin_time: status.begin_time,
            end_time: status.end_time,
            heartbeat_time: status.heartbeat_time,
        }
    }
}

/// Create, register and start one job under its owning driver task
pub(crate) fn start_job(
    controller: Arc<Controller>,
    kind: JobKind,
    spec: JobSpec,
) -> ReplicaResult<JobHandle> {
    let (finished_tx, finished_rx) = watch::channel(false);
    let inner = Arc::new(JobInner {
        id: Uuid::new_v4().to_string(),
        kind,
        options: spec.options,
        parent_job_id: spec.parent_job_id,
        status: std::sync::Mutex::new(JobStatus {
            state: JobState::Created,
            extended_state: JobExtendedState::None,
            begin_time: 0,
            end_time: 0,
            heartbeat_time: 0,
            result: JobResultData::None,
            log: Vec::new(),
        }),
        children: std::sync::Mutex::new(HashMap::new()),
        child_jobs: std::sync::Mutex::new(Vec::new()),
        cancel: CancellationToken::new(),
        finished_tx,
        finished_rx,
    });
    let handle = JobHandle {
        inner: Arc::clone(&inner),
    };

    let driver_handle = handle.clone();
    tokio::spawn(async move {
        drive_job(controller, driver_handle).await;
    });
    Ok(handle)
}

async fn drive_job(controller: Arc<Controller>, handle: JobHandle) {
    let inner = &handle.inner;
    let config = &controller.provider.config;
    {
        let mut status = inner.lock_status();
        status.state = JobState::InProgress;
        status.begin_time = now_ms();
        status.heartbeat_time = status.begin_time;
    }
    persist_job(inner, &controller).await;
    info!(id = %inner.id, kind = %inner.kind.type_name(), "job started");

    // Heartbeats let operators distinguish a stuck job from a dead
    // controller
    let heartbeat_ival = config.controller.job_heartbeat_timeout_sec;
    let heartbeat = {
        let controller = Arc::clone(&controller);
        let inner = Arc::clone(inner);
        async move {
            if heartbeat_ival == 0 {
                std::future::pending::<()>().await;
            }
            let mut ticker = tokio::time::interval(Duration::from_secs(heartbeat_ival));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let time = now_ms();
                inner.lock_status().heartbeat_time = time;
                if let Err(e) = controller.provider.db.update_job_heartbeat(&inner.id, time).await {
                    warn!(id = %inner.id, "job heartbeat persist failed: {e}");
                }
            }
        }
    };

    let deadline_sec = config.controller.job_timeout_sec;
    let deadline = async move {
        if deadline_sec == 0 {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(Duration::from_secs(deadline_sec)).await;
    };

    let body = run_job_body(&controller, &handle);
    tokio::pin!(body);
    tokio::pin!(heartbeat);
    tokio::pin!(deadline);

    let outcome = tokio::select! {
        outcome = &mut body => outcome,
        _ = inner.cancel.cancelled() => {
            inner.cancel_children();
            JobOutcome {
                extended: JobExtendedState::Cancelled,
                result: JobResultData::None,
                log: vec![("cancelled".to_string(), Value::Null)],
            }
        }
        _ = &mut deadline => {
            inner.cancel_children();
            JobOutcome {
                extended: JobExtendedState::Expired,
                result: JobResultData::None,
                log: vec![("expired".to_string(), Value::Null)],
            }
        }
        _ = &mut heartbeat => unreachable!("the heartbeat loop never returns"),
    };

    {
        let mut status = inner.lock_status();
        status.end_time = now_ms();
        status.state = JobState::Finished;
        status.extended_state = outcome.extended;
        status.result = outcome.result;
        status.log.extend(outcome.log);
    }
    persist_job(inner, &controller).await;
    info!(
        id = %inner.id,
        kind = %inner.kind.type_name(),
        state = %outcome.extended,
        "job finished"
    );
    let _ = inner.finished_tx.send(true);
}

async fn run_job_body(controller: &Arc<Controller>, handle: &JobHandle) -> JobOutcome {
    let inner = &handle.inner;
    let result = match inner.kind.clone() {
        JobKind::FindAll {
            family,
            save_replica_info,
        } => find_all::run(controller, inner, &family, save_replica_info).await,
        JobKind::FixUp { family } => fixup::run(controller, inner, &family).await,
        JobKind::Replicate { family } => replicate::run(controller, inner, &family).await,
        JobKind::Rebalance { family } => rebalance::run(controller, inner, &family).await,
        JobKind::Purge { family } => purge::run(controller, inner, &family).await,
        JobKind::Verify { family } => verify::run(controller, inner, &family).await,
        JobKind::SqlBroadcast { body } => sql::run(controller, inner, body).await,
        JobKind::DirectorIndex {
            database,
            has_transactions,
            transaction_id,
        } => index::run(controller, inner, &database, has_transactions, transaction_id).await,
    };
    match result {
        Ok(outcome) => outcome,
        Err(e) => JobOutcome {
            extended: JobExtendedState::Failed,
            result: JobResultData::None,
            log: vec![(
                "error".to_string(),
                serde_json::json!({"message": e.to_string()}),
            )],
        },
    }
}

async fn persist_job(inner: &Arc<JobInner>, controller: &Arc<Controller>) {
    if let Err(e) = controller
        .provider
        .db
        .save_job_state(&inner.persistent_state())
        .await
    {
        warn!(id = %inner.id, "job state persist failed: {e}");
    }
}

/// One finished child as observed by the launcher
#[derive(Debug)]
pub(crate) struct ChildResult {
    pub worker: String,
    pub handle: RequestHandle,
    pub status: RequestStatus,
}

/// Launch requests with a per-destination-worker concurrency cap.
///
/// For each worker, up to `per_worker_cap` requests run concurrently; each
/// completion launches the worker's next queued request. Returns once every
/// request finished.
pub(crate) async fn launch_with_worker_caps(
    controller: &Arc<Controller>,
    inner: &Arc<JobInner>,
    specs: Vec<RequestSpec>,
    per_worker_cap: usize,
) -> ReplicaResult<Vec<ChildResult>> {
    let total = specs.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let cap = per_worker_cap.max(1);
    let mut queues: HashMap<String, VecDeque<RequestSpec>> = HashMap::new();
    for spec in specs {
        queues.entry(spec.worker.clone()).or_default().push_back(spec);
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<(String, RequestHandle)>();
    let launch = |spec: RequestSpec,
                  tx: mpsc::UnboundedSender<(String, RequestHandle)>|
     -> ReplicaResult<()> {
        let worker = spec.worker.clone();
        let handle = controller.submit_request(spec.job_id(inner.id.clone()))?;
        inner.register_child(&handle);
        let waiter_handle = handle.clone();
        tokio::spawn(async move {
            waiter_handle.wait().await;
            let _ = tx.send((worker, waiter_handle));
        });
        Ok(())
    };

    // The initial batch
    for queue in queues.values_mut() {
        for _ in 0..cap {
            match queue.pop_front() {
                Some(spec) => launch(spec, tx.clone())?,
                None => break,
            }
        }
    }

    let mut finished = Vec::with_capacity(total);
    while finished.len() < total {
        let (worker, handle) = rx
            .recv()
            .await
            .expect("the sender side lives in this scope");
        let status = handle.status();
        debug!(
            job = %inner.id,
            child = %handle.id(),
            worker = %worker,
            state = %status.extended_state,
            "child request finished"
        );
        finished.push(ChildResult {
            worker: worker.clone(),
            handle,
            status,
        });
        // A slot freed: launch the worker's next task
        if let Some(queue) = queues.get_mut(&worker) {
            if let Some(spec) = queue.pop_front() {
                launch(spec, tx.clone())?;
            }
        }
    }
    Ok(finished)
}

/// Run a precursor census job over one family and return the merged
/// replica collection
pub(crate) async fn family_census(
    controller: &Arc<Controller>,
    inner: &Arc<JobInner>,
    family: &str,
) -> ReplicaResult<Vec<ReplicaInfo>> {
    let precursor = start_job(
        Arc::clone(controller),
        JobKind::FindAll {
            family: family.to_string(),
            save_replica_info: true,
        },
        JobSpec {
            options: inner.options,
            parent_job_id: Some(inner.id.clone()),
        },
    )?;
    inner.register_child_job(&precursor);
    precursor.wait().await;
    let status = precursor.status();
    if status.extended_state != JobExtendedState::Success {
        return Err(ReplicaError::worker(format!(
            "precursor census job finished {}",
            status.extended_state
        )));
    }
    match status.result {
        JobResultData::Census(replicas) => Ok(replicas),
        _ => Err(ReplicaError::illegal_state(
            "census job returned no census data",
        )),
    }
}
