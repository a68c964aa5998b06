//! # Worker Request Processor
//!
//! Priority queue of pending requests (stable FIFO within a priority
//! level), an in-progress set and a finished set, drained by a fixed pool
//! of executor tasks. Each request runs as a sequence of short execution
//! steps with cancellation observed between steps; a per-request expiration
//! timer finishes overdue requests with the `EXPIRED` code.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use replicore_shared::protocol::{
    Performance, ProtoStatus, ProtoStatusExt, ServiceStateResponseBody,
};

use crate::context::WorkerContext;
use crate::requests::{ExecState, WorkerRequest};

/// One queued/executing/finished request, shared between the executor, the
/// wire server and the timers
pub type SharedWorkerRequest = Arc<tokio::sync::Mutex<WorkerRequest>>;

/// Queue key: highest priority first, then submission order
type PendingKey = (Reverse<i32>, u64);

/// Operating state of the processor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Suspended,
    Draining,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Running => "RUNNING",
            ServiceState::Suspended => "SUSPENDED",
            ServiceState::Draining => "DRAINING",
        }
    }
}

/// Outcome of a submission
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted,
    /// An equivalent request is already active; its id is returned
    Duplicate(String),
}

/// A point-in-time view of one request
#[derive(Clone, Debug)]
pub struct StatusSnapshot {
    pub id: String,
    pub status: ProtoStatus,
    pub status_ext: ProtoStatusExt,
    pub error: String,
    pub performance: Performance,
    /// Serialized payload body; meaningful once the request finished
    pub body: Bytes,
}

#[derive(Debug)]
struct ProcessorState {
    service_state: ServiceState,
    seq: u64,
    pending: BTreeMap<PendingKey, (String, SharedWorkerRequest)>,
    pending_ids: HashMap<String, PendingKey>,
    in_progress: HashMap<String, SharedWorkerRequest>,
    finished: HashMap<String, SharedWorkerRequest>,
    /// Equivalence key of every active (pending or executing) request
    equivalence: HashMap<String, String>,
}

impl ProcessorState {
    fn new() -> Self {
        Self {
            service_state: ServiceState::Running,
            seq: 0,
            pending: BTreeMap::new(),
            pending_ids: HashMap::new(),
            in_progress: HashMap::new(),
            finished: HashMap::new(),
            equivalence: HashMap::new(),
        }
    }

    fn remove_pending(&mut self, id: &str) -> Option<SharedWorkerRequest> {
        let key = self.pending_ids.remove(id)?;
        let (_, shared) = self
            .pending
            .remove(&key)
            .expect("pending_ids and pending stay in sync");
        Some(shared)
    }
}

/// The per-worker request processor
#[derive(Debug)]
pub struct WorkerProcessor {
    ctx: Arc<WorkerContext>,
    state: std::sync::Mutex<ProcessorState>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl WorkerProcessor {
    pub fn new(ctx: Arc<WorkerContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            state: std::sync::Mutex::new(ProcessorState::new()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the executor pool; size is `worker.num-svc-processing-threads`
    pub fn start(self: &Arc<Self>) {
        for worker_index in 0..self.ctx.config.worker.num_svc_processing_threads {
            let processor = Arc::clone(self);
            tokio::spawn(async move {
                processor.executor_loop(worker_index).await;
            });
        }
    }

    /// Stop the executor pool
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProcessorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a request; duplicates of an active equivalent operation are
    /// answered with the prior request's id.
    pub fn submit(self: &Arc<Self>, mut request: WorkerRequest, timeout_sec: u32) -> SubmitOutcome {
        let id = request.id.clone();
        let priority = request.priority as i32;
        let equivalence_key = request.kind.equivalence_key();
        request.status = ProtoStatus::Queued;
        let shared = Arc::new(tokio::sync::Mutex::new(request));
        {
            let mut state = self.lock();
            if let Some(key) = &equivalence_key {
                if let Some(prior) = state.equivalence.get(key) {
                    debug!(id = %id, prior = %prior, "duplicate request detected");
                    return SubmitOutcome::Duplicate(prior.clone());
                }
                state.equivalence.insert(key.clone(), id.clone());
            }
            state.seq += 1;
            let key = (Reverse(priority), state.seq);
            state.pending.insert(key, (id.clone(), shared));
            state.pending_ids.insert(id.clone(), key);
        }
        self.notify.notify_one();

        if timeout_sec > 0 {
            let processor = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(u64::from(timeout_sec))).await;
                processor.expire(&id).await;
            });
        }
        SubmitOutcome::Submitted
    }

    /// Current status of a request wherever it sits
    pub async fn check_status(&self, id: &str) -> Option<StatusSnapshot> {
        let shared = self.find(id)?;
        Some(Self::snapshot(&shared).await)
    }

    /// Best-effort cancellation.
    ///
    /// Deterministic for pending requests (moved straight to the finished
    /// set as `CANCELLED`), advisory for executing ones (the executor
    /// observes the flag at its next checkpoint), and a plain status read
    /// for finished ones.
    pub async fn stop_request(&self, id: &str) -> Option<StatusSnapshot> {
        let pending = {
            let mut state = self.lock();
            let shared = state.remove_pending(id);
            if let Some(shared) = &shared {
                state.finished.insert(id.to_string(), Arc::clone(shared));
            }
            shared
        };
        if let Some(shared) = pending {
            {
                let mut request = shared.lock().await;
                if let Err(e) = request.cancel() {
                    warn!(id = %id, "cancel of a pending request failed: {e}");
                }
                request.performance.set_update_finish();
            }
            self.remove_equivalence(id);
            return Some(Self::snapshot(&shared).await);
        }

        let active = {
            let state = self.lock();
            state
                .in_progress
                .get(id)
                .or_else(|| state.finished.get(id))
                .cloned()
        };
        if let Some(shared) = active {
            {
                let mut request = shared.lock().await;
                if !request.is_finished() {
                    if let Err(e) = request.cancel() {
                        warn!(id = %id, "cancel of an executing request failed: {e}");
                    }
                }
            }
            return Some(Self::snapshot(&shared).await);
        }
        None
    }

    /// Expiration-timer callback: finish an overdue request with `EXPIRED`
    pub async fn expire(&self, id: &str) {
        let pending = {
            let mut state = self.lock();
            let shared = state.remove_pending(id);
            if let Some(shared) = &shared {
                state.finished.insert(id.to_string(), Arc::clone(shared));
            }
            shared
        };
        if let Some(shared) = pending {
            {
                let mut request = shared.lock().await;
                request.expired = true;
                request.finish(
                    ProtoStatus::Failed,
                    ProtoStatusExt::Expired,
                    "request expired in the queue".to_string(),
                );
            }
            self.remove_equivalence(id);
            info!(id = %id, "pending request expired");
            return;
        }

        let in_progress = {
            let state = self.lock();
            state.in_progress.get(id).cloned()
        };
        if let Some(shared) = in_progress {
            let mut request = shared.lock().await;
            if !request.is_finished() {
                request.expired = true;
                if let Err(e) = request.cancel() {
                    warn!(id = %id, "expiration cancel failed: {e}");
                }
                info!(id = %id, "executing request marked for expiration");
            }
        }
    }

    /// Garbage-collect finished requests; returns per-id success
    pub fn dispose(&self, ids: &[String]) -> Vec<(String, bool)> {
        let mut state = self.lock();
        ids.iter()
            .map(|id| (id.clone(), state.finished.remove(id).is_some()))
            .collect()
    }

    /// Change the operating state; draining cancels everything in flight
    pub async fn set_service_state(&self, service_state: ServiceState) {
        let to_cancel: Vec<(String, SharedWorkerRequest)> = {
            let mut state = self.lock();
            state.service_state = service_state;
            if service_state == ServiceState::Draining {
                let drained: Vec<(String, SharedWorkerRequest)> =
                    state.pending.values().cloned().collect();
                state.pending.clear();
                state.pending_ids.clear();
                let mut requests = drained;
                for (id, shared) in state.in_progress.iter() {
                    requests.push((id.clone(), Arc::clone(shared)));
                }
                requests
            } else {
                Vec::new()
            }
        };
        for (id, shared) in to_cancel {
            let mut request = shared.lock().await;
            if request.is_finished() {
                continue;
            }
            if let Err(e) = request.cancel() {
                warn!(id = %id, "drain cancel failed: {e}");
                continue;
            }
            if request.status == ProtoStatus::Cancelled {
                // Straight from the queue; account it as finished
                request.performance.set_update_finish();
                drop(request);
                self.remove_equivalence(&id);
                let mut state = self.lock();
                state.finished.insert(id, shared.clone());
            }
        }
        self.notify.notify_waiters();
    }

    pub fn service_state(&self) -> ServiceState {
        self.lock().service_state
    }

    /// Census of the processor's queues for the service status operations
    pub async fn census(&self, with_requests: bool) -> ServiceStateResponseBody {
        let (state_str, pending, in_progress, finished) = {
            let state = self.lock();
            (
                state.service_state.as_str().to_string(),
                state
                    .pending
                    .values()
                    .map(|(_, shared)| Arc::clone(shared))
                    .collect::<Vec<_>>(),
                state.in_progress.values().cloned().collect::<Vec<_>>(),
                state.finished.values().cloned().collect::<Vec<_>>(),
            )
        };
        let mut body = ServiceStateResponseBody {
            state: state_str,
            num_new_requests: pending.len() as u64,
            num_in_progress_requests: in_progress.len() as u64,
            num_finished_requests: finished.len() as u64,
            ..ServiceStateResponseBody::default()
        };
        if with_requests {
            for shared in pending {
                body.new_requests.push(shared.lock().await.summary());
            }
            for shared in in_progress {
                body.in_progress_requests.push(shared.lock().await.summary());
            }
            for shared in finished {
                body.finished_requests.push(shared.lock().await.summary());
            }
        }
        body
    }

    // -- internals ---------------------------------------------------------

    fn find(&self, id: &str) -> Option<SharedWorkerRequest> {
        let state = self.lock();
        if let Some(key) = state.pending_ids.get(id) {
            return state.pending.get(key).map(|(_, shared)| Arc::clone(shared));
        }
        state
            .in_progress
            .get(id)
            .or_else(|| state.finished.get(id))
            .cloned()
    }

    async fn snapshot(shared: &SharedWorkerRequest) -> StatusSnapshot {
        let request = shared.lock().await;
        StatusSnapshot {
            id: request.id.clone(),
            status: request.status,
            status_ext: request.status_ext,
            error: request.error.clone(),
            performance: request.performance,
            body: request.kind.response_body(),
        }
    }

    fn remove_equivalence(&self, id: &str) {
        let mut state = self.lock();
        state.equivalence.retain(|_, active_id| active_id != id);
    }

    async fn next_pending(&self) -> Option<SharedWorkerRequest> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            {
                let mut state = self.lock();
                if state.service_state == ServiceState::Running {
                    if let Some((&key, _)) = state.pending.iter().next() {
                        let (id, shared) = state
                            .pending
                            .remove(&key)
                            .expect("key was just observed under the lock");
                        state.pending_ids.remove(&id);
                        state.in_progress.insert(id, Arc::clone(&shared));
                        return Some(shared);
                    }
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    async fn executor_loop(self: Arc<Self>, worker_index: usize) {
        debug!(worker_index, "request executor started");
        while let Some(shared) = self.next_pending().await {
            let id = {
                let mut request = shared.lock().await;
                let id = request.id.clone();
                if request.status == ProtoStatus::Cancelled {
                    // Cancelled between claim and execution
                    request.performance.set_update_finish();
                } else {
                    request.status = ProtoStatus::InProgress;
                    request.performance.set_update_start();
                    drop(request);
                    self.run_to_completion(&shared).await;
                }
                id
            };
            self.move_to_finished(&id, &shared).await;
        }
        debug!(worker_index, "request executor stopped");
    }

    async fn run_to_completion(&self, shared: &SharedWorkerRequest) {
        loop {
            let mut request = shared.lock().await;
            if request.status == ProtoStatus::IsCancelling {
                if request.expired {
                    request.finish(
                        ProtoStatus::Failed,
                        ProtoStatusExt::Expired,
                        "request expired while executing".to_string(),
                    );
                } else {
                    request.finish(ProtoStatus::Cancelled, ProtoStatusExt::None, String::new());
                }
                return;
            }
            match request.execute_step(&self.ctx).await {
                Ok(ExecState::Continue) => {
                    drop(request);
                    tokio::task::yield_now().await;
                }
                Ok(ExecState::Done) => {
                    request.finish(ProtoStatus::Success, ProtoStatusExt::None, String::new());
                    return;
                }
                Ok(ExecState::Cancelled) => {
                    request.finish(ProtoStatus::Cancelled, ProtoStatusExt::None, String::new());
                    return;
                }
                Err(e) => {
                    warn!(id = %request.id, ext = %e.ext, "request failed: {}", e.source);
                    request.finish(ProtoStatus::Failed, e.ext, e.source.to_string());
                    return;
                }
            }
        }
    }

    async fn move_to_finished(&self, id: &str, shared: &SharedWorkerRequest) {
        {
            let mut state = self.lock();
            state.in_progress.remove(id);
            state.finished.insert(id.to_string(), Arc::clone(shared));
        }
        self.remove_equivalence(id);
    }
}
