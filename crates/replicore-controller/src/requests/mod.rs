//! # Controller Request Family
//!
//! One class of state machine for every operation kind (replica creation,
//! deletion, lookup, census sweeps, echo probes, SQL maintenance and
//! director-index extraction). The shared core owns the
//! `CREATED → IN_PROGRESS → FINISHED` transitions, the tracking timer with
//! its doubling interval, the expiration deadline and the persistent-state
//! updates; only body serialization and success-payload handling differ by
//! kind.
//!
//! Each started request is driven by a single owning task that multiplexes
//! the worker's replies, the retry timer, the expiration deadline and the
//! cancellation token. Nothing else mutates the request, so no callback can
//! resurrect or race it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use replicore_shared::database::RequestPersistentState;
use replicore_shared::errors::{ReplicaError, ReplicaResult};
use replicore_shared::protocol::{
    decode_body, encode_body, DeleteRequestBody, DirectorIndexRequestBody,
    DirectorIndexResponseBody, DisposeRequestBody, EchoRequestBody, EchoResponseBody,
    FindAllRequestBody, FindRequestBody, ManagementRequestBody, ManagementRequestKind,
    Performance, Priority, ProtoStatus, ProtoStatusExt, QueuedRequestKind,
    ReplicaInfoCollectionResponseBody, ReplicaInfoResponseBody, ReplicationRequestBody,
    RequestCategory, RequestHeader, SqlRequestBody, SqlResponseBody,
};
use replicore_shared::replica::ReplicaInfo;

use crate::messenger::WireResponse;
use crate::service_provider::ServiceProvider;

/// Primary state of a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Created,
    InProgress,
    Finished,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Created => "CREATED",
            RequestState::InProgress => "IN_PROGRESS",
            RequestState::Finished => "FINISHED",
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refined state; latched exactly once when the request finishes. The
/// `Server*` values mirror the most recent worker-reported status and are
/// terminal only when tracking is off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtendedState {
    None,
    Success,
    ClientError,
    ServerBad,
    ServerError,
    ServerCreated,
    ServerQueued,
    ServerInProgress,
    ServerIsCancelling,
    ServerCancelled,
    TimeoutExpired,
    Cancelled,
}

impl ExtendedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtendedState::None => "NONE",
            ExtendedState::Success => "SUCCESS",
            ExtendedState::ClientError => "CLIENT_ERROR",
            ExtendedState::ServerBad => "SERVER_BAD",
            ExtendedState::ServerError => "SERVER_ERROR",
            ExtendedState::ServerCreated => "SERVER_CREATED",
            ExtendedState::ServerQueued => "SERVER_QUEUED",
            ExtendedState::ServerInProgress => "SERVER_IN_PROGRESS",
            ExtendedState::ServerIsCancelling => "SERVER_IS_CANCELLING",
            ExtendedState::ServerCancelled => "SERVER_CANCELLED",
            ExtendedState::TimeoutExpired => "TIMEOUT_EXPIRED",
            ExtendedState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ExtendedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation kind and its parameters
#[derive(Clone, Debug)]
pub enum RequestKind {
    Replicate {
        database: String,
        chunk: u32,
        worker_from: String,
    },
    Delete {
        database: String,
        chunk: u32,
    },
    Find {
        database: String,
        chunk: u32,
        compute_check_sum: bool,
    },
    FindAll {
        database: String,
        save_replica_info: bool,
    },
    Echo {
        data: String,
        delay_ms: u64,
    },
    Sql {
        body: SqlRequestBody,
    },
    DirectorIndex {
        database: String,
        director_table: String,
        chunk: u32,
        has_transactions: bool,
        transaction_id: u32,
    },
}

impl RequestKind {
    pub fn tag(&self) -> QueuedRequestKind {
        match self {
            RequestKind::Replicate { .. } => QueuedRequestKind::ReplicaCreate,
            RequestKind::Delete { .. } => QueuedRequestKind::ReplicaDelete,
            RequestKind::Find { .. } => QueuedRequestKind::ReplicaFind,
            RequestKind::FindAll { .. } => QueuedRequestKind::ReplicaFindAll,
            RequestKind::Echo { .. } => QueuedRequestKind::TestEcho,
            RequestKind::Sql { .. } => QueuedRequestKind::Sql,
            RequestKind::DirectorIndex { .. } => QueuedRequestKind::Index,
        }
    }

    /// Serialize the initial request body. `offset` advances the scan of a
    /// streaming director-index extraction and is ignored by other kinds.
    fn encode_initial_body(&self, offset: u64) -> Bytes {
        match self {
            RequestKind::Replicate {
                database,
                chunk,
                worker_from,
            } => encode_body(&ReplicationRequestBody {
                database: database.clone(),
                chunk: *chunk,
                worker_from: worker_from.clone(),
            }),
            RequestKind::Delete { database, chunk } => encode_body(&DeleteRequestBody {
                database: database.clone(),
                chunk: *chunk,
            }),
            RequestKind::Find {
                database,
                chunk,
                compute_check_sum,
            } => encode_body(&FindRequestBody {
                database: database.clone(),
                chunk: *chunk,
                compute_check_sum: *compute_check_sum,
            }),
            RequestKind::FindAll { database, .. } => encode_body(&FindAllRequestBody {
                database: database.clone(),
            }),
            RequestKind::Echo { data, delay_ms } => encode_body(&EchoRequestBody {
                data: data.clone(),
                delay_ms: *delay_ms,
            }),
            RequestKind::Sql { body } => encode_body(body),
            RequestKind::DirectorIndex {
                database,
                director_table,
                chunk,
                has_transactions,
                transaction_id,
            } => encode_body(&DirectorIndexRequestBody {
                database: database.clone(),
                director_table: director_table.clone(),
                chunk: *chunk,
                has_transactions: *has_transactions,
                transaction_id: *transaction_id,
                offset,
            }),
        }
    }
}

/// Success payload of a finished request
#[derive(Clone, Debug, Default)]
pub enum RequestPayload {
    #[default]
    None,
    Replica(ReplicaInfo),
    Replicas(Vec<ReplicaInfo>),
    Echo(String),
    Sql(SqlResponseBody),
    /// Consolidated director-index extraction
    Index { file: PathBuf, total_bytes: u64 },
}

/// Submission parameters of one request
#[derive(Clone, Debug)]
pub struct RequestSpec {
    pub worker: String,
    pub kind: RequestKind,
    pub priority: Priority,
    pub keep_tracking: bool,
    pub dispose_required: bool,
    pub job_id: Option<String>,
    /// Overrides `controller.request-timeout-sec` when set
    pub expiration_ival_sec: Option<u32>,
}

impl RequestSpec {
    pub fn new(worker: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            worker: worker.into(),
            kind,
            priority: Priority::default(),
            keep_tracking: true,
            dispose_required: true,
            job_id: None,
            expiration_ival_sec: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn keep_tracking(mut self, keep_tracking: bool) -> Self {
        self.keep_tracking = keep_tracking;
        self
    }

    pub fn dispose_required(mut self, dispose_required: bool) -> Self {
        self.dispose_required = dispose_required;
        self
    }

    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn expiration_ival_sec(mut self, ival: u32) -> Self {
        self.expiration_ival_sec = Some(ival);
        self
    }
}

/// Mutable state cell of a request
#[derive(Clone, Debug)]
pub struct RequestStatus {
    pub state: RequestState,
    pub extended_state: ExtendedState,
    /// Mirror of the worker's extended status enum
    pub extended_server_status: ProtoStatusExt,
    pub performance: Performance,
    /// The worker-side performance record of the operation
    pub remote_performance: Performance,
    pub error: String,
    pub payload: RequestPayload,
    pub duplicate_request_id: Option<String>,
    pub job_id: Option<String>,
}

pub(crate) struct RequestInner {
    pub id: String,
    pub worker: String,
    pub kind: RequestKind,
    pub priority: Priority,
    pub keep_tracking: bool,
    pub dispose_required: bool,
    pub expiration_ival_sec: Option<u32>,
    status: std::sync::Mutex<RequestStatus>,
    finished_tx: watch::Sender<bool>,
    finished_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RequestInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestInner")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .finish()
    }
}

/// The shareable handle onto one request
#[derive(Clone, Debug)]
pub struct RequestHandle {
    pub(crate) inner: Arc<RequestInner>,
}

impl RequestHandle {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn worker(&self) -> &str {
        &self.inner.worker
    }

    pub fn kind(&self) -> &RequestKind {
        &self.inner.kind
    }

    pub fn type_name(&self) -> &'static str {
        self.inner.kind.tag().as_str()
    }

    /// A consistent snapshot of the request's state
    pub fn status(&self) -> RequestStatus {
        self.inner.lock_status().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.status().state == RequestState::Finished
    }

    /// Block until the request finishes
    pub async fn wait(&self) {
        let mut rx = self.inner.finished_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Idempotent, non-blocking cancellation; completion is signalled
    /// through `wait()`
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }
}

impl RequestInner {
    fn lock_status(&self) -> std::sync::MutexGuard<'_, RequestStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persistent_state(&self) -> RequestPersistentState {
        let status = self.lock_status();
        RequestPersistentState {
            id: self.id.clone(),
            job_id: status.job_id.clone(),
            kind: self.kind.tag().as_str().to_string(),
            worker: self.worker.clone(),
            priority: self.priority as i32,
            state: status.state.as_str().to_string(),
            extended_state: status.extended_state.as_str().to_string(),
            server_status: status.extended_server_status.as_str().to_string(),
            performance: status.performance,
        }
    }

    /// The id the worker knows the operation by: the duplicate id when the
    /// worker reported one, this request's own id otherwise
    fn remote_id(&self) -> String {
        self.lock_status()
            .duplicate_request_id
            .clone()
            .unwrap_or_else(|| self.id.clone())
    }
}

/// What the driver should do after handling one reply
enum Next {
    Finish(ExtendedState),
    Track,
    /// Streaming extraction: dispose the finished server request and send
    /// the next slice request
    Resend,
}

/// Construct a request in the `CREATED` state
pub(crate) fn create_request(spec: &RequestSpec) -> RequestHandle {
    let (finished_tx, finished_rx) = watch::channel(false);
    let inner = Arc::new(RequestInner {
        id: Uuid::new_v4().to_string(),
        worker: spec.worker.clone(),
        kind: spec.kind.clone(),
        priority: spec.priority,
        keep_tracking: spec.keep_tracking,
        dispose_required: spec.dispose_required,
        expiration_ival_sec: spec.expiration_ival_sec,
        status: std::sync::Mutex::new(RequestStatus {
            state: RequestState::Created,
            extended_state: ExtendedState::None,
            extended_server_status: ProtoStatusExt::None,
            performance: Performance::new(),
            remote_performance: Performance::default(),
            error: String::new(),
            payload: RequestPayload::None,
            duplicate_request_id: None,
            job_id: spec.job_id.clone(),
        }),
        finished_tx,
        finished_rx,
        cancel: CancellationToken::new(),
    });
    RequestHandle { inner }
}

/// The single owning driver of one started request.
///
/// Runs until a terminal extended state is latched, then performs the
/// finish sequence: persist, unregister, signal waiters, request server
/// side disposal where due.
pub(crate) async fn drive(
    handle: RequestHandle,
    provider: Arc<ServiceProvider>,
    unregister: impl FnOnce(&str) + Send + 'static,
) {
    let inner = &handle.inner;
    let config = &provider.config;

    // Arm the deadline and mark the transition into IN_PROGRESS
    {
        let mut status = inner.lock_status();
        debug_assert_eq!(status.state, RequestState::Created);
        status.state = RequestState::InProgress;
        status.performance.set_update_start();
    }
    let expiration_sec = inner
        .expiration_ival_sec
        .unwrap_or(config.controller.request_timeout_sec as u32);
    persist(inner, &provider).await;

    let deadline = (expiration_sec > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs(u64::from(expiration_sec)));

    // Tracking timer: 1 s, doubling per probe, capped by the configured
    // retry interval
    let mut track_ival_ms: u64 = 1000;
    let cap_ms = 1000 * config.common.request_retry_interval_sec;
    let mut next_time_ival_msec = move || {
        let current = track_ival_ms;
        track_ival_ms = (track_ival_ms * 2).min(cap_ms.max(1000));
        current
    };

    let mut offset: u64 = 0;
    let mut index_file: Option<PathBuf> = None;
    let mut seen_by_worker = false;
    let mut exchange = Exchange::Initial;

    let terminal = loop {
        // Build the frame of the current exchange
        let (header, body) = match exchange {
            Exchange::Initial => (
                RequestHeader {
                    id: inner.id.clone(),
                    category: RequestCategory::Queued as i32,
                    queued_type: inner.kind.tag() as i32,
                    management_type: 0,
                    service_type: 0,
                    timeout_sec: expiration_sec,
                    priority: inner.priority as i32,
                    instance_id: config.common.instance_id.clone(),
                },
                inner.kind.encode_initial_body(offset),
            ),
            Exchange::Track => (
                RequestHeader {
                    id: inner.id.clone(),
                    category: RequestCategory::Request as i32,
                    queued_type: 0,
                    management_type: ManagementRequestKind::Track as i32,
                    service_type: 0,
                    timeout_sec: 0,
                    priority: inner.priority as i32,
                    instance_id: config.common.instance_id.clone(),
                },
                encode_body(&ManagementRequestBody {
                    target_id: inner.remote_id(),
                }),
            ),
        };

        let send = provider.messenger.send(&inner.worker, header, body);
        tokio::pin!(send);

        let response = tokio::select! {
            _ = inner.cancel.cancelled() => break ExtendedState::Cancelled,
            _ = sleep_until_opt(deadline) => break ExtendedState::TimeoutExpired,
            response = &mut send => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(id = %inner.id, worker = %inner.worker, "transport failure: {e}");
                break ExtendedState::ClientError;
            }
        };
        seen_by_worker = true;

        match handle_response(inner, &provider, response, &mut offset, &mut index_file).await {
            Ok(Next::Finish(extended)) => break extended,
            Ok(Next::Resend) => {
                // Dispose the completed server-side request before the next
                // slice re-uses the id
                dispose_at_worker(inner, &provider, Priority::VeryHigh).await;
                exchange = Exchange::Initial;
            }
            Ok(Next::Track) => {
                let ival = Duration::from_millis(next_time_ival_msec());
                tokio::select! {
                    _ = inner.cancel.cancelled() => break ExtendedState::Cancelled,
                    _ = sleep_until_opt(deadline) => break ExtendedState::TimeoutExpired,
                    _ = tokio::time::sleep(ival) => {}
                }
                exchange = Exchange::Track;
            }
            Err(e) => {
                error!(id = %inner.id, "protocol violation: {e}");
                break ExtendedState::ServerBad;
            }
        }
    };

    // Finish sequence: latch the terminal state before any signalling so
    // every observer sees a consistent snapshot
    {
        let mut status = inner.lock_status();
        status.performance.set_update_finish();
        status.state = RequestState::Finished;
        status.extended_state = terminal;
    }
    if terminal == ExtendedState::Cancelled && seen_by_worker {
        // Best-effort stop of the server-side request, no reply awaited
        stop_at_worker(inner, &provider).await;
    }
    persist(inner, &provider).await;
    unregister(&inner.id);
    if inner.dispose_required && seen_by_worker {
        dispose_at_worker(inner, &provider, Priority::VeryHigh).await;
    }
    info!(
        id = %inner.id,
        worker = %inner.worker,
        kind = %inner.kind.tag(),
        state = %terminal,
        "request finished"
    );
    let _ = inner.finished_tx.send(true);
}

enum Exchange {
    Initial,
    Track,
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Apply one worker reply to the request per the status-handler contract
async fn handle_response(
    inner: &RequestInner,
    provider: &Arc<ServiceProvider>,
    response: WireResponse,
    offset: &mut u64,
    index_file: &mut Option<PathBuf>,
) -> ReplicaResult<Next> {
    let status = response.header.status()?;
    let status_ext = response.header.status_ext();

    {
        let mut cell = inner.lock_status();
        cell.extended_server_status = status_ext;
        // A status probe's reply echoes the original operation's record
        let remote = response
            .header
            .target_performance
            .or(response.header.performance)
            .unwrap_or_default();
        cell.remote_performance = Performance::from(remote);
        if !response.header.error.is_empty() {
            cell.error = response.header.error.clone();
        }
        if status_ext == ProtoStatusExt::Duplicate
            && !response.header.duplicate_request_id.is_empty()
        {
            cell.duplicate_request_id = Some(response.header.duplicate_request_id.clone());
        }
    }

    match status {
        ProtoStatus::Success => handle_success(inner, provider, &response, offset, index_file).await,
        ProtoStatus::Created => Ok(keep_tracking_or(inner, ExtendedState::ServerCreated)),
        ProtoStatus::Queued => Ok(keep_tracking_or(inner, ExtendedState::ServerQueued)),
        ProtoStatus::InProgress => Ok(keep_tracking_or(inner, ExtendedState::ServerInProgress)),
        ProtoStatus::IsCancelling => {
            Ok(keep_tracking_or(inner, ExtendedState::ServerIsCancelling))
        }
        ProtoStatus::Bad => Ok(Next::Finish(ExtendedState::ServerBad)),
        ProtoStatus::Failed => Ok(Next::Finish(ExtendedState::ServerError)),
        ProtoStatus::Cancelled => Ok(Next::Finish(ExtendedState::ServerCancelled)),
    }
}

fn keep_tracking_or(inner: &RequestInner, extended: ExtendedState) -> Next {
    if inner.keep_tracking {
        Next::Track
    } else {
        Next::Finish(extended)
    }
}

/// Kind-specific success payload handling
async fn handle_success(
    inner: &RequestInner,
    provider: &Arc<ServiceProvider>,
    response: &WireResponse,
    offset: &mut u64,
    index_file: &mut Option<PathBuf>,
) -> ReplicaResult<Next> {
    match &inner.kind {
        RequestKind::Replicate { .. } | RequestKind::Delete { .. } | RequestKind::Find { .. } => {
            let body: ReplicaInfoResponseBody = decode_body(&response.body)?;
            let replica = body
                .replica
                .ok_or_else(|| ReplicaError::protocol("missing replica payload"))?;
            inner.lock_status().payload = RequestPayload::Replica(ReplicaInfo::try_from(replica)?);
            Ok(Next::Finish(ExtendedState::Success))
        }
        RequestKind::FindAll {
            database,
            save_replica_info,
        } => {
            let body: ReplicaInfoCollectionResponseBody = decode_body(&response.body)?;
            let replicas = body
                .replicas
                .into_iter()
                .map(ReplicaInfo::try_from)
                .collect::<ReplicaResult<Vec<_>>>()?;
            if *save_replica_info {
                if provider.config.database(database).is_err() {
                    // The database was dropped from the configuration while
                    // the sweep was in flight; the census is obsolete
                    warn!(
                        id = %inner.id,
                        database = %database,
                        "census not persisted: database no longer configured"
                    );
                } else if let Err(e) = provider
                    .db
                    .save_replica_info_collection(&inner.worker, database, &replicas)
                    .await
                {
                    error!(id = %inner.id, "census persist failed: {e}");
                    return Ok(Next::Finish(ExtendedState::ClientError));
                }
            }
            inner.lock_status().payload = RequestPayload::Replicas(replicas);
            Ok(Next::Finish(ExtendedState::Success))
        }
        RequestKind::Echo { .. } => {
            let body: EchoResponseBody = decode_body(&response.body)?;
            inner.lock_status().payload = RequestPayload::Echo(body.data);
            Ok(Next::Finish(ExtendedState::Success))
        }
        RequestKind::Sql { .. } => {
            let body: SqlResponseBody = decode_body(&response.body)?;
            inner.lock_status().payload = RequestPayload::Sql(body);
            Ok(Next::Finish(ExtendedState::Success))
        }
        RequestKind::DirectorIndex {
            database,
            director_table,
            chunk,
            ..
        } => {
            let body: DirectorIndexResponseBody = decode_body(&response.body)?;
            let file = match index_file {
                Some(file) => file.clone(),
                None => {
                    let dir = provider.config.database.qserv_master_tmp_dir.clone();
                    tokio::fs::create_dir_all(&dir).await?;
                    let file = dir.join(format!(
                        "idx-{database}-{director_table}-{chunk}-{}.csv",
                        inner.id
                    ));
                    // Truncate leftovers of an earlier attempt
                    tokio::fs::File::create(&file).await?;
                    *index_file = Some(file.clone());
                    file
                }
            };
            let mut out = tokio::fs::OpenOptions::new().append(true).open(&file).await?;
            out.write_all(&body.data).await?;
            out.flush().await?;
            *offset += body.data.len() as u64;

            if *offset >= body.total_bytes {
                inner.lock_status().payload = RequestPayload::Index {
                    file,
                    total_bytes: body.total_bytes,
                };
                Ok(Next::Finish(ExtendedState::Success))
            } else {
                debug!(
                    id = %inner.id,
                    offset = *offset,
                    total = body.total_bytes,
                    "requesting the next index slice"
                );
                Ok(Next::Resend)
            }
        }
    }
}

async fn persist(inner: &RequestInner, provider: &Arc<ServiceProvider>) {
    if let Err(e) = provider.db.save_request_state(&inner.persistent_state()).await {
        warn!(id = %inner.id, "request state persist failed: {e}");
    }
}

/// Best-effort `STOP` of the server-side request, no reply awaited
async fn stop_at_worker(inner: &RequestInner, provider: &Arc<ServiceProvider>) {
    let header = RequestHeader {
        id: format!("{}-stop", inner.id),
        category: RequestCategory::Request as i32,
        queued_type: 0,
        management_type: ManagementRequestKind::Stop as i32,
        service_type: 0,
        timeout_sec: 0,
        priority: inner.priority as i32,
        instance_id: provider.config.common.instance_id.clone(),
    };
    let body = encode_body(&ManagementRequestBody {
        target_id: inner.remote_id(),
    });
    if let Err(e) = provider.messenger.send_forget(&inner.worker, header, body).await {
        debug!(id = %inner.id, "stop frame not delivered: {e}");
    }
}

/// Fire a `DISPOSE` of this request's server-side record
async fn dispose_at_worker(
    inner: &RequestInner,
    provider: &Arc<ServiceProvider>,
    priority: Priority,
) {
    let header = RequestHeader {
        id: format!("{}-dispose", inner.id),
        category: RequestCategory::Request as i32,
        queued_type: 0,
        management_type: ManagementRequestKind::Dispose as i32,
        service_type: 0,
        timeout_sec: 0,
        priority: priority as i32,
        instance_id: provider.config.common.instance_id.clone(),
    };
    let body = encode_body(&DisposeRequestBody {
        ids: vec![inner.remote_id()],
    });
    if let Err(e) = provider.messenger.send_forget(&inner.worker, header, body).await {
        debug!(id = %inner.id, "dispose frame not delivered: {e}");
    }
}
