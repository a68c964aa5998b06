//! Worker-side request family.
//!
//! A [`WorkerRequest`] owns the public state machine shared by every
//! operation kind: `CREATED/QUEUED → IN_PROGRESS → (IS_CANCELLING →)?
//! terminal`, with the terminal statuses mirrored on the wire. Only the
//! payload handlers differ between kinds; they are dispatched through the
//! [`WorkerRequestKind`] enum.
//!
//! Cancellation is not exceptional control flow: `execute()` returns an
//! explicit [`ExecState`], and the executor observes cancellation between
//! steps.

pub mod delete;
pub mod echo;
pub mod find;
pub mod find_all;
pub mod index;
pub mod replicate;
pub mod sql;

use bytes::Bytes;

use replicore_shared::errors::{ReplicaError, ReplicaResult};
use replicore_shared::protocol::{
    encode_body, Performance, Priority, ProtoRequestSummary, ProtoStatus, ProtoStatusExt,
    QueuedRequestKind,
};

use crate::context::WorkerContext;

/// Outcome of one execution step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecState {
    /// More steps remain; the executor re-checks cancellation and calls
    /// `execute()` again
    Continue,
    /// The operation completed; the kind has produced its payload
    Done,
    /// The operation observed a cancellation checkpoint
    Cancelled,
}

/// A failed execution step: the extended wire code plus the underlying error
#[derive(Debug)]
pub struct ExecError {
    pub ext: ProtoStatusExt,
    pub source: ReplicaError,
}

impl ExecError {
    pub fn with(ext: ProtoStatusExt, source: ReplicaError) -> Self {
        Self { ext, source }
    }
}

impl From<ReplicaError> for ExecError {
    fn from(source: ReplicaError) -> Self {
        let ext = match &source {
            ReplicaError::IoError(_) => ProtoStatusExt::FileRead,
            ReplicaError::InvalidArgument(_) => ProtoStatusExt::InvalidParam,
            ReplicaError::NotFound(_) => ProtoStatusExt::InvalidParam,
            ReplicaError::WorkerError(_) => ProtoStatusExt::SqlError,
            _ => ProtoStatusExt::None,
        };
        Self { ext, source }
    }
}

/// Result of one execution step
pub type ExecResult = Result<ExecState, ExecError>;

/// Outcome of a [`WorkerRequest::rollback`] call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The request returned to `CREATED` and may be re-queued
    Restarted,
    /// A cancellation was pending; the request is now `CANCELLED`
    Cancelled,
}

/// Payload-kind dispatch of the request family
#[derive(Debug)]
pub enum WorkerRequestKind {
    Echo(echo::EchoWorker),
    Find(find::FindWorker),
    FindAll(find_all::FindAllWorker),
    Replicate(replicate::ReplicateWorker),
    Delete(delete::DeleteWorker),
    Sql(sql::SqlWorker),
    Index(index::DirectorIndexWorker),
}

impl WorkerRequestKind {
    pub fn tag(&self) -> QueuedRequestKind {
        match self {
            WorkerRequestKind::Echo(_) => QueuedRequestKind::TestEcho,
            WorkerRequestKind::Find(_) => QueuedRequestKind::ReplicaFind,
            WorkerRequestKind::FindAll(_) => QueuedRequestKind::ReplicaFindAll,
            WorkerRequestKind::Replicate(_) => QueuedRequestKind::ReplicaCreate,
            WorkerRequestKind::Delete(_) => QueuedRequestKind::ReplicaDelete,
            WorkerRequestKind::Sql(_) => QueuedRequestKind::Sql,
            WorkerRequestKind::Index(_) => QueuedRequestKind::Index,
        }
    }

    async fn execute(&mut self, ctx: &WorkerContext) -> ExecResult {
        match self {
            WorkerRequestKind::Echo(k) => k.execute().await,
            WorkerRequestKind::Find(k) => k.execute(ctx).await,
            WorkerRequestKind::FindAll(k) => k.execute(ctx).await,
            WorkerRequestKind::Replicate(k) => k.execute(ctx).await,
            WorkerRequestKind::Delete(k) => k.execute(ctx).await,
            WorkerRequestKind::Sql(k) => k.execute(ctx).await,
            WorkerRequestKind::Index(k) => k.execute(ctx).await,
        }
    }

    /// The serialized response payload in the kind's current state
    pub fn response_body(&self) -> Bytes {
        match self {
            WorkerRequestKind::Echo(k) => encode_body(&k.response()),
            WorkerRequestKind::Find(k) => encode_body(&k.response()),
            WorkerRequestKind::FindAll(k) => encode_body(&k.response()),
            WorkerRequestKind::Replicate(k) => encode_body(&k.response()),
            WorkerRequestKind::Delete(k) => encode_body(&k.response()),
            WorkerRequestKind::Sql(k) => encode_body(&k.response()),
            WorkerRequestKind::Index(k) => encode_body(&k.response()),
        }
    }

    /// A key identifying operations the worker deduplicates: a second
    /// request with the same key is answered with the prior request's id
    pub fn equivalence_key(&self) -> Option<String> {
        match self {
            WorkerRequestKind::Replicate(k) => Some(format!(
                "create:{}:{}:{}",
                k.database, k.chunk, k.worker_from
            )),
            WorkerRequestKind::Delete(k) => Some(format!("delete:{}:{}", k.database, k.chunk)),
            _ => None,
        }
    }
}

/// One request at the worker
#[derive(Debug)]
pub struct WorkerRequest {
    pub id: String,
    pub priority: Priority,
    pub status: ProtoStatus,
    pub status_ext: ProtoStatusExt,
    pub error: String,
    pub performance: Performance,
    /// Set by the expiration timer so the terminal status reports `EXPIRED`
    pub expired: bool,
    pub kind: WorkerRequestKind,
}

impl WorkerRequest {
    pub fn new(id: String, priority: Priority, kind: WorkerRequestKind) -> Self {
        Self {
            id,
            priority,
            status: ProtoStatus::Created,
            status_ext: ProtoStatusExt::None,
            error: String::new(),
            performance: Performance::new(),
            expired: false,
            kind,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            ProtoStatus::Success | ProtoStatus::Failed | ProtoStatus::Bad | ProtoStatus::Cancelled
        )
    }

    /// Request cancellation.
    ///
    /// Pending and already-cancelled requests latch `CANCELLED` directly;
    /// executing requests transition to `IS_CANCELLING` and the executor
    /// observes the flag at its next checkpoint. Any other state is a logic
    /// error of the caller.
    pub fn cancel(&mut self) -> ReplicaResult<()> {
        match self.status {
            ProtoStatus::Created | ProtoStatus::Queued | ProtoStatus::Cancelled => {
                self.status = ProtoStatus::Cancelled;
                Ok(())
            }
            ProtoStatus::InProgress | ProtoStatus::IsCancelling => {
                self.status = ProtoStatus::IsCancelling;
                Ok(())
            }
            other => Err(ReplicaError::illegal_state(format!(
                "cancel() of request '{}' in state {other}",
                self.id
            ))),
        }
    }

    /// Return a preempted request to the queueable state.
    pub fn rollback(&mut self) -> ReplicaResult<RollbackOutcome> {
        match self.status {
            ProtoStatus::Created | ProtoStatus::Queued | ProtoStatus::InProgress => {
                self.status = ProtoStatus::Created;
                Ok(RollbackOutcome::Restarted)
            }
            ProtoStatus::IsCancelling => {
                self.status = ProtoStatus::Cancelled;
                Ok(RollbackOutcome::Cancelled)
            }
            other => Err(ReplicaError::illegal_state(format!(
                "rollback() of request '{}' in state {other}",
                self.id
            ))),
        }
    }

    /// Run one step of the operation. The caller must have set the status
    /// to `IN_PROGRESS` beforehand and owns the checkpoint discipline.
    pub async fn execute_step(&mut self, ctx: &WorkerContext) -> ExecResult {
        self.kind.execute(ctx).await
    }

    /// Latch a terminal status and its bookkeeping
    pub fn finish(&mut self, status: ProtoStatus, status_ext: ProtoStatusExt, error: String) {
        self.status = status;
        self.status_ext = status_ext;
        self.error = error;
        self.performance.set_update_finish();
    }

    pub fn summary(&self) -> ProtoRequestSummary {
        ProtoRequestSummary {
            id: self.id.clone(),
            queued_type: self.kind.tag() as i32,
            priority: self.priority as i32,
            status: self.status as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> WorkerRequest {
        WorkerRequest::new(
            "r1".into(),
            Priority::Normal,
            WorkerRequestKind::Echo(echo::EchoWorker::new("hi".into(), 0)),
        )
    }

    #[test]
    fn test_cancel_of_pending_is_deterministic() {
        let mut r = request();
        r.cancel().unwrap();
        assert_eq!(r.status, ProtoStatus::Cancelled);
        // Idempotent from CANCELLED
        r.cancel().unwrap();
        assert_eq!(r.status, ProtoStatus::Cancelled);
    }

    #[test]
    fn test_cancel_of_running_is_advisory() {
        let mut r = request();
        r.status = ProtoStatus::InProgress;
        r.cancel().unwrap();
        assert_eq!(r.status, ProtoStatus::IsCancelling);
        r.cancel().unwrap();
        assert_eq!(r.status, ProtoStatus::IsCancelling);
    }

    #[test]
    fn test_cancel_of_finished_raises() {
        let mut r = request();
        r.status = ProtoStatus::Success;
        assert!(r.cancel().is_err());
    }

    #[test]
    fn test_rollback_restarts_running_request() {
        let mut r = request();
        r.status = ProtoStatus::InProgress;
        assert_eq!(r.rollback().unwrap(), RollbackOutcome::Restarted);
        assert_eq!(r.status, ProtoStatus::Created);
    }

    #[test]
    fn test_rollback_of_cancelling_request_cancels() {
        let mut r = request();
        r.status = ProtoStatus::IsCancelling;
        assert_eq!(r.rollback().unwrap(), RollbackOutcome::Cancelled);
        assert_eq!(r.status, ProtoStatus::Cancelled);
    }

    #[test]
    fn test_rollback_of_finished_raises() {
        let mut r = request();
        r.status = ProtoStatus::Failed;
        assert!(r.rollback().is_err());
    }

    #[test]
    fn test_finish_stamps_performance() {
        let mut r = request();
        r.status = ProtoStatus::InProgress;
        r.finish(ProtoStatus::Success, ProtoStatusExt::None, String::new());
        assert!(r.is_finished());
        assert!(r.performance.finish_time > 0);
    }
}
