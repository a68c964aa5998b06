//! Management request family targeting the worker's embedded query service
//! over the HTTP side-channel.
//!
//! The family shares the shape of the wire request state machine (created,
//! in progress, finished with a refined state) but travels over plain HTTP
//! and never queues at the worker: each operation is a single round trip
//! with a deadline.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use replicore_shared::errors::{ReplicaError, ReplicaResult};
use replicore_shared::protocol::{now_ms, Performance};

use crate::service_provider::ServiceProvider;

/// Operation kinds of the management family
#[derive(Clone, Debug)]
pub enum MgtRequestKind {
    /// Round-trip probe of the management channel
    Echo { data: String },
    /// Census of the worker's request processor
    Status,
    /// Tell the query service a replica became available
    AddReplica { database: String, chunk: u32 },
    /// Tell the query service to release a replica
    RemoveReplica {
        database: String,
        chunk: u32,
        force: bool,
    },
}

impl MgtRequestKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            MgtRequestKind::Echo { .. } => "MGT_ECHO",
            MgtRequestKind::Status => "MGT_STATUS",
            MgtRequestKind::AddReplica { .. } => "MGT_ADD_REPLICA",
            MgtRequestKind::RemoveReplica { .. } => "MGT_REMOVE_REPLICA",
        }
    }

    fn route(&self) -> &'static str {
        match self {
            MgtRequestKind::Echo { .. } => "/mgt/echo",
            MgtRequestKind::Status => "/mgt/status",
            MgtRequestKind::AddReplica { .. } => "/mgt/replica/add",
            MgtRequestKind::RemoveReplica { .. } => "/mgt/replica/remove",
        }
    }

    fn body(&self) -> serde_json::Value {
        match self {
            MgtRequestKind::Echo { data } => json!({"data": data}),
            MgtRequestKind::Status => json!({}),
            MgtRequestKind::AddReplica { database, chunk } => {
                json!({"database": database, "chunk": chunk})
            }
            MgtRequestKind::RemoveReplica {
                database,
                chunk,
                force,
            } => json!({"database": database, "chunk": chunk, "force": force}),
        }
    }
}

/// Refined state of a finished management request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MgtExtendedState {
    None,
    Success,
    /// The worker reported a failure
    ServerError,
    /// The side channel failed
    ClientError,
    /// The query service refused to release a replica still in use
    InUse,
    TimeoutExpired,
    Cancelled,
}

impl MgtExtendedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MgtExtendedState::None => "NONE",
            MgtExtendedState::Success => "SUCCESS",
            MgtExtendedState::ServerError => "SERVER_ERROR",
            MgtExtendedState::ClientError => "CLIENT_ERROR",
            MgtExtendedState::InUse => "IN_USE",
            MgtExtendedState::TimeoutExpired => "TIMEOUT_EXPIRED",
            MgtExtendedState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for MgtExtendedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one management request
#[derive(Clone, Debug)]
pub struct MgtStatus {
    pub extended_state: MgtExtendedState,
    pub performance: Performance,
    pub error: String,
    /// Worker-provided payload on success
    pub data: serde_json::Value,
}

struct MgtInner {
    id: String,
    worker: String,
    kind: MgtRequestKind,
    status: std::sync::Mutex<MgtStatus>,
    cancel: CancellationToken,
    finished_tx: watch::Sender<bool>,
    finished_rx: watch::Receiver<bool>,
}

/// Handle onto one management request
#[derive(Clone)]
pub struct MgtRequestHandle {
    inner: Arc<MgtInner>,
}

impl std::fmt::Debug for MgtRequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MgtRequestHandle")
            .field("id", &self.inner.id)
            .field("worker", &self.inner.worker)
            .finish()
    }
}

impl MgtRequestHandle {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn worker(&self) -> &str {
        &self.inner.worker
    }

    pub fn kind(&self) -> &MgtRequestKind {
        &self.inner.kind
    }

    pub fn status(&self) -> MgtStatus {
        self.inner
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn wait(&self) {
        let mut rx = self.inner.finished_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }
}

/// Start one management request; the returned handle resolves through
/// `wait()`.
pub fn submit_mgt_request(
    provider: &Arc<ServiceProvider>,
    worker: &str,
    kind: MgtRequestKind,
) -> ReplicaResult<MgtRequestHandle> {
    let identity = provider.config.worker(worker)?.clone();
    let timeout = Duration::from_secs(provider.config.controller.request_timeout_sec.max(1));
    let (finished_tx, finished_rx) = watch::channel(false);
    let inner = Arc::new(MgtInner {
        id: uuid::Uuid::new_v4().to_string(),
        worker: worker.to_string(),
        kind,
        status: std::sync::Mutex::new(MgtStatus {
            extended_state: MgtExtendedState::None,
            performance: Performance::new(),
            error: String::new(),
            data: serde_json::Value::Null,
        }),
        cancel: CancellationToken::new(),
        finished_tx,
        finished_rx,
    });
    let handle = MgtRequestHandle {
        inner: Arc::clone(&inner),
    };

    tokio::spawn(async move {
        {
            let mut status = inner
                .status
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            status.performance.start_time = now_ms();
        }
        let url = format!(
            "http://{}:{}{}",
            identity.host,
            identity.http_port,
            inner.kind.route()
        );
        let client = reqwest::Client::new();
        let send = client.post(&url).json(&inner.kind.body()).send();

        let (extended, error, data) = tokio::select! {
            _ = inner.cancel.cancelled() => {
                (MgtExtendedState::Cancelled, String::new(), serde_json::Value::Null)
            }
            _ = tokio::time::sleep(timeout) => {
                (MgtExtendedState::TimeoutExpired, String::new(), serde_json::Value::Null)
            }
            response = send => match response {
                Err(e) => (MgtExtendedState::ClientError, e.to_string(), serde_json::Value::Null),
                Ok(response) => match response.json::<serde_json::Value>().await {
                    Err(e) => (MgtExtendedState::ClientError, e.to_string(), serde_json::Value::Null),
                    Ok(body) => interpret_reply(body),
                },
            },
        };
        {
            let mut status = inner
                .status
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            status.performance.set_update_finish();
            status.extended_state = extended;
            status.error = error;
            status.data = data;
        }
        if extended != MgtExtendedState::Success {
            warn!(
                id = %inner.id,
                worker = %inner.worker,
                kind = %inner.kind.type_name(),
                state = %extended,
                "management request failed"
            );
        } else {
            debug!(id = %inner.id, worker = %inner.worker, "management request finished");
        }
        let _ = inner.finished_tx.send(true);
    });
    Ok(handle)
}

/// Map a worker's JSON reply onto the family's refined state
fn interpret_reply(body: serde_json::Value) -> (MgtExtendedState, String, serde_json::Value) {
    let success = body.get("success").and_then(serde_json::Value::as_u64) == Some(1);
    if success {
        return (MgtExtendedState::Success, String::new(), body);
    }
    let error = body
        .get("error")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("unspecified worker error")
        .to_string();
    let code = body.get("code").and_then(serde_json::Value::as_str);
    let extended = if code == Some("IN_USE") {
        MgtExtendedState::InUse
    } else {
        MgtExtendedState::ServerError
    };
    (extended, error, body)
}

/// Convenience wrapper: run one management request to completion
pub async fn run_mgt_request(
    provider: &Arc<ServiceProvider>,
    worker: &str,
    kind: MgtRequestKind,
) -> ReplicaResult<MgtStatus> {
    let handle = submit_mgt_request(provider, worker, kind)?;
    handle.wait().await;
    let status = handle.status();
    if status.extended_state == MgtExtendedState::ClientError {
        return Err(ReplicaError::transport(status.error));
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpret_success_reply() {
        let (state, error, data) = interpret_reply(json!({"success": 1, "data": "pong"}));
        assert_eq!(state, MgtExtendedState::Success);
        assert!(error.is_empty());
        assert_eq!(data["data"], "pong");
    }

    #[test]
    fn test_interpret_in_use_reply() {
        let (state, error, _) =
            interpret_reply(json!({"success": 0, "error": "chunk 7 is in use", "code": "IN_USE"}));
        assert_eq!(state, MgtExtendedState::InUse);
        assert!(error.contains("in use"));
    }

    #[test]
    fn test_interpret_generic_failure() {
        let (state, _, _) = interpret_reply(json!({"success": 0, "error": "boom"}));
        assert_eq!(state, MgtExtendedState::ServerError);
    }
}
