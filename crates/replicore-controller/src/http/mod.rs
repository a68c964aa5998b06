//! REST ingress of the controller.
//!
//! Thin JSON handlers over the typed controller API: request and job
//! submission, status lookup and cancellation. State-changing calls require
//! the configured authorization key; every response carries a top-level
//! `success` flag and, on failure, one human message plus a machine code.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use replicore_shared::errors::{ReplicaError, ReplicaResult};
use replicore_shared::protocol::{Priority, SqlRequestBody};

use crate::controller::Controller;
use crate::jobs::{JobHandle, JobKind, JobResultData, JobSpec};
use crate::requests::{RequestHandle, RequestKind, RequestPayload, RequestSpec};
use crate::worker_mgt::{run_mgt_request, MgtRequestKind};

/// Shared state of the REST handlers
#[derive(Debug, Clone)]
pub struct HttpState {
    pub controller: Arc<Controller>,
}

/// Build the controller's REST router
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/replication/request", post(submit_request))
        .route(
            "/replication/request/{id}",
            get(request_status).delete(cancel_request),
        )
        .route("/replication/job", post(submit_job))
        .route(
            "/replication/job/{id}",
            get(job_status).delete(cancel_job),
        )
        .route("/replication/worker/{name}/status", get(worker_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn json_ok(payload: Value) -> Json<Value> {
    let mut body = json!({"success": 1, "error": "", "code": ""});
    if let (Some(object), Some(extra)) = (body.as_object_mut(), payload.as_object()) {
        for (key, value) in extra {
            object.insert(key.clone(), value.clone());
        }
    }
    Json(body)
}

fn json_error(error: &ReplicaError) -> Json<Value> {
    let code = match error {
        ReplicaError::NotFound(_) => "NOT_FOUND",
        ReplicaError::InvalidArgument(_) => "INVALID_ARGUMENT",
        ReplicaError::IllegalState(_) => "ILLEGAL_STATE",
        ReplicaError::ConfigError(_) => "CONFIG_ERROR",
        _ => "ERROR",
    };
    Json(json!({"success": 0, "error": error.to_string(), "code": code}))
}

fn respond(result: ReplicaResult<Value>) -> Json<Value> {
    match result {
        Ok(payload) => json_ok(payload),
        Err(e) => json_error(&e),
    }
}

/// Check the shared authorization key of state-changing calls
fn authorize(state: &HttpState, headers: &HeaderMap) -> ReplicaResult<()> {
    let expected = &state.controller.provider.config.controller.auth_key;
    let presented = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(ReplicaError::invalid_argument("authorization failed"))
    }
}

fn request_to_json(handle: &RequestHandle) -> Value {
    let status = handle.status();
    json!({
        "id": handle.id(),
        "worker": handle.worker(),
        "type": handle.type_name(),
        "state": status.state.as_str(),
        "extended_state": status.extended_state.as_str(),
        "server_status": status.extended_server_status.as_str(),
        "error": status.error,
        "job_id": status.job_id,
        "duplicate_request_id": status.duplicate_request_id,
        "performance": status.performance,
        "remote_performance": status.remote_performance,
        "payload": payload_to_json(&status.payload),
    })
}

fn payload_to_json(payload: &RequestPayload) -> Value {
    match payload {
        RequestPayload::None => Value::Null,
        RequestPayload::Replica(replica) => json!({"replica": replica}),
        RequestPayload::Replicas(replicas) => json!({"replicas": replicas}),
        RequestPayload::Echo(data) => json!({"data": data}),
        RequestPayload::Sql(result) => json!({
            "has_result": result.has_result,
            "fields": result.fields,
            "rows": result.rows.iter().map(|row| row.cells.clone()).collect::<Vec<_>>(),
            "error": result.error,
        }),
        RequestPayload::Index { file, total_bytes } => json!({
            "file": file.display().to_string(),
            "total_bytes": total_bytes,
        }),
    }
}

fn job_to_json(handle: &JobHandle) -> Value {
    let status = handle.status();
    json!({
        "id": handle.id(),
        "type": handle.type_name(),
        "state": status.state.as_str(),
        "extended_state": status.extended_state.as_str(),
        "begin_time": status.begin_time,
        "end_time": status.end_time,
        "heartbeat_time": status.heartbeat_time,
        "result": job_result_to_json(&status.result),
        "log": status.log.iter().map(|(kind, data)| json!({"kind": kind, "data": data})).collect::<Vec<_>>(),
    })
}

fn job_result_to_json(result: &JobResultData) -> Value {
    match result {
        JobResultData::None => Value::Null,
        JobResultData::Census(replicas) => json!({"num_replicas": replicas.len()}),
        JobResultData::Stats(stats) => stats.clone(),
        JobResultData::Index { file, total_bytes } => json!({
            "file": file.display().to_string(),
            "total_bytes": total_bytes,
        }),
    }
}

/// Request submission parameters
#[derive(Debug, Deserialize)]
struct SubmitRequestBody {
    worker: String,
    #[serde(flatten)]
    op: RequestOp,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    keep_tracking: Option<bool>,
    #[serde(default)]
    expiration_ival_sec: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum RequestOp {
    ReplicaCreate {
        database: String,
        chunk: u32,
        worker_from: String,
    },
    ReplicaDelete {
        database: String,
        chunk: u32,
    },
    ReplicaFind {
        database: String,
        chunk: u32,
        #[serde(default)]
        compute_check_sum: bool,
    },
    ReplicaFindAll {
        database: String,
        #[serde(default)]
        save_replica_info: bool,
    },
    TestEcho {
        data: String,
        #[serde(default)]
        delay_ms: u64,
    },
    Sql {
        body: SqlRequestBody,
    },
    Index {
        database: String,
        director_table: String,
        chunk: u32,
        #[serde(default)]
        has_transactions: bool,
        #[serde(default)]
        transaction_id: u32,
    },
}

impl RequestOp {
    fn into_kind(self) -> RequestKind {
        match self {
            RequestOp::ReplicaCreate {
                database,
                chunk,
                worker_from,
            } => RequestKind::Replicate {
                database,
                chunk,
                worker_from,
            },
            RequestOp::ReplicaDelete { database, chunk } => {
                RequestKind::Delete { database, chunk }
            }
            RequestOp::ReplicaFind {
                database,
                chunk,
                compute_check_sum,
            } => RequestKind::Find {
                database,
                chunk,
                compute_check_sum,
            },
            RequestOp::ReplicaFindAll {
                database,
                save_replica_info,
            } => RequestKind::FindAll {
                database,
                save_replica_info,
            },
            RequestOp::TestEcho { data, delay_ms } => RequestKind::Echo { data, delay_ms },
            RequestOp::Sql { body } => RequestKind::Sql { body },
            RequestOp::Index {
                database,
                director_table,
                chunk,
                has_transactions,
                transaction_id,
            } => RequestKind::DirectorIndex {
                database,
                director_table,
                chunk,
                has_transactions,
                transaction_id,
            },
        }
    }
}

async fn submit_request(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(body): Json<SubmitRequestBody>,
) -> Json<Value> {
    respond(async {
        authorize(&state, &headers)?;
        let mut spec = RequestSpec::new(body.worker.clone(), body.op.into_kind());
        if let Some(priority) = body.priority {
            spec = spec.priority(Priority::try_from(priority).map_err(|_| {
                ReplicaError::invalid_argument(format!("bad priority {priority}"))
            })?);
        }
        if let Some(keep_tracking) = body.keep_tracking {
            spec = spec.keep_tracking(keep_tracking);
        }
        if let Some(ival) = body.expiration_ival_sec {
            spec = spec.expiration_ival_sec(ival);
        }
        let handle = state.controller.submit_request(spec)?;
        Ok(json!({"request": request_to_json(&handle)}))
    }
    .await)
}

async fn request_status(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Json<Value> {
    respond(async {
        let handle = state
            .controller
            .request(&id)
            .ok_or_else(|| ReplicaError::not_found(format!("request '{id}'")))?;
        Ok(json!({"request": request_to_json(&handle)}))
    }
    .await)
}

async fn cancel_request(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Json<Value> {
    respond(async {
        authorize(&state, &headers)?;
        if !state.controller.cancel_request(&id) {
            return Err(ReplicaError::not_found(format!("request '{id}'")));
        }
        Ok(json!({"id": id}))
    }
    .await)
}

/// Job submission parameters
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum SubmitJobBody {
    FindAll {
        family: String,
        #[serde(default)]
        save_replica_info: bool,
    },
    Fixup {
        family: String,
    },
    Replicate {
        family: String,
    },
    Rebalance {
        family: String,
    },
    Purge {
        family: String,
    },
    Verify {
        family: String,
    },
    SqlBroadcast {
        body: SqlRequestBody,
    },
    DirectorIndex {
        database: String,
        #[serde(default)]
        has_transactions: bool,
        #[serde(default)]
        transaction_id: u32,
    },
}

impl SubmitJobBody {
    fn into_kind(self) -> JobKind {
        match self {
            SubmitJobBody::FindAll {
                family,
                save_replica_info,
            } => JobKind::FindAll {
                family,
                save_replica_info,
            },
            SubmitJobBody::Fixup { family } => JobKind::FixUp { family },
            SubmitJobBody::Replicate { family } => JobKind::Replicate { family },
            SubmitJobBody::Rebalance { family } => JobKind::Rebalance { family },
            SubmitJobBody::Purge { family } => JobKind::Purge { family },
            SubmitJobBody::Verify { family } => JobKind::Verify { family },
            SubmitJobBody::SqlBroadcast { body } => JobKind::SqlBroadcast { body },
            SubmitJobBody::DirectorIndex {
                database,
                has_transactions,
                transaction_id,
            } => JobKind::DirectorIndex {
                database,
                has_transactions,
                transaction_id,
            },
        }
    }
}

async fn submit_job(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(body): Json<SubmitJobBody>,
) -> Json<Value> {
    respond(async {
        authorize(&state, &headers)?;
        let handle = state
            .controller
            .submit_job(body.into_kind(), JobSpec::default())?;
        Ok(json!({"job": job_to_json(&handle)}))
    }
    .await)
}

async fn job_status(State(state): State<HttpState>, Path(id): Path<String>) -> Json<Value> {
    respond(async {
        let handle = state
            .controller
            .job(&id)
            .ok_or_else(|| ReplicaError::not_found(format!("job '{id}'")))?;
        Ok(json!({"job": job_to_json(&handle)}))
    }
    .await)
}

async fn cancel_job(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Json<Value> {
    respond(async {
        authorize(&state, &headers)?;
        if !state.controller.cancel_job(&id) {
            return Err(ReplicaError::not_found(format!("job '{id}'")));
        }
        Ok(json!({"id": id}))
    }
    .await)
}

async fn worker_status(
    State(state): State<HttpState>,
    Path(name): Path<String>,
) -> Json<Value> {
    respond(async {
        let status =
            run_mgt_request(&state.controller.provider, &name, MgtRequestKind::Status).await?;
        Ok(json!({
            "worker": name,
            "state": status.extended_state.as_str(),
            "data": status.data,
        }))
    }
    .await)
}
