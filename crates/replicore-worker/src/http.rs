//! Ingest HTTP surface of one worker.
//!
//! JSON over HTTP: a sync endpoint blocks the caller until the contribution
//! finishes; the async endpoint returns immediately with the contribution
//! id and status endpoints report `TransactionContribInfo`-shaped JSON.
//! Every response carries a top-level `success` flag and, on failure, a
//! single human message plus a machine-readable code.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use replicore_shared::errors::{ReplicaError, ReplicaResult};
use replicore_shared::ingest::{CsvDialect, TransactionContribInfo, TransactionState};
use replicore_shared::protocol::OVERFLOW_CHUNK_ID;

use crate::context::WorkerContext;
use crate::ingest::request::process_one;
use crate::ingest::{IngestRequest, IngestRequestMgr};
use crate::processor::WorkerProcessor;

/// Shared state of the ingest and management HTTP handlers
#[derive(Debug, Clone)]
pub struct IngestHttpState {
    pub ctx: Arc<WorkerContext>,
    pub mgr: Arc<IngestRequestMgr>,
    pub processor: Arc<WorkerProcessor>,
}

/// Build the worker's ingest + management router
pub fn router(state: IngestHttpState) -> Router {
    Router::new()
        .route("/ingest/trans", post(begin_transaction))
        .route("/ingest/trans/{id}", put(end_transaction).get(get_transaction))
        .route("/ingest/file", post(submit_sync))
        .route("/ingest/file-async", post(submit_async))
        .route(
            "/ingest/file-async/{id}",
            get(contrib_status).delete(cancel_contrib),
        )
        .route("/ingest/file-async/trans/{id}", get(transaction_contribs))
        .route("/mgt/echo", post(mgt_echo))
        .route("/mgt/status", post(mgt_status))
        .route("/mgt/replica/add", post(mgt_replica_add))
        .route("/mgt/replica/remove", post(mgt_replica_remove))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn json_ok(payload: serde_json::Value) -> Json<serde_json::Value> {
    let mut body = json!({"success": 1, "error": "", "code": ""});
    if let (Some(obj), Some(extra)) = (body.as_object_mut(), payload.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    Json(body)
}

fn json_error(error: &ReplicaError) -> Json<serde_json::Value> {
    let code = match error {
        ReplicaError::NotFound(_) => "NOT_FOUND",
        ReplicaError::InvalidArgument(_) => "INVALID_ARGUMENT",
        ReplicaError::IllegalState(_) => "ILLEGAL_STATE",
        ReplicaError::DatabaseError(_) => "DATABASE_ERROR",
        _ => "ERROR",
    };
    Json(json!({"success": 0, "error": error.to_string(), "code": code}))
}

fn respond(result: ReplicaResult<serde_json::Value>) -> Json<serde_json::Value> {
    match result {
        Ok(payload) => json_ok(payload),
        Err(e) => json_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct BeginTransactionBody {
    database: String,
}

async fn begin_transaction(
    State(state): State<IngestHttpState>,
    Json(body): Json<BeginTransactionBody>,
) -> Json<serde_json::Value> {
    respond(async {
        let database = state.ctx.config.database(&body.database)?;
        if database.is_published {
            return Err(ReplicaError::invalid_argument(format!(
                "database '{}' is published and no longer accepts ingest",
                body.database
            )));
        }
        let transaction = state.ctx.db.begin_transaction(&body.database).await?;
        info!(id = transaction.id, database = %body.database, "transaction started");
        Ok(json!({"transaction": transaction}))
    }
    .await)
}

async fn end_transaction(
    State(state): State<IngestHttpState>,
    Path(id): Path<u32>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    respond(async {
        let abort = params.get("abort").map(String::as_str) == Some("1");
        let transaction = state.ctx.db.end_transaction(id, abort).await?;
        info!(id, abort, "transaction ended");
        Ok(json!({"transaction": transaction}))
    }
    .await)
}

async fn get_transaction(
    State(state): State<IngestHttpState>,
    Path(id): Path<u32>,
) -> Json<serde_json::Value> {
    respond(async {
        let transaction = state.ctx.db.transaction(id).await?;
        Ok(json!({"transaction": transaction}))
    }
    .await)
}

/// Contribution creation parameters
#[derive(Debug, Deserialize)]
struct ContribRequestBody {
    transaction_id: u32,
    table: String,
    chunk: u32,
    /// 0 or 1
    #[serde(default)]
    overlap: u8,
    url: String,
    #[serde(default)]
    charset_name: Option<String>,
    #[serde(default)]
    fields_terminated_by: Option<String>,
    #[serde(default)]
    fields_enclosed_by: Option<String>,
    #[serde(default)]
    fields_escaped_by: Option<String>,
    #[serde(default)]
    lines_terminated_by: Option<String>,
    #[serde(default)]
    http_method: Option<String>,
    #[serde(default)]
    http_data: Option<String>,
    #[serde(default)]
    http_headers: Option<Vec<String>>,
    #[serde(default)]
    max_num_warnings: Option<u64>,
    #[serde(default)]
    max_retries: Option<u32>,
}

impl IngestHttpState {
    /// Validate a submission and build the persisted contribution record
    async fn make_contrib(&self, body: &ContribRequestBody) -> ReplicaResult<TransactionContribInfo> {
        let transaction = self.ctx.db.transaction(body.transaction_id).await?;
        if transaction.state != TransactionState::Started {
            return Err(ReplicaError::illegal_state(format!(
                "transaction {} is {}",
                transaction.id, transaction.state
            )));
        }
        let database = self.ctx.config.database(&transaction.database)?;
        if database.is_published {
            return Err(ReplicaError::invalid_argument(format!(
                "database '{}' is published and no longer accepts ingest",
                database.name
            )));
        }
        let is_partitioned = database.partitioned_tables.contains(&body.table);
        if !is_partitioned && !database.regular_tables.contains(&body.table) {
            return Err(ReplicaError::invalid_argument(format!(
                "unknown table '{}' in database '{}'",
                body.table, database.name
            )));
        }
        if is_partitioned && body.chunk == OVERFLOW_CHUNK_ID {
            return Err(ReplicaError::invalid_argument(format!(
                "the reserved overflow chunk {} is not admitted",
                body.chunk
            )));
        }
        if body.url.is_empty() {
            return Err(ReplicaError::invalid_argument("empty source url"));
        }
        if body.url.starts_with("http://") || body.url.starts_with("https://") {
            url::Url::parse(&body.url)
                .map_err(|e| ReplicaError::invalid_argument(format!("bad source url: {e}")))?;
        }

        let worker_config = &self.ctx.config.worker;
        let mut contrib = TransactionContribInfo::new(
            0,
            transaction.id,
            &self.ctx.worker.name,
            &database.name,
            &body.table,
            body.chunk,
            body.overlap != 0,
            &body.url,
        );
        contrib.http_method = body.http_method.clone().unwrap_or_default();
        contrib.http_data = body.http_data.clone().unwrap_or_default();
        contrib.http_headers = body.http_headers.clone().unwrap_or_default();
        contrib.charset_name = body
            .charset_name
            .clone()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| worker_config.ingest_charset_name.clone());
        contrib.dialect = CsvDialect::from_parts(
            body.fields_terminated_by.clone(),
            body.fields_enclosed_by.clone(),
            body.fields_escaped_by.clone(),
            body.lines_terminated_by.clone(),
        );
        contrib.max_num_warnings = body
            .max_num_warnings
            .unwrap_or(worker_config.ingest_max_warnings)
            .min(worker_config.ingest_max_warnings);
        contrib.max_retries = body
            .max_retries
            .unwrap_or(worker_config.ingest_num_retries)
            .min(worker_config.ingest_max_retries);
        contrib.retry_allowed = contrib.max_retries > 0;

        self.ctx.db.save_new_contrib(&mut contrib).await?;
        Ok(contrib)
    }
}

/// Synchronous submission: process the contribution in place and answer
/// with its terminal state
async fn submit_sync(
    State(state): State<IngestHttpState>,
    Json(body): Json<ContribRequestBody>,
) -> Json<serde_json::Value> {
    respond(async {
        let contrib = state.make_contrib(&body).await?;
        let mut request = IngestRequest::new(contrib);
        loop {
            let outcome = process_one(&state.ctx, request).await;
            if outcome.resubmit {
                request = IngestRequest::new(outcome.contrib);
                continue;
            }
            return Ok(json!({"contrib": outcome.contrib}));
        }
    }
    .await)
}

/// Asynchronous submission: enqueue and return the contribution id
async fn submit_async(
    State(state): State<IngestHttpState>,
    Json(body): Json<ContribRequestBody>,
) -> Json<serde_json::Value> {
    respond(async {
        let contrib = state.make_contrib(&body).await?;
        let snapshot = contrib.clone();
        state.mgr.submit(IngestRequest::new(contrib))?;
        Ok(json!({"contrib": snapshot}))
    }
    .await)
}

async fn contrib_status(
    State(state): State<IngestHttpState>,
    Path(id): Path<u32>,
) -> Json<serde_json::Value> {
    respond(async {
        let contrib = state.mgr.find(id).await?;
        Ok(json!({"contrib": contrib}))
    }
    .await)
}

async fn cancel_contrib(
    State(state): State<IngestHttpState>,
    Path(id): Path<u32>,
) -> Json<serde_json::Value> {
    respond(async {
        let contrib = state.mgr.cancel(id).await?;
        Ok(json!({"contrib": contrib}))
    }
    .await)
}

async fn transaction_contribs(
    State(state): State<IngestHttpState>,
    Path(id): Path<u32>,
) -> Json<serde_json::Value> {
    respond(async {
        let contribs = state
            .ctx
            .db
            .transaction_contribs(id, None, Some(&state.ctx.worker.name))
            .await?;
        Ok(json!({"contribs": contribs}))
    }
    .await)
}

// -- Management side-channel ------------------------------------------------

#[derive(Debug, Deserialize)]
struct MgtEchoBody {
    #[serde(default)]
    data: String,
}

async fn mgt_echo(
    State(_state): State<IngestHttpState>,
    Json(body): Json<MgtEchoBody>,
) -> Json<serde_json::Value> {
    json_ok(json!({"data": body.data}))
}

async fn mgt_status(State(state): State<IngestHttpState>) -> Json<serde_json::Value> {
    let census = state.processor.census(false).await;
    json_ok(json!({
        "service": {
            "state": census.state,
            "num_new_requests": census.num_new_requests,
            "num_in_progress_requests": census.num_in_progress_requests,
            "num_finished_requests": census.num_finished_requests,
        }
    }))
}

#[derive(Debug, Deserialize)]
struct MgtReplicaBody {
    database: String,
    chunk: u32,
    #[serde(default)]
    force: bool,
}

async fn mgt_replica_add(
    State(state): State<IngestHttpState>,
    Json(body): Json<MgtReplicaBody>,
) -> Json<serde_json::Value> {
    respond(async {
        state.ctx.config.database(&body.database)?;
        state
            .ctx
            .chunk_registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((body.database.clone(), body.chunk));
        info!(database = %body.database, chunk = body.chunk, "replica registered");
        Ok(json!({"database": body.database, "chunk": body.chunk}))
    }
    .await)
}

async fn mgt_replica_remove(
    State(state): State<IngestHttpState>,
    Json(body): Json<MgtReplicaBody>,
) -> Json<serde_json::Value> {
    state.ctx.config.database(&body.database).map_or_else(
        |e| json_error(&e),
        |_| {
            let use_count = state.ctx.sql.chunk_use_count(&body.database, body.chunk);
            if use_count > 0 && !body.force {
                return Json(json!({
                    "success": 0,
                    "error": format!(
                        "chunk {} of database '{}' is used by {use_count} running queries",
                        body.chunk, body.database
                    ),
                    "code": "IN_USE",
                }));
            }
            state
                .ctx
                .chunk_registry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&(body.database.clone(), body.chunk));
            info!(database = %body.database, chunk = body.chunk, "replica released");
            json_ok(json!({"database": body.database, "chunk": body.chunk}))
        },
    )
}

/// Background loader pool: dequeues eligible contributions and runs them,
/// re-submitting retryable failures
pub fn start_loader_pool(state: IngestHttpState) {
    let pool_size = state.ctx.config.worker.num_async_loader_processing_threads;
    for loader_index in 0..pool_size {
        let state = state.clone();
        tokio::spawn(async move {
            tracing::debug!(loader_index, "ingest loader started");
            loop {
                let request = state.mgr.next().await;
                let id = request.contrib.id;
                let outcome = process_one(&state.ctx, request).await;
                if let Err(e) = state.mgr.completed(id, outcome.contrib.clone()) {
                    tracing::warn!(id, "completion accounting failed: {e}");
                }
                if outcome.resubmit {
                    if let Err(e) = state.mgr.submit(IngestRequest::new(outcome.contrib)) {
                        tracing::warn!(id, "re-submission failed: {e}");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_ok_merges_payload() {
        let Json(body) = json_ok(json!({"contrib": {"id": 7}}));
        assert_eq!(body["success"], 1);
        assert_eq!(body["contrib"]["id"], 7);
    }

    #[test]
    fn test_json_error_carries_code() {
        let Json(body) = json_error(&ReplicaError::not_found("contribution 9"));
        assert_eq!(body["success"], 0);
        assert_eq!(body["code"], "NOT_FOUND");
        assert!(body["error"].as_str().unwrap().contains("contribution 9"));
    }
}
