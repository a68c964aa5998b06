//! Execution pipeline of one contribution.
//!
//! Stages mirror the persisted timestamp quadruple: the loader stamps
//! `start_time` when it opens the temporary file, `read_time` when the
//! input source has been fully read and preprocessed, and `load_time` when
//! the rows landed in the database. Cancellation is observed between input
//! records and again between the read and load stages; each stage
//! transition is persisted before the next begins.

use std::path::PathBuf;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use replicore_shared::errors::{ReplicaError, ReplicaResult};
use replicore_shared::ingest::{ContribStatus, TransactionContribInfo};
use replicore_shared::protocol::now_ms;

use crate::context::WorkerContext;

use super::IngestRequest;

/// Bytes pulled from the source between cancellation checkpoints
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Outcome of one processing attempt
#[derive(Debug)]
pub struct ProcessOutcome {
    pub contrib: TransactionContribInfo,
    /// Whether the loop should re-submit the contribution for another
    /// attempt
    pub resubmit: bool,
}

/// Run one contribution to a terminal (or retryable) state
pub async fn process_one(ctx: &WorkerContext, request: IngestRequest) -> ProcessOutcome {
    let cancel = request.cancel.clone();
    let mut contrib = request.contrib;

    // -- start stage: open the temporary file ------------------------------
    contrib.start_time = now_ms();
    match open_tmp_file(ctx, &mut contrib).await {
        Ok(file) => file,
        Err(e) => {
            return fail(
                ctx,
                contrib,
                ContribStatus::StartFailed,
                true,
                format!("failed to open the temporary file: {e}"),
            )
            .await;
        }
    };
    if let Err(e) = ctx.db.save_contrib(&contrib).await {
        return fail(ctx, contrib, ContribStatus::StartFailed, true, e.to_string()).await;
    }

    // -- read stage: pull and preprocess the source ------------------------
    match read_source(ctx, &cancel, &mut contrib).await {
        Ok(ReadOutcome::Complete) => {}
        Ok(ReadOutcome::Cancelled) => {
            contrib.status = ContribStatus::Cancelled;
            remove_tmp_file(&contrib).await;
            persist(ctx, &contrib).await;
            info!(id = contrib.id, "contribution cancelled while reading");
            return ProcessOutcome {
                contrib,
                resubmit: false,
            };
        }
        Err(e) => {
            remove_tmp_file(&contrib).await;
            return fail(ctx, contrib, ContribStatus::ReadFailed, true, e.to_string()).await;
        }
    }
    contrib.read_time = now_ms();
    if let Err(e) = ctx.db.save_contrib(&contrib).await {
        remove_tmp_file(&contrib).await;
        return fail(ctx, contrib, ContribStatus::ReadFailed, true, e.to_string()).await;
    }

    // -- load stage: no cancellation once the load begins ------------------
    if cancel.is_cancelled() {
        contrib.status = ContribStatus::Cancelled;
        remove_tmp_file(&contrib).await;
        persist(ctx, &contrib).await;
        info!(id = contrib.id, "contribution cancelled before the load");
        return ProcessOutcome {
            contrib,
            resubmit: false,
        };
    }
    if let Err(e) = ctx.sql.load_table_data(
        &contrib.database,
        &contrib.table,
        contrib.chunk,
        contrib.transaction_id,
        contrib.num_rows,
    ) {
        remove_tmp_file(&contrib).await;
        return fail(ctx, contrib, ContribStatus::LoadFailed, false, e.to_string()).await;
    }
    contrib.load_time = now_ms();
    contrib.num_rows_loaded = contrib.num_rows;
    contrib.status = ContribStatus::Finished;
    remove_tmp_file(&contrib).await;
    persist(ctx, &contrib).await;
    info!(
        id = contrib.id,
        database = %contrib.database,
        table = %contrib.table,
        chunk = contrib.chunk,
        rows = contrib.num_rows_loaded,
        "contribution finished"
    );
    ProcessOutcome {
        contrib,
        resubmit: false,
    }
}

async fn fail(
    ctx: &WorkerContext,
    mut contrib: TransactionContribInfo,
    status: ContribStatus,
    retry_allowed: bool,
    error: String,
) -> ProcessOutcome {
    contrib.status = status;
    contrib.retry_allowed = retry_allowed;
    contrib.error = error;
    warn!(
        id = contrib.id,
        status = %contrib.status,
        "contribution failed: {}",
        contrib.error
    );
    if contrib.can_retry() {
        contrib.record_failed_retry();
        if let Err(e) = ctx.db.save_last_contrib_retry(&contrib).await {
            warn!(id = contrib.id, "failed to persist the retry snapshot: {e}");
        }
        return ProcessOutcome {
            contrib,
            resubmit: true,
        };
    }
    persist(ctx, &contrib).await;
    ProcessOutcome {
        contrib,
        resubmit: false,
    }
}

async fn persist(ctx: &WorkerContext, contrib: &TransactionContribInfo) {
    if let Err(e) = ctx.db.save_contrib(contrib).await {
        warn!(id = contrib.id, "failed to persist a contribution update: {e}");
    }
}

async fn open_tmp_file(
    ctx: &WorkerContext,
    contrib: &mut TransactionContribInfo,
) -> ReplicaResult<tokio::fs::File> {
    let dir = ctx.worker.data_dir.join("ingest_tmp");
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(format!(
        "contrib-{}-{}.csv",
        contrib.id, contrib.num_failed_retries
    ));
    let file = tokio::fs::File::create(&path).await?;
    contrib.tmp_file = path.display().to_string();
    Ok(file)
}

async fn remove_tmp_file(contrib: &TransactionContribInfo) {
    if contrib.tmp_file.is_empty() {
        return;
    }
    if let Err(e) = tokio::fs::remove_file(&contrib.tmp_file).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(
                id = contrib.id,
                tmp_file = %contrib.tmp_file,
                "temporary file removal failed: {e}"
            );
        }
    }
}

enum ReadOutcome {
    Complete,
    Cancelled,
}

/// Pull the source into the temporary file, counting rows and bytes
async fn read_source(
    ctx: &WorkerContext,
    cancel: &tokio_util::sync::CancellationToken,
    contrib: &mut TransactionContribInfo,
) -> ReplicaResult<ReadOutcome> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&contrib.tmp_file)
        .await?;
    let terminator = contrib.dialect.lines_terminated_by.clone();
    let terminator = terminator.as_bytes();
    let mut num_bytes: u64 = 0;
    let mut num_rows: u64 = 0;
    let mut tail_terminated = true;

    let mut count_chunk = |chunk: &[u8]| {
        num_bytes += chunk.len() as u64;
        if terminator.len() == 1 {
            num_rows += chunk.iter().filter(|b| **b == terminator[0]).count() as u64;
        } else if !terminator.is_empty() {
            num_rows += chunk
                .windows(terminator.len())
                .filter(|w| *w == terminator)
                .count() as u64;
        }
        if let Some(last) = chunk.last() {
            tail_terminated = terminator.last() == Some(last);
        }
    };

    let url = contrib.url.clone();
    if let Some(path) = file_source_path(&url) {
        let mut source = tokio::fs::File::open(&path).await?;
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            if cancel.is_cancelled() {
                return Ok(ReadOutcome::Cancelled);
            }
            let read = tokio::io::AsyncReadExt::read(&mut source, &mut buf).await?;
            if read == 0 {
                break;
            }
            count_chunk(&buf[..read]);
            file.write_all(&buf[..read]).await?;
        }
    } else if url.starts_with("http://") || url.starts_with("https://") {
        let client = reqwest::Client::new();
        let method = if contrib.http_method.is_empty() {
            reqwest::Method::GET
        } else {
            reqwest::Method::from_bytes(contrib.http_method.as_bytes())
                .map_err(|_| {
                    ReplicaError::invalid_argument(format!(
                        "bad HTTP method '{}'",
                        contrib.http_method
                    ))
                })?
        };
        let mut builder = client.request(method, &url);
        if !contrib.http_data.is_empty() {
            builder = builder.body(contrib.http_data.clone());
        }
        for header in &contrib.http_headers {
            let (name, value) = header.split_once(':').ok_or_else(|| {
                ReplicaError::invalid_argument(format!("malformed HTTP header '{header}'"))
            })?;
            builder = builder.header(name.trim(), value.trim());
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ReplicaError::transport(format!("fetch of {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ReplicaError::transport(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Ok(ReadOutcome::Cancelled);
            }
            let chunk = chunk
                .map_err(|e| ReplicaError::transport(format!("read of {url} failed: {e}")))?;
            count_chunk(&chunk);
            file.write_all(&chunk).await?;
        }
    } else {
        return Err(ReplicaError::invalid_argument(format!(
            "unsupported contribution source '{url}'"
        )));
    }
    file.flush().await?;

    if num_bytes > 0 && !tail_terminated {
        num_rows += 1;
        if contrib.warnings.len() < contrib.max_num_warnings as usize {
            contrib
                .warnings
                .push("the last record is not terminated".to_string());
        }
    }
    contrib.num_bytes = num_bytes;
    contrib.num_rows = num_rows;
    Ok(ReadOutcome::Complete)
}

/// Local filesystem source of a contribution, when the URL designates one
fn file_source_path(url: &str) -> Option<PathBuf> {
    url.strip_prefix("file://")
        .map(PathBuf::from)
        .or_else(|| url.starts_with('/').then(|| PathBuf::from(url)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_source_path() {
        assert_eq!(
            file_source_path("file:///data/chunk.csv"),
            Some(PathBuf::from("/data/chunk.csv"))
        );
        assert_eq!(
            file_source_path("/data/chunk.csv"),
            Some(PathBuf::from("/data/chunk.csv"))
        );
        assert_eq!(file_source_path("https://host/x.csv"), None);
    }
}
