//! Director-index job: extract the index of every chunk of a database and
//! consolidate the per-chunk files, in chunk order, into one load file
//! under the master's scratch folder.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use replicore_shared::errors::{ReplicaError, ReplicaResult};
use replicore_shared::fs::naming::director_index_table;
use replicore_shared::replica::ChunkDisposition;

use crate::controller::Controller;
use crate::requests::{ExtendedState, RequestKind, RequestPayload, RequestSpec};

use super::{
    family_census, launch_with_worker_caps, JobExtendedState, JobInner, JobOutcome, JobResultData,
};

pub(crate) async fn run(
    controller: &Arc<Controller>,
    inner: &Arc<JobInner>,
    database: &str,
    has_transactions: bool,
    transaction_id: u32,
) -> ReplicaResult<JobOutcome> {
    let config = &controller.provider.config;
    let database_info = config.database(database)?.clone();
    let director_table = database_info.director_table.clone();

    let census = family_census(controller, inner, &database_info.family).await?;
    let family_databases: Vec<String> = config
        .family_databases(&database_info.family)
        .iter()
        .map(|d| d.name.clone())
        .collect();
    let disposition = ChunkDisposition::new(&family_databases, &census);

    // One extraction per chunk, sourced from any worker holding a complete
    // replica of the database
    let mut specs = Vec::new();
    let mut log = Vec::new();
    let mut missing = 0usize;
    let chunks: Vec<u32> = disposition
        .chunks()
        .into_iter()
        .filter(|chunk| {
            disposition
                .participating_databases(*chunk)
                .contains(&database)
        })
        .collect();
    for chunk in &chunks {
        match disposition.sources_of(database, *chunk).first() {
            Some(source) => specs.push(
                RequestSpec::new(
                    source.to_string(),
                    RequestKind::DirectorIndex {
                        database: database.to_string(),
                        director_table: director_table.clone(),
                        chunk: *chunk,
                        has_transactions,
                        transaction_id,
                    },
                )
                .priority(inner.options.priority),
            ),
            None => {
                missing += 1;
                log.push((
                    "failed-chunk".to_string(),
                    json!({
                        "chunk": chunk,
                        "reason": "no complete replica to extract from",
                    }),
                ));
            }
        }
    }

    info!(job = %inner.id, chunks = specs.len(), "index extraction plan ready");
    let cap = config.worker.num_svc_processing_threads;
    let children = launch_with_worker_caps(controller, inner, specs, cap).await?;

    let mut failed = 0usize;
    let mut per_chunk: BTreeMap<u32, PathBuf> = BTreeMap::new();
    for child in &children {
        let chunk = match child.handle.kind() {
            RequestKind::DirectorIndex { chunk, .. } => *chunk,
            _ => continue,
        };
        if child.status.extended_state == ExtendedState::Success {
            if let RequestPayload::Index { file, .. } = &child.status.payload {
                per_chunk.insert(chunk, file.clone());
            }
        } else {
            failed += 1;
            log.push((
                "failed-worker".to_string(),
                json!({
                    "worker": child.worker,
                    "request": child.handle.id(),
                    "chunk": chunk,
                    "state": child.status.extended_state.as_str(),
                    "error": child.status.error,
                }),
            ));
        }
    }

    if failed > 0 || missing > 0 {
        return Ok(JobOutcome {
            extended: JobExtendedState::Failed,
            result: JobResultData::Stats(json!({
                "chunks": chunks.len(),
                "failed": failed,
                "missing": missing,
            })),
            log,
        });
    }

    // Consolidate per-chunk files, ascending chunk order
    let final_file = config
        .database
        .qserv_master_tmp_dir
        .join(format!("{}.csv", director_index_table(database, &director_table)));
    let total_bytes = consolidate(&per_chunk, &final_file).await?;
    info!(
        job = %inner.id,
        file = %final_file.display(),
        total_bytes,
        "director index consolidated"
    );

    Ok(JobOutcome {
        extended: JobExtendedState::Success,
        result: JobResultData::Index {
            file: final_file,
            total_bytes,
        },
        log,
    })
}

async fn consolidate(per_chunk: &BTreeMap<u32, PathBuf>, final_file: &PathBuf) -> ReplicaResult<u64> {
    if let Some(dir) = final_file.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let mut out = tokio::fs::File::create(final_file).await?;
    let mut total_bytes: u64 = 0;
    for (chunk, file) in per_chunk {
        let data = tokio::fs::read(file).await.map_err(|e| {
            ReplicaError::worker(format!(
                "reading the chunk {chunk} extraction '{}' failed: {e}",
                file.display()
            ))
        })?;
        out.write_all(&data).await?;
        total_bytes += data.len() as u64;
        if let Err(e) = tokio::fs::remove_file(file).await {
            warn!(chunk, "per-chunk index file not removed: {e}");
        }
    }
    out.flush().await?;
    Ok(total_bytes)
}
