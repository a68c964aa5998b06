//! Replication-level job: bring every chunk of a family up to the
//! configured number of co-located replicas, then notify the query service
//! of each replica that became available.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use replicore_shared::errors::ReplicaResult;
use replicore_shared::replica::ChunkDisposition;

use crate::controller::Controller;
use crate::requests::{ExtendedState, RequestKind, RequestSpec};
use crate::worker_mgt::{run_mgt_request, MgtExtendedState, MgtRequestKind};

use super::{
    family_census, launch_with_worker_caps, JobExtendedState, JobInner, JobOutcome, JobResultData,
};

pub(crate) async fn run(
    controller: &Arc<Controller>,
    inner: &Arc<JobInner>,
    family: &str,
) -> ReplicaResult<JobOutcome> {
    let config = &controller.provider.config;
    let level = config.family(family)?.min_replication_level;
    let family_databases: Vec<String> = config
        .family_databases(family)
        .iter()
        .map(|d| d.name.clone())
        .collect();
    let all_workers = config.worker_names();

    let census = family_census(controller, inner, family).await?;
    let disposition = ChunkDisposition::new(&family_databases, &census);

    // Load per worker, used to spread new replicas evenly
    let mut load: BTreeMap<String, usize> = all_workers.iter().map(|w| (w.clone(), 0)).collect();
    for chunk in disposition.chunks() {
        for worker in disposition.workers_of(chunk) {
            *load.entry(worker.to_string()).or_insert(0) += 1;
        }
    }

    let mut specs = Vec::new();
    let mut planned_chunks: Vec<(u32, String)> = Vec::new();
    let mut log = Vec::new();
    let mut planning_failed = false;
    for chunk in disposition.chunks() {
        let holders: Vec<String> = all_workers
            .iter()
            .filter(|w| {
                disposition.is_colocated(chunk, w.as_str())
                    && disposition.workers_of(chunk).contains(&w.as_str())
            })
            .cloned()
            .collect();
        if holders.len() >= level {
            continue;
        }
        let needed = level - holders.len();
        let participating: Vec<String> = disposition
            .participating_databases(chunk)
            .into_iter()
            .map(str::to_string)
            .collect();

        // Least-loaded workers holding nothing of the chunk become the new
        // destinations
        let mut candidates: Vec<String> = all_workers
            .iter()
            .filter(|w| !disposition.workers_of(chunk).contains(&w.as_str()))
            .cloned()
            .collect();
        candidates.sort_by_key(|w| (*load.get(w).unwrap_or(&0), w.clone()));
        if candidates.len() < needed {
            warn!(job = %inner.id, chunk, "not enough workers to reach the replication level");
            log.push((
                "failed-chunk".to_string(),
                json!({
                    "chunk": chunk,
                    "reason": "not enough candidate workers",
                    "needed": needed,
                    "available": candidates.len(),
                }),
            ));
            planning_failed = true;
            continue;
        }
        for destination in candidates.into_iter().take(needed) {
            *load.entry(destination.clone()).or_insert(0) += 1;
            let mut chunk_ok = true;
            for database in &participating {
                match disposition.sources_of(database, chunk).first() {
                    Some(source) => specs.push(
                        RequestSpec::new(
                            destination.clone(),
                            RequestKind::Replicate {
                                database: database.clone(),
                                chunk,
                                worker_from: source.to_string(),
                            },
                        )
                        .priority(inner.options.priority),
                    ),
                    None => {
                        log.push((
                            "failed-chunk".to_string(),
                            json!({
                                "chunk": chunk,
                                "database": database,
                                "reason": "no complete source replica exists",
                            }),
                        ));
                        planning_failed = true;
                        chunk_ok = false;
                    }
                }
            }
            if chunk_ok {
                planned_chunks.push((chunk, destination));
            }
        }
    }

    info!(job = %inner.id, tasks = specs.len(), "replication plan ready");
    let cap = config.worker.num_svc_processing_threads;
    let children = launch_with_worker_caps(controller, inner, specs, cap).await?;

    let mut failed = 0usize;
    for child in &children {
        if child.status.extended_state != ExtendedState::Success {
            failed += 1;
            log.push((
                "failed-worker".to_string(),
                json!({
                    "worker": child.worker,
                    "request": child.handle.id(),
                    "state": child.status.extended_state.as_str(),
                    "error": child.status.error,
                }),
            ));
        }
    }

    // Announce the new replicas to the query service
    let mut notify_failed = false;
    if failed == 0 && !planning_failed {
        for (chunk, worker) in &planned_chunks {
            for database in &family_databases {
                match run_mgt_request(
                    &controller.provider,
                    worker,
                    MgtRequestKind::AddReplica {
                        database: database.clone(),
                        chunk: *chunk,
                    },
                )
                .await
                {
                    Ok(status) if status.extended_state == MgtExtendedState::Success => {}
                    Ok(status) => {
                        notify_failed = true;
                        log.push((
                            "qserv-notify-failed".to_string(),
                            json!({
                                "worker": worker,
                                "database": database,
                                "chunk": chunk,
                                "error": status.error,
                            }),
                        ));
                    }
                    Err(e) => {
                        notify_failed = true;
                        log.push((
                            "qserv-notify-failed".to_string(),
                            json!({
                                "worker": worker,
                                "database": database,
                                "chunk": chunk,
                                "error": e.to_string(),
                            }),
                        ));
                    }
                }
            }
        }
    }

    let extended = if planning_failed || failed > 0 {
        JobExtendedState::Failed
    } else if notify_failed {
        JobExtendedState::QservFailed
    } else {
        JobExtendedState::Success
    };
    Ok(JobOutcome {
        extended,
        result: JobResultData::Stats(json!({
            "total": children.len(),
            "failed": failed,
            "chunks-replicated": planned_chunks.len(),
        })),
        log,
    })
}
