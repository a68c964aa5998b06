//! Fix-up job: restore chunk co-location in a database family.
//!
//! A precursor census sweep yields the chunk/database/worker matrix. For
//! every `(chunk, worker)` that is not co-located, a replication task is
//! planned for each database of the chunk the worker lacks, sourcing from
//! any worker holding a complete replica. Tasks run under a per-destination
//! concurrency cap with a replacement launched after each completion. A
//! chunk that needs a replica with no source worker anywhere fails the job
//! outright.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use replicore_shared::errors::ReplicaResult;
use replicore_shared::replica::{ChunkDisposition, ReplicaInfo};

use crate::controller::Controller;
use crate::requests::{ExtendedState, RequestKind, RequestSpec};

use super::{
    family_census, launch_with_worker_caps, JobExtendedState, JobInner, JobOutcome, JobResultData,
};

/// One planned replication
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationTask {
    pub source: String,
    pub destination: String,
    pub database: String,
    pub chunk: u32,
}

/// Plan the replications needed to restore co-location.
///
/// Returns the task list, or the `(chunk, database, worker)` triples that
/// cannot be repaired because no complete source replica exists.
pub fn plan(
    family_databases: &[String],
    census: &[ReplicaInfo],
) -> Result<Vec<ReplicationTask>, Vec<(u32, String, String)>> {
    let disposition = ChunkDisposition::new(family_databases, census);
    let mut tasks = Vec::new();
    let mut unrecoverable = Vec::new();

    for chunk in disposition.chunks() {
        let participating: Vec<String> = disposition
            .participating_databases(chunk)
            .into_iter()
            .map(str::to_string)
            .collect();
        for worker in disposition
            .workers_of(chunk)
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
        {
            if disposition.is_colocated(chunk, &worker) {
                continue;
            }
            for database in &participating {
                let sources = disposition.sources_of(database, chunk);
                if sources.contains(&worker.as_str()) {
                    continue;
                }
                match sources.iter().find(|source| **source != worker) {
                    Some(source) => tasks.push(ReplicationTask {
                        source: source.to_string(),
                        destination: worker.clone(),
                        database: database.clone(),
                        chunk,
                    }),
                    None => {
                        unrecoverable.push((chunk, database.clone(), worker.clone()));
                    }
                }
            }
        }
    }

    if unrecoverable.is_empty() {
        Ok(tasks)
    } else {
        Err(unrecoverable)
    }
}

pub(crate) async fn run(
    controller: &Arc<Controller>,
    inner: &Arc<JobInner>,
    family: &str,
) -> ReplicaResult<JobOutcome> {
    let config = &controller.provider.config;
    config.family(family)?;
    let family_databases: Vec<String> = config
        .family_databases(family)
        .iter()
        .map(|d| d.name.clone())
        .collect();

    let census = family_census(controller, inner, family).await?;
    let tasks = match plan(&family_databases, &census) {
        Ok(tasks) => tasks,
        Err(unrecoverable) => {
            let log = unrecoverable
                .into_iter()
                .map(|(chunk, database, worker)| {
                    warn!(
                        job = %inner.id,
                        chunk,
                        database = %database,
                        worker = %worker,
                        "no source replica exists for the chunk"
                    );
                    (
                        "failed-worker".to_string(),
                        json!({
                            "worker": worker,
                            "database": database,
                            "chunk": chunk,
                            "reason": "no complete source replica exists",
                        }),
                    )
                })
                .collect();
            return Ok(JobOutcome {
                extended: JobExtendedState::Failed,
                result: JobResultData::None,
                log,
            });
        }
    };

    info!(job = %inner.id, tasks = tasks.len(), "fix-up plan ready");
    let specs: Vec<RequestSpec> = tasks
        .iter()
        .map(|task| {
            RequestSpec::new(
                task.destination.clone(),
                RequestKind::Replicate {
                    database: task.database.clone(),
                    chunk: task.chunk,
                    worker_from: task.source.clone(),
                },
            )
            .priority(inner.options.priority)
        })
        .collect();

    let cap = config.worker.num_svc_processing_threads;
    let children = launch_with_worker_caps(controller, inner, specs, cap).await?;

    let mut replicated = 0usize;
    let mut log = Vec::new();
    let mut failures_per_worker: std::collections::BTreeMap<String, usize> =
        std::collections::BTreeMap::new();
    for child in &children {
        if child.status.extended_state == ExtendedState::Success {
            replicated += 1;
        } else {
            *failures_per_worker.entry(child.worker.clone()).or_insert(0) += 1;
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

    let failed = children.len() - replicated;
    Ok(JobOutcome {
        extended: if failed == 0 {
            JobExtendedState::Success
        } else {
            JobExtendedState::Failed
        },
        result: JobResultData::Stats(json!({
            "total": children.len(),
            "replicated": replicated,
            "failed": failed,
            "failures-per-worker": failures_per_worker,
        })),
        log,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicore_shared::replica::ReplicaStatus;

    fn replica(worker: &str, db: &str, chunk: u32, status: ReplicaStatus) -> ReplicaInfo {
        ReplicaInfo {
            status,
            worker: worker.into(),
            database: db.into(),
            chunk,
            verify_time: 0,
            files: vec![],
        }
    }

    #[test]
    fn test_plan_restores_colocation() {
        let dbs = vec!["D1".to_string(), "D2".to_string()];
        // W2 holds D1 of chunk 5 but lacks D2; W1 holds both
        let census = vec![
            replica("W1", "D1", 5, ReplicaStatus::Complete),
            replica("W1", "D2", 5, ReplicaStatus::Complete),
            replica("W2", "D1", 5, ReplicaStatus::Complete),
        ];
        let tasks = plan(&dbs, &census).unwrap();
        assert_eq!(
            tasks,
            vec![ReplicationTask {
                source: "W1".into(),
                destination: "W2".into(),
                database: "D2".into(),
                chunk: 5,
            }]
        );
    }

    #[test]
    fn test_plan_empty_when_colocated() {
        let dbs = vec!["D1".to_string()];
        let census = vec![
            replica("W1", "D1", 1, ReplicaStatus::Complete),
            replica("W2", "D1", 1, ReplicaStatus::Complete),
        ];
        assert!(plan(&dbs, &census).unwrap().is_empty());
    }

    #[test]
    fn test_plan_fails_without_a_source() {
        let dbs = vec!["D1".to_string()];
        // The only holder of chunk 7 is incomplete: nothing can source it
        let census = vec![replica("W1", "D1", 7, ReplicaStatus::Incomplete)];
        let unrecoverable = plan(&dbs, &census).unwrap_err();
        assert_eq!(unrecoverable.len(), 1);
        assert_eq!(unrecoverable[0].0, 7);
        assert_eq!(unrecoverable[0].2, "W1");
    }

    #[test]
    fn test_plan_skips_incomplete_only_databases_with_other_sources() {
        let dbs = vec!["D1".to_string(), "D2".to_string()];
        // W2's copy of D2 chunk 3 is incomplete; W1 can source it
        let census = vec![
            replica("W1", "D1", 3, ReplicaStatus::Complete),
            replica("W1", "D2", 3, ReplicaStatus::Complete),
            replica("W2", "D1", 3, ReplicaStatus::Complete),
            replica("W2", "D2", 3, ReplicaStatus::Incomplete),
        ];
        let tasks = plan(&dbs, &census).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].destination, "W2");
        assert_eq!(tasks[0].database, "D2");
        assert_eq!(tasks[0].source, "W1");
    }
}
