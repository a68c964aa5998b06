//! Rebalance job: even out chunk holdings across the worker fleet by moving
//! whole co-located chunks from the most loaded workers onto the least
//! loaded ones. Each move replicates the chunk to its new home first and
//! deletes the source copy only after the replication succeeded.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use replicore_shared::errors::ReplicaResult;
use replicore_shared::replica::ChunkDisposition;

use crate::controller::Controller;
use crate::requests::{ExtendedState, RequestKind, RequestSpec};

use super::{
    family_census, launch_with_worker_caps, JobExtendedState, JobInner, JobOutcome, JobResultData,
};

/// One planned chunk move
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkMove {
    pub chunk: u32,
    pub source: String,
    pub destination: String,
    pub databases: Vec<String>,
}

/// Plan moves until no worker holds more than `ceil(average) + 1` chunks or
/// no eligible move remains.
pub fn plan(
    all_workers: &[String],
    family_databases: &[String],
    census: &[replicore_shared::replica::ReplicaInfo],
) -> Vec<ChunkMove> {
    let disposition = ChunkDisposition::new(family_databases, census);
    // Chunks fully co-located per worker; only those are safe to move
    let mut holdings: BTreeMap<String, Vec<u32>> = all_workers
        .iter()
        .map(|w| (w.clone(), Vec::new()))
        .collect();
    for chunk in disposition.chunks() {
        for worker in disposition.workers_of(chunk) {
            if disposition.is_colocated(chunk, worker) {
                holdings.entry(worker.to_string()).or_default().push(chunk);
            }
        }
    }
    let total: usize = holdings.values().map(Vec::len).sum();
    if all_workers.is_empty() || total == 0 {
        return Vec::new();
    }
    let ceiling = total.div_ceil(all_workers.len());

    let mut moves = Vec::new();
    loop {
        let (max_worker, max_load) = match holdings
            .iter()
            .max_by_key(|(worker, chunks)| (chunks.len(), std::cmp::Reverse(worker.as_str())))
        {
            Some((worker, chunks)) => (worker.clone(), chunks.len()),
            None => break,
        };
        if max_load <= ceiling {
            break;
        }
        // The least-loaded worker that does not already hold the chunk
        let candidate_chunk = holdings[&max_worker]
            .iter()
            .copied()
            .find(|chunk| {
                holdings
                    .iter()
                    .any(|(w, chunks)| *w != max_worker && !chunks.contains(chunk))
            });
        let Some(chunk) = candidate_chunk else {
            break;
        };
        let destination = match holdings
            .iter()
            .filter(|(w, chunks)| **w != max_worker && !chunks.contains(&chunk))
            .min_by_key(|(worker, chunks)| (chunks.len(), worker.as_str().to_string()))
        {
            Some((worker, _)) => worker.clone(),
            None => break,
        };
        let databases: Vec<String> = disposition
            .participating_databases(chunk)
            .into_iter()
            .filter(|db| !disposition.sources_of(db, chunk).is_empty())
            .map(str::to_string)
            .collect();
        if databases.is_empty() {
            break;
        }
        holdings.get_mut(&max_worker).expect("known worker").retain(|c| *c != chunk);
        holdings.get_mut(&destination).expect("known worker").push(chunk);
        moves.push(ChunkMove {
            chunk,
            source: max_worker,
            destination,
            databases,
        });
    }
    moves
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
    let all_workers = config.worker_names();

    let census = family_census(controller, inner, family).await?;
    let moves = plan(&all_workers, &family_databases, &census);
    info!(job = %inner.id, moves = moves.len(), "rebalance plan ready");

    let cap = config.worker.num_svc_processing_threads;
    let mut log = Vec::new();
    let mut failed_moves = 0usize;

    // Phase one: replicate every moved chunk to its new home
    let replicate_specs: Vec<RequestSpec> = moves
        .iter()
        .flat_map(|mv| {
            mv.databases.iter().map(|database| {
                RequestSpec::new(
                    mv.destination.clone(),
                    RequestKind::Replicate {
                        database: database.clone(),
                        chunk: mv.chunk,
                        worker_from: mv.source.clone(),
                    },
                )
                .priority(inner.options.priority)
            })
        })
        .collect();
    let replicated = launch_with_worker_caps(controller, inner, replicate_specs, cap).await?;
    let mut chunk_ok: BTreeMap<u32, bool> = moves.iter().map(|mv| (mv.chunk, true)).collect();
    for child in &replicated {
        if child.status.extended_state != ExtendedState::Success {
            if let RequestKind::Replicate { chunk, .. } = child.handle.kind() {
                chunk_ok.insert(*chunk, false);
            }
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

    // Phase two: drop the source copies of fully replicated chunks
    let delete_specs: Vec<RequestSpec> = moves
        .iter()
        .filter(|mv| chunk_ok.get(&mv.chunk).copied().unwrap_or(false))
        .flat_map(|mv| {
            mv.databases.iter().map(|database| {
                RequestSpec::new(
                    mv.source.clone(),
                    RequestKind::Delete {
                        database: database.clone(),
                        chunk: mv.chunk,
                    },
                )
                .priority(inner.options.priority)
            })
        })
        .collect();
    let deleted = launch_with_worker_caps(controller, inner, delete_specs, cap).await?;
    for child in &deleted {
        if child.status.extended_state != ExtendedState::Success {
            failed_moves += 1;
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
    failed_moves += chunk_ok.values().filter(|ok| !**ok).count();

    Ok(JobOutcome {
        extended: if failed_moves == 0 {
            JobExtendedState::Success
        } else {
            JobExtendedState::Failed
        },
        result: JobResultData::Stats(json!({
            "planned-moves": moves.len(),
            "failed-moves": failed_moves,
        })),
        log,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicore_shared::replica::{ReplicaInfo, ReplicaStatus};

    fn replica(worker: &str, chunk: u32) -> ReplicaInfo {
        ReplicaInfo {
            status: ReplicaStatus::Complete,
            worker: worker.into(),
            database: "D".into(),
            chunk,
            verify_time: 0,
            files: vec![],
        }
    }

    #[test]
    fn test_plan_moves_excess_chunks() {
        let workers = vec!["W1".to_string(), "W2".to_string()];
        let dbs = vec!["D".to_string()];
        // W1 holds four chunks, W2 none
        let census: Vec<ReplicaInfo> = (1..=4).map(|c| replica("W1", c)).collect();
        let moves = plan(&workers, &dbs, &census);
        assert!(!moves.is_empty());
        assert!(moves.iter().all(|mv| mv.source == "W1" && mv.destination == "W2"));
        // The plan stops once W1 is at or below the ceiling
        assert!(moves.len() == 2);
    }

    #[test]
    fn test_plan_empty_when_balanced() {
        let workers = vec!["W1".to_string(), "W2".to_string()];
        let dbs = vec!["D".to_string()];
        let census = vec![replica("W1", 1), replica("W2", 2)];
        assert!(plan(&workers, &dbs, &census).is_empty());
    }

    #[test]
    fn test_plan_empty_without_workers_or_chunks() {
        assert!(plan(&[], &["D".to_string()], &[]).is_empty());
        let workers = vec!["W1".to_string()];
        assert!(plan(&workers, &["D".to_string()], &[]).is_empty());
    }
}
