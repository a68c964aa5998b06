//! Verification job: re-read every complete replica of a family with
//! control sums and flag files whose sums disagree across replicas of the
//! same chunk.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use replicore_shared::errors::ReplicaResult;
use replicore_shared::replica::ReplicaStatus;

use crate::controller::Controller;
use crate::requests::{ExtendedState, RequestKind, RequestPayload, RequestSpec};

use super::{
    family_census, launch_with_worker_caps, JobExtendedState, JobInner, JobOutcome, JobResultData,
};

pub(crate) async fn run(
    controller: &Arc<Controller>,
    inner: &Arc<JobInner>,
    family: &str,
) -> ReplicaResult<JobOutcome> {
    let config = &controller.provider.config;
    config.family(family)?;

    let census = family_census(controller, inner, family).await?;
    let specs: Vec<RequestSpec> = census
        .iter()
        .filter(|replica| replica.status == ReplicaStatus::Complete)
        .map(|replica| {
            RequestSpec::new(
                replica.worker.clone(),
                RequestKind::Find {
                    database: replica.database.clone(),
                    chunk: replica.chunk,
                    compute_check_sum: true,
                },
            )
            .priority(inner.options.priority)
        })
        .collect();

    info!(job = %inner.id, replicas = specs.len(), "verification sweep ready");
    let cap = config.worker.num_svc_processing_threads;
    let children = launch_with_worker_caps(controller, inner, specs, cap).await?;

    let mut log = Vec::new();
    let mut failed = 0usize;
    // `(database, chunk, file) -> cs -> holders`
    let mut sums: BTreeMap<(String, u32, String), BTreeMap<String, Vec<String>>> = BTreeMap::new();
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
            continue;
        }
        if let RequestPayload::Replica(replica) = &child.status.payload {
            for file in &replica.files {
                sums.entry((replica.database.clone(), replica.chunk, file.name.clone()))
                    .or_default()
                    .entry(file.cs.clone())
                    .or_default()
                    .push(replica.worker.clone());
            }
        }
    }

    let mut inconsistent = 0usize;
    for ((database, chunk, file), by_cs) in &sums {
        if by_cs.len() > 1 {
            inconsistent += 1;
            warn!(
                job = %inner.id,
                database = %database,
                chunk,
                file = %file,
                "control sums disagree across replicas"
            );
            log.push((
                "inconsistent-replica".to_string(),
                json!({
                    "database": database,
                    "chunk": chunk,
                    "file": file,
                    "sums": by_cs,
                }),
            ));
        }
    }

    Ok(JobOutcome {
        extended: if failed == 0 {
            JobExtendedState::Success
        } else {
            JobExtendedState::Failed
        },
        result: JobResultData::Stats(json!({
            "verified": children.len(),
            "failed": failed,
            "inconsistent-files": inconsistent,
        })),
        log,
    })
}
