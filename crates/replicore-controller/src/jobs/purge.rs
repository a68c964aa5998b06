//! Purge job: remove replicas beyond the family's replication level,
//! releasing each removed replica at the query service first.

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

    let census = family_census(controller, inner, family).await?;
    let disposition = ChunkDisposition::new(&family_databases, &census);

    let mut log = Vec::new();
    let mut specs = Vec::new();
    let mut in_use = false;
    let mut release_failed = false;
    for chunk in disposition.chunks() {
        let mut holders: Vec<String> = disposition
            .workers_of(chunk)
            .into_iter()
            .filter(|w| disposition.is_colocated(chunk, w))
            .map(str::to_string)
            .collect();
        if holders.len() <= level {
            continue;
        }
        // Deterministic victim choice: the lexicographically last holders go
        holders.sort();
        let victims: Vec<String> = holders.split_off(level);
        let participating: Vec<String> = disposition
            .participating_databases(chunk)
            .into_iter()
            .map(str::to_string)
            .collect();
        for victim in victims {
            // The query service must release the replica before its files
            // are removed
            let mut released = true;
            for database in &participating {
                match run_mgt_request(
                    &controller.provider,
                    &victim,
                    MgtRequestKind::RemoveReplica {
                        database: database.clone(),
                        chunk,
                        force: false,
                    },
                )
                .await
                {
                    Ok(status) if status.extended_state == MgtExtendedState::Success => {}
                    Ok(status) if status.extended_state == MgtExtendedState::InUse => {
                        warn!(job = %inner.id, chunk, worker = %victim, "replica still in use");
                        in_use = true;
                        released = false;
                        log.push((
                            "replica-in-use".to_string(),
                            json!({"worker": victim, "database": database, "chunk": chunk}),
                        ));
                    }
                    Ok(status) => {
                        release_failed = true;
                        released = false;
                        log.push((
                            "qserv-notify-failed".to_string(),
                            json!({
                                "worker": victim,
                                "database": database,
                                "chunk": chunk,
                                "error": status.error,
                            }),
                        ));
                    }
                    Err(e) => {
                        release_failed = true;
                        released = false;
                        log.push((
                            "qserv-notify-failed".to_string(),
                            json!({
                                "worker": victim,
                                "database": database,
                                "chunk": chunk,
                                "error": e.to_string(),
                            }),
                        ));
                    }
                }
            }
            if !released {
                continue;
            }
            for database in &participating {
                specs.push(
                    RequestSpec::new(
                        victim.clone(),
                        RequestKind::Delete {
                            database: database.clone(),
                            chunk,
                        },
                    )
                    .priority(inner.options.priority),
                );
            }
        }
    }

    info!(job = %inner.id, tasks = specs.len(), "purge plan ready");
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

    let extended = if failed > 0 {
        JobExtendedState::Failed
    } else if in_use {
        JobExtendedState::QservInUse
    } else if release_failed {
        JobExtendedState::QservFailed
    } else {
        JobExtendedState::Success
    };
    Ok(JobOutcome {
        extended,
        result: JobResultData::Stats(json!({
            "total": children.len(),
            "failed": failed,
        })),
        log,
    })
}
