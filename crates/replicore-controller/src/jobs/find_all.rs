//! Census job: sweep every worker for every database of a family and
//! aggregate the replica collection, optionally persisting it.

use std::sync::Arc;

use serde_json::json;

use replicore_shared::errors::ReplicaResult;
use replicore_shared::replica::ReplicaInfo;

use crate::controller::Controller;
use crate::requests::{ExtendedState, RequestKind, RequestPayload, RequestSpec};

use super::{launch_with_worker_caps, JobExtendedState, JobInner, JobOutcome, JobResultData};

pub(crate) async fn run(
    controller: &Arc<Controller>,
    inner: &Arc<JobInner>,
    family: &str,
    save_replica_info: bool,
) -> ReplicaResult<JobOutcome> {
    let config = &controller.provider.config;
    config.family(family)?;
    let databases = config.family_databases(family);
    let workers = config.worker_names();

    let mut specs = Vec::with_capacity(databases.len() * workers.len());
    for database in &databases {
        for worker in &workers {
            specs.push(
                RequestSpec::new(
                    worker.clone(),
                    RequestKind::FindAll {
                        database: database.name.clone(),
                        save_replica_info,
                    },
                )
                .priority(inner.options.priority),
            );
        }
    }

    let cap = config.worker.num_svc_processing_threads;
    let children = launch_with_worker_caps(controller, inner, specs, cap).await?;

    let mut census: Vec<ReplicaInfo> = Vec::new();
    let mut log = Vec::new();
    let mut failed = 0usize;
    for child in children {
        if child.status.extended_state == ExtendedState::Success {
            if let RequestPayload::Replicas(replicas) = child.status.payload {
                census.extend(replicas);
            }
        } else {
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

    Ok(JobOutcome {
        extended: if failed == 0 {
            JobExtendedState::Success
        } else {
            JobExtendedState::Failed
        },
        result: JobResultData::Census(census),
        log,
    })
}
