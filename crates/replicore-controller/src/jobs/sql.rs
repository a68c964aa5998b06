//! SQL broadcast job: run one schema-maintenance operation on every worker
//! and aggregate the per-worker outcomes.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use replicore_shared::errors::ReplicaResult;
use replicore_shared::protocol::SqlRequestBody;

use crate::controller::Controller;
use crate::requests::{ExtendedState, RequestKind, RequestSpec};

use super::{
    launch_with_worker_caps, JobExtendedState, JobInner, JobOutcome, JobResultData,
};

pub(crate) async fn run(
    controller: &Arc<Controller>,
    inner: &Arc<JobInner>,
    body: SqlRequestBody,
) -> ReplicaResult<JobOutcome> {
    let config = &controller.provider.config;
    let workers = config.worker_names();
    let specs: Vec<RequestSpec> = workers
        .iter()
        .map(|worker| {
            RequestSpec::new(worker.clone(), RequestKind::Sql { body: body.clone() })
                .priority(inner.options.priority)
        })
        .collect();

    info!(job = %inner.id, workers = specs.len(), "SQL broadcast ready");
    let cap = config.worker.num_svc_processing_threads;
    let children = launch_with_worker_caps(controller, inner, specs, cap).await?;

    let mut log = Vec::new();
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

    Ok(JobOutcome {
        extended: if failed == 0 {
            JobExtendedState::Success
        } else {
            JobExtendedState::Failed
        },
        result: JobResultData::Stats(json!({
            "workers": children.len(),
            "failed": failed,
        })),
        log,
    })
}
