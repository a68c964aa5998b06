//! The controller: factory and registry of active requests and jobs.
//!
//! Requests register on start and unregister on finish, both under the
//! registry mutex; jobs use the same discipline. The controller exposes the
//! typed submission API consumed by the job family and the REST layer.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use replicore_shared::errors::{ReplicaError, ReplicaResult};

use crate::jobs::{JobHandle, JobKind, JobSpec};
use crate::requests::{create_request, drive, RequestHandle, RequestSpec};
use crate::service_provider::ServiceProvider;

/// How long a finished request remains inspectable in the registry
const REQUEST_RETENTION_SEC: u64 = 60;

/// The controller of one replication control plane
#[derive(Debug)]
pub struct Controller {
    pub provider: Arc<ServiceProvider>,
    requests: std::sync::Mutex<HashMap<String, RequestHandle>>,
    jobs: std::sync::Mutex<HashMap<String, JobHandle>>,
}

impl Controller {
    pub fn new(provider: Arc<ServiceProvider>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            requests: std::sync::Mutex::new(HashMap::new()),
            jobs: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, HashMap<String, RequestHandle>> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobHandle>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create, register and start one request; its driver task runs until a
    /// terminal state is latched.
    pub fn submit_request(self: &Arc<Self>, spec: RequestSpec) -> ReplicaResult<RequestHandle> {
        self.provider.config.assert_worker_is_valid(&spec.worker)?;
        let handle = create_request(&spec);
        {
            let mut requests = self.lock_requests();
            requests.insert(handle.id().to_string(), handle.clone());
        }
        debug!(id = %handle.id(), worker = %spec.worker, "request registered");

        let controller = Arc::clone(self);
        let provider = Arc::clone(&self.provider);
        let driver_handle = handle.clone();
        tokio::spawn(async move {
            // Finished requests stay visible for a short inspection window
            // before they are dropped from the registry
            let unregister = {
                let controller = Arc::clone(&controller);
                move |id: &str| {
                    let id = id.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_secs(
                            REQUEST_RETENTION_SEC,
                        ))
                        .await;
                        controller.lock_requests().remove(&id);
                        debug!(id = %id, "request unregistered");
                    });
                }
            };
            drive(driver_handle, provider, unregister).await;
        });
        Ok(handle)
    }

    /// An active (started, unfinished) request by id
    pub fn request(&self, id: &str) -> Option<RequestHandle> {
        self.lock_requests().get(id).cloned()
    }

    /// Ids of all active requests
    pub fn active_request_ids(&self) -> Vec<String> {
        self.lock_requests().keys().cloned().collect()
    }

    /// Cancel an active request; `false` when the id is unknown (already
    /// finished requests are not retained by the registry)
    pub fn cancel_request(&self, id: &str) -> bool {
        match self.request(id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Create, register and start one job
    pub fn submit_job(self: &Arc<Self>, kind: JobKind, spec: JobSpec) -> ReplicaResult<JobHandle> {
        let handle = crate::jobs::start_job(Arc::clone(self), kind, spec)?;
        self.lock_jobs()
            .insert(handle.id().to_string(), handle.clone());
        Ok(handle)
    }

    /// A job by id; jobs are retained until explicitly dropped
    pub fn job(&self, id: &str) -> Option<JobHandle> {
        self.lock_jobs().get(id).cloned()
    }

    pub fn cancel_job(&self, id: &str) -> bool {
        match self.job(id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop a finished job from the registry
    pub fn dispose_job(&self, id: &str) -> ReplicaResult<()> {
        let mut jobs = self.lock_jobs();
        let handle = jobs
            .get(id)
            .ok_or_else(|| ReplicaError::not_found(format!("job '{id}'")))?;
        if !handle.is_finished() {
            return Err(ReplicaError::illegal_state(format!(
                "job '{id}' is still running"
            )));
        }
        jobs.remove(id);
        Ok(())
    }
}
