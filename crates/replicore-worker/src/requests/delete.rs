//! Replica deletion: remove every table file of a chunk from the local data
//! folder and report the resulting (absent) replica.

use replicore_shared::fs::naming::partitioned_files;
use replicore_shared::protocol::{ProtoReplicaInfo, ProtoStatusExt, ReplicaInfoResponseBody};
use replicore_shared::replica::{ReplicaInfo, ReplicaStatus};

use crate::context::WorkerContext;

use super::{ExecError, ExecResult, ExecState};

#[derive(Debug)]
pub struct DeleteWorker {
    pub database: String,
    pub chunk: u32,
    replica: Option<ReplicaInfo>,
}

impl DeleteWorker {
    pub fn new(database: String, chunk: u32) -> Self {
        Self {
            database,
            chunk,
            replica: None,
        }
    }

    pub(super) async fn execute(&mut self, ctx: &WorkerContext) -> ExecResult {
        let database = ctx.config.database(&self.database)?.clone();
        let dir = ctx.database_dir(&self.database)?;

        let _folder = ctx.data_folder_lock.lock().await;
        for name in partitioned_files(&database, self.chunk) {
            match tokio::fs::remove_file(dir.join(&name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ExecError::with(ProtoStatusExt::FileDelete, e.into())),
            }
        }
        self.replica = Some(ReplicaInfo::new(
            ReplicaStatus::NotFound,
            &ctx.worker.name,
            &self.database,
            self.chunk,
        ));
        Ok(ExecState::Done)
    }

    pub fn response(&self) -> ReplicaInfoResponseBody {
        ReplicaInfoResponseBody {
            replica: self.replica.as_ref().map(ProtoReplicaInfo::from),
        }
    }
}
