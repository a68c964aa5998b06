//! Replica creation: pull every table file of a chunk from a source worker
//! into the local data folder, one file per execution step so cancellation
//! is observed between transfers.

use replicore_shared::errors::ReplicaError;
use replicore_shared::fs::naming::partitioned_files;
use replicore_shared::protocol::{now_ms, ProtoReplicaInfo, ProtoStatusExt, ReplicaInfoResponseBody};
use replicore_shared::replica::{FileInfo, ReplicaInfo, ReplicaStatus};

use crate::context::WorkerContext;

use super::{ExecError, ExecResult, ExecState};

#[derive(Debug)]
enum Phase {
    Init,
    Fetch { files: Vec<String>, next: usize },
    Done,
}

#[derive(Debug)]
pub struct ReplicateWorker {
    pub database: String,
    pub chunk: u32,
    pub worker_from: String,
    phase: Phase,
    fetched: Vec<FileInfo>,
    replica: Option<ReplicaInfo>,
}

impl ReplicateWorker {
    pub fn new(database: String, chunk: u32, worker_from: String) -> Self {
        Self {
            database,
            chunk,
            worker_from,
            phase: Phase::Init,
            fetched: Vec::new(),
            replica: None,
        }
    }

    pub(super) async fn execute(&mut self, ctx: &WorkerContext) -> ExecResult {
        if matches!(self.phase, Phase::Init) {
            self.init(ctx).await
        } else if matches!(self.phase, Phase::Fetch { .. }) {
            self.fetch_one(ctx).await
        } else {
            Ok(ExecState::Done)
        }
    }

    async fn init(&mut self, ctx: &WorkerContext) -> ExecResult {
        let database = ctx.config.database(&self.database)?.clone();
        if self.worker_from == ctx.worker.name {
            return Err(ExecError::with(
                ProtoStatusExt::InvalidParam,
                ReplicaError::invalid_argument("source and destination workers coincide"),
            ));
        }
        let dir = ctx.database_dir(&self.database)?;
        {
            let _folder = ctx.data_folder_lock.lock().await;
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| ExecError::with(ProtoStatusExt::FolderCreate, e.into()))?;
        }
        self.phase = Phase::Fetch {
            files: partitioned_files(&database, self.chunk),
            next: 0,
        };
        Ok(ExecState::Continue)
    }

    async fn fetch_one(&mut self, ctx: &WorkerContext) -> ExecResult {
        let name = {
            let Phase::Fetch { files, next } = &mut self.phase else {
                return Err(ExecError::from(ReplicaError::illegal_state(
                    "fetch step before initialization",
                )));
            };
            if *next >= files.len() {
                None
            } else {
                let name = files[*next].clone();
                *next += 1;
                Some(name)
            }
        };
        let Some(name) = name else {
            return self.finalize(ctx);
        };

        let dir = ctx.database_dir(&self.database)?;
        let dest = dir.join(&name);
        let begin_transfer_time = now_ms();
        let _folder = ctx.data_folder_lock.lock().await;
        match ctx
            .fetcher
            .fetch_file(&self.worker_from, &self.database, &name, &dest)
            .await
        {
            Ok(size) => {
                self.fetched.push(FileInfo {
                    name,
                    size,
                    mtime: now_ms() / 1000,
                    cs: String::new(),
                    begin_transfer_time,
                    end_transfer_time: now_ms(),
                });
                Ok(ExecState::Continue)
            }
            // The source may legitimately lack overlap files of a chunk;
            // anything else fails the transfer
            Err(ReplicaError::TransportError(message))
                if message.contains("No such file") || message.contains("404") =>
            {
                tracing::debug!(file = %name, "skipping absent source file: {message}");
                Ok(ExecState::Continue)
            }
            Err(e) => Err(ExecError::with(ProtoStatusExt::FileCopy, e)),
        }
    }

    fn finalize(&mut self, ctx: &WorkerContext) -> ExecResult {
        let status = if self.fetched.is_empty() {
            ReplicaStatus::NotFound
        } else {
            ReplicaStatus::Complete
        };
        let mut replica = ReplicaInfo::new(status, &ctx.worker.name, &self.database, self.chunk);
        replica.files = std::mem::take(&mut self.fetched);
        self.replica = Some(replica);
        self.phase = Phase::Done;
        Ok(ExecState::Done)
    }

    pub fn response(&self) -> ReplicaInfoResponseBody {
        ReplicaInfoResponseBody {
            replica: self.replica.as_ref().map(ProtoReplicaInfo::from),
        }
    }
}
