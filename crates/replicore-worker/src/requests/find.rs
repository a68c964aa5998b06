//! Replica lookup at one worker.
//!
//! Two operating modes selectable by the client: a plain stat sweep over the
//! chunk's table files, or an incremental control-sum pass that reads every
//! present file through the shared checksum engine. Filesystem activity runs
//! under the context's data-folder lock.

use std::path::PathBuf;

use replicore_shared::errors::ReplicaError;
use replicore_shared::fs::checksum::{MultiFileCsComputeEngine, DEFAULT_RECORD_SIZE_BYTES};
use replicore_shared::fs::naming::{partitioned_files, required_partitioned_files};
use replicore_shared::protocol::{ProtoReplicaInfo, ProtoStatusExt, ReplicaInfoResponseBody};
use replicore_shared::replica::{FileInfo, ReplicaInfo, ReplicaStatus};

use crate::context::WorkerContext;

use super::{ExecError, ExecResult, ExecState};

#[derive(Debug)]
enum Phase {
    Init,
    Checksum {
        engine: Option<MultiFileCsComputeEngine>,
        files: Vec<FileInfo>,
        required: Vec<String>,
    },
    Done,
}

#[derive(Debug)]
pub struct FindWorker {
    pub database: String,
    pub chunk: u32,
    pub compute_check_sum: bool,
    phase: Phase,
    replica: Option<ReplicaInfo>,
}

impl FindWorker {
    pub fn new(database: String, chunk: u32, compute_check_sum: bool) -> Self {
        Self {
            database,
            chunk,
            compute_check_sum,
            phase: Phase::Init,
            replica: None,
        }
    }

    pub(super) async fn execute(&mut self, ctx: &WorkerContext) -> ExecResult {
        if matches!(self.phase, Phase::Init) {
            self.init(ctx).await
        } else if matches!(self.phase, Phase::Checksum { .. }) {
            self.checksum_step(ctx).await
        } else {
            Ok(ExecState::Done)
        }
    }

    /// Stat every expected file of the chunk; in checksum mode hand the
    /// present ones to the engine, otherwise finish with the stat results.
    async fn init(&mut self, ctx: &WorkerContext) -> ExecResult {
        // A database dropped from the configuration is reported as a clean
        // miss, not an error
        let Ok(database) = ctx.config.database(&self.database).cloned() else {
            self.replica = Some(ReplicaInfo::new(
                ReplicaStatus::NotFound,
                &ctx.worker.name,
                &self.database,
                self.chunk,
            ));
            self.phase = Phase::Done;
            return Ok(ExecState::Done);
        };
        let dir = ctx.database_dir(&self.database)?;
        let candidate_files = partitioned_files(&database, self.chunk);
        let required = required_partitioned_files(&database, self.chunk);

        let _folder = ctx.data_folder_lock.lock().await;
        let mut present: Vec<(PathBuf, FileInfo)> = Vec::new();
        for name in candidate_files {
            let path = dir.join(&name);
            match tokio::fs::metadata(&path).await {
                Ok(metadata) => {
                    let mtime = file_mtime(&metadata).map_err(|e| {
                        ExecError::with(ProtoStatusExt::FileMtime, e)
                    })?;
                    present.push((
                        path,
                        FileInfo {
                            name,
                            size: metadata.len(),
                            mtime,
                            cs: String::new(),
                            begin_transfer_time: 0,
                            end_transfer_time: 0,
                        },
                    ));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ExecError::with(ProtoStatusExt::FileStat, e.into()));
                }
            }
        }

        if self.compute_check_sum && !present.is_empty() {
            let paths = present.iter().map(|(path, _)| path.clone()).collect();
            let engine = MultiFileCsComputeEngine::new(paths, DEFAULT_RECORD_SIZE_BYTES)?;
            self.phase = Phase::Checksum {
                engine: Some(engine),
                files: present.into_iter().map(|(_, info)| info).collect(),
                required,
            };
            return Ok(ExecState::Continue);
        }

        self.finish_with(
            ctx,
            present.into_iter().map(|(_, info)| info).collect(),
            &required,
        );
        Ok(ExecState::Done)
    }

    /// Drive the checksum engine one record forward
    async fn checksum_step(&mut self, ctx: &WorkerContext) -> ExecResult {
        let Phase::Checksum {
            engine,
            files,
            required,
        } = &mut self.phase
        else {
            return Err(ExecError::from(ReplicaError::illegal_state(
                "checksum step without an engine",
            )));
        };
        let mut running = engine
            .take()
            .ok_or_else(|| ReplicaError::illegal_state("checksum engine already consumed"))?;

        let _folder = ctx.data_folder_lock.lock().await;
        let (running, finished) = tokio::task::spawn_blocking(move || {
            let result = running.execute();
            (running, result)
        })
        .await
        .map_err(|e| ReplicaError::worker(format!("checksum task panicked: {e}")))?;
        let finished =
            finished.map_err(|e| ExecError::with(ProtoStatusExt::FileRead, e))?;

        if !finished {
            *engine = Some(running);
            return Ok(ExecState::Continue);
        }

        let mut files = std::mem::take(files);
        for (file, result) in files.iter_mut().zip(running.results()) {
            file.cs = result.cs.to_string();
        }
        let required = std::mem::take(required);
        self.finish_with(ctx, files, &required);
        Ok(ExecState::Done)
    }

    fn finish_with(&mut self, ctx: &WorkerContext, files: Vec<FileInfo>, required: &[String]) {
        let status = if files.is_empty() {
            ReplicaStatus::NotFound
        } else if required
            .iter()
            .all(|name| files.iter().any(|file| &file.name == name))
        {
            ReplicaStatus::Complete
        } else {
            ReplicaStatus::Incomplete
        };
        let mut replica = ReplicaInfo::new(status, &ctx.worker.name, &self.database, self.chunk);
        replica.files = files;
        self.replica = Some(replica);
        self.phase = Phase::Done;
    }

    pub fn response(&self) -> ReplicaInfoResponseBody {
        ReplicaInfoResponseBody {
            replica: self.replica.as_ref().map(ProtoReplicaInfo::from),
        }
    }
}

pub(crate) fn file_mtime(metadata: &std::fs::Metadata) -> Result<u64, ReplicaError> {
    let modified = metadata.modified()?;
    Ok(modified
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|_| ReplicaError::worker("file mtime before the epoch"))?
        .as_secs())
}

pub(crate) use file_mtime as mtime_of;
