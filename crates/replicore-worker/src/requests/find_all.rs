//! Census sweep: enumerate every replica of one database present in this
//! worker's data folder.

use std::collections::BTreeMap;

use replicore_shared::fs::naming::{parse_partitioned_file, required_partitioned_files};
use replicore_shared::protocol::{ProtoReplicaInfo, ProtoStatusExt, ReplicaInfoCollectionResponseBody};
use replicore_shared::replica::{FileInfo, ReplicaInfo, ReplicaStatus};

use crate::context::WorkerContext;

use super::{ExecError, ExecResult, ExecState};

#[derive(Debug)]
pub struct FindAllWorker {
    pub database: String,
    replicas: Vec<ReplicaInfo>,
}

impl FindAllWorker {
    pub fn new(database: String) -> Self {
        Self {
            database,
            replicas: Vec::new(),
        }
    }

    pub(super) async fn execute(&mut self, ctx: &WorkerContext) -> ExecResult {
        // A database dropped from the configuration yields an empty census
        let Ok(database) = ctx.config.database(&self.database).cloned() else {
            return Ok(ExecState::Done);
        };
        let dir = ctx.database_dir(&self.database)?;

        let _folder = ctx.data_folder_lock.lock().await;
        let mut by_chunk: BTreeMap<u32, Vec<FileInfo>> = BTreeMap::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ExecState::Done);
            }
            Err(e) => return Err(ExecError::with(ProtoStatusExt::FolderStat, e.into())),
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(ExecError::with(ProtoStatusExt::FolderStat, e.into())),
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(parsed) = parse_partitioned_file(&name, &database) else {
                continue;
            };
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| ExecError::with(ProtoStatusExt::FileStat, e.into()))?;
            let mtime = super::find::mtime_of(&metadata)
                .map_err(|e| ExecError::with(ProtoStatusExt::FileMtime, e))?;
            by_chunk.entry(parsed.chunk).or_default().push(FileInfo {
                name,
                size: metadata.len(),
                mtime,
                cs: String::new(),
                begin_transfer_time: 0,
                end_transfer_time: 0,
            });
        }

        self.replicas = by_chunk
            .into_iter()
            .map(|(chunk, files)| {
                let complete = required_partitioned_files(&database, chunk)
                    .iter()
                    .all(|name| files.iter().any(|file| &file.name == name));
                let status = if complete {
                    ReplicaStatus::Complete
                } else {
                    ReplicaStatus::Incomplete
                };
                let mut replica =
                    ReplicaInfo::new(status, &ctx.worker.name, &self.database, chunk);
                replica.files = files;
                replica
            })
            .collect();
        Ok(ExecState::Done)
    }

    pub fn response(&self) -> ReplicaInfoCollectionResponseBody {
        ReplicaInfoCollectionResponseBody {
            replicas: self.replicas.iter().map(ProtoReplicaInfo::from).collect(),
        }
    }
}
