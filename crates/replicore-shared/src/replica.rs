//! Replica census data model.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Completeness of one replica
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaStatus {
    /// No files of the chunk were found at the worker
    NotFound,
    /// Some files are present or some failed validation
    Incomplete,
    /// Every expected file is present
    Complete,
}

impl ReplicaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaStatus::NotFound => "NOT_FOUND",
            ReplicaStatus::Incomplete => "INCOMPLETE",
            ReplicaStatus::Complete => "COMPLETE",
        }
    }
}

impl std::fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file of a replica as observed at a worker
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// Modification time, seconds since the epoch
    pub mtime: u64,
    /// Decimal string form of the control sum; empty when not computed
    pub cs: String,
    pub begin_transfer_time: u64,
    pub end_transfer_time: u64,
}

/// A concrete `(worker, database, chunk)` replica and its files
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub status: ReplicaStatus,
    pub worker: String,
    pub database: String,
    pub chunk: u32,
    /// When the replica was last verified, milliseconds since the epoch
    pub verify_time: u64,
    pub files: Vec<FileInfo>,
}

impl ReplicaInfo {
    pub fn new(status: ReplicaStatus, worker: &str, database: &str, chunk: u32) -> Self {
        Self {
            status,
            worker: worker.to_string(),
            database: database.to_string(),
            chunk,
            verify_time: crate::protocol::now_ms(),
            files: Vec::new(),
        }
    }
}

/// The census of replicas across a database family, and the co-location
/// predicate derived from it.
///
/// Built from the result of a find-all sweep: for every chunk the set of
/// workers holding a `COMPLETE` replica of every participating database of
/// the family.
#[derive(Clone, Debug, Default)]
pub struct ChunkDisposition {
    /// Databases of the family the census was built for
    databases: Vec<String>,
    /// `(database, chunk) -> workers` holding a COMPLETE replica
    complete: HashMap<(String, u32), BTreeSet<String>>,
    /// `chunk -> workers` holding any replica of any database of the family
    present: BTreeMap<u32, BTreeSet<String>>,
    /// `chunk -> databases` with any replica of the chunk
    present_databases: BTreeMap<u32, BTreeSet<String>>,
}

impl ChunkDisposition {
    /// Build the disposition from a replica census limited to one family
    pub fn new(family_databases: &[String], replicas: &[ReplicaInfo]) -> Self {
        let mut disposition = Self {
            databases: family_databases.to_vec(),
            ..Self::default()
        };
        for replica in replicas {
            if !family_databases.contains(&replica.database) {
                continue;
            }
            disposition
                .present
                .entry(replica.chunk)
                .or_default()
                .insert(replica.worker.clone());
            disposition
                .present_databases
                .entry(replica.chunk)
                .or_default()
                .insert(replica.database.clone());
            if replica.status == ReplicaStatus::Complete {
                disposition
                    .complete
                    .entry((replica.database.clone(), replica.chunk))
                    .or_default()
                    .insert(replica.worker.clone());
            }
        }
        disposition
    }

    /// Databases of the family participating in a chunk: those with any
    /// replica of it observed anywhere, complete or not
    pub fn participating_databases(&self, chunk: u32) -> Vec<&str> {
        self.present_databases
            .get(&chunk)
            .map(|dbs| dbs.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// All chunks known to the census
    pub fn chunks(&self) -> Vec<u32> {
        self.present.keys().copied().collect()
    }

    /// Workers holding any replica of a chunk
    pub fn workers_of(&self, chunk: u32) -> Vec<&str> {
        self.present
            .get(&chunk)
            .map(|workers| workers.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Workers holding a COMPLETE replica of `(database, chunk)`
    pub fn sources_of(&self, database: &str, chunk: u32) -> Vec<&str> {
        self.complete
            .get(&(database.to_string(), chunk))
            .map(|workers| workers.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// A worker is co-located for a chunk when it holds a COMPLETE replica
    /// of every database of the family participating in that chunk.
    pub fn is_colocated(&self, chunk: u32, worker: &str) -> bool {
        let participating = self.participating_databases(chunk);
        if participating.is_empty() {
            return true;
        }
        participating.iter().all(|db| {
            self.complete
                .get(&(db.to_string(), chunk))
                .is_some_and(|workers| workers.contains(worker))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(worker: &str, db: &str, chunk: u32, status: ReplicaStatus) -> ReplicaInfo {
        ReplicaInfo {
            status,
            worker: worker.into(),
            database: db.into(),
            chunk,
            verify_time: 0,
            files: vec![],
        }
    }

    #[test]
    fn test_colocated_when_all_databases_present() {
        let dbs = vec!["D1".to_string(), "D2".to_string()];
        let census = vec![
            replica("W1", "D1", 7, ReplicaStatus::Complete),
            replica("W1", "D2", 7, ReplicaStatus::Complete),
            replica("W2", "D1", 7, ReplicaStatus::Complete),
        ];
        let disposition = ChunkDisposition::new(&dbs, &census);
        assert!(disposition.is_colocated(7, "W1"));
        assert!(!disposition.is_colocated(7, "W2"));
    }

    #[test]
    fn test_incomplete_replica_is_not_a_source() {
        let dbs = vec!["D1".to_string()];
        let census = vec![replica("W1", "D1", 3, ReplicaStatus::Incomplete)];
        let disposition = ChunkDisposition::new(&dbs, &census);
        assert!(disposition.sources_of("D1", 3).is_empty());
        assert_eq!(disposition.workers_of(3), vec!["W1"]);
    }

    #[test]
    fn test_foreign_database_ignored() {
        let dbs = vec!["D1".to_string()];
        let census = vec![replica("W1", "Other", 3, ReplicaStatus::Complete)];
        let disposition = ChunkDisposition::new(&dbs, &census);
        assert!(disposition.chunks().is_empty());
    }
}
