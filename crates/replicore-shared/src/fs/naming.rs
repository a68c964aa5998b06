//! On-disk and in-database naming conventions.
//!
//! Partitioned table files follow `<table>_<chunk>.<ext>` and
//! `<table>FullOverlap_<chunk>.<ext>` with `<ext>` one of the database file
//! extensions. The director-index table of a database is `<db>__<director>`,
//! the per-table row-counters table is `<db>__<table>__rows`, and worker
//! result files are `<czarId>-<queryId>-<jobId>-<chunkId>-<attemptCount>.proto`.
//!
//! Every parser here is defensive: numeric components are range-checked and
//! anything not matching a template is rejected.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::DatabaseInfo;
use crate::errors::{ReplicaError, ReplicaResult};

/// File extensions of a partitioned table
pub const TABLE_FILE_EXTENSIONS: [&str; 3] = ["frm", "MYD", "MYI"];

/// Marker of the overlap variant of a partitioned table
pub const OVERLAP_SUFFIX: &str = "FullOverlap";

static PARTITIONED_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9_]+?)(FullOverlap)?_(\d+)\.(frm|MYD|MYI)$").expect("valid regex")
});

static RESULT_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)-(\d+)-(\d+)-(\d+)-(\d+)\.proto$").expect("valid regex"));

/// All file names of a database's partitioned tables for one chunk, base
/// tables and overlap tables alike
pub fn partitioned_files(database: &DatabaseInfo, chunk: u32) -> Vec<String> {
    let mut files = Vec::with_capacity(database.partitioned_tables.len() * 6);
    for table in &database.partitioned_tables {
        for ext in TABLE_FILE_EXTENSIONS {
            files.push(format!("{table}_{chunk}.{ext}"));
        }
        for ext in TABLE_FILE_EXTENSIONS {
            files.push(format!("{table}{OVERLAP_SUFFIX}_{chunk}.{ext}"));
        }
    }
    files
}

/// The file names a replica must hold to count as complete: the base table
/// files. Overlap files exist only for chunks with spatial neighbours and
/// are never required.
pub fn required_partitioned_files(database: &DatabaseInfo, chunk: u32) -> Vec<String> {
    let mut files = Vec::with_capacity(database.partitioned_tables.len() * 3);
    for table in &database.partitioned_tables {
        for ext in TABLE_FILE_EXTENSIONS {
            files.push(format!("{table}_{chunk}.{ext}"));
        }
    }
    files
}

/// A successfully parsed partitioned table file name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionedFile {
    /// Table name including the overlap suffix where it applies
    pub table: String,
    pub chunk: u32,
    pub ext: String,
}

/// Parse a partitioned table file name against a database's table set.
///
/// Returns `None` for names that do not match the templates, reference a
/// table unknown to the database, or carry an out-of-range chunk number.
pub fn parse_partitioned_file(name: &str, database: &DatabaseInfo) -> Option<PartitionedFile> {
    let captures = PARTITIONED_FILE_RE.captures(name)?;
    let base_table = captures.get(1)?.as_str();
    let overlap = captures.get(2).is_some();
    let chunk: u32 = captures.get(3)?.as_str().parse().ok()?;
    let ext = captures.get(4)?.as_str();
    if !database.partitioned_tables.iter().any(|t| t == base_table) {
        return None;
    }
    let table = if overlap {
        format!("{base_table}{OVERLAP_SUFFIX}")
    } else {
        base_table.to_string()
    };
    Some(PartitionedFile {
        table,
        chunk,
        ext: ext.to_string(),
    })
}

/// Name of the director-index table of a database
pub fn director_index_table(database: &str, director_table: &str) -> String {
    format!("{database}__{director_table}")
}

/// Name of the per-table row-counters table
pub fn row_counters_table(database: &str, table: &str) -> String {
    format!("{database}__{table}__rows")
}

/// The name of a query result file produced by a worker.
///
/// Components are range-validated at construction: every component fits a
/// `u32` except the query id which is a `u64`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResultFileName {
    pub czar_id: u32,
    pub query_id: u64,
    pub job_id: u32,
    pub chunk_id: u32,
    pub attempt_count: u32,
}

impl ResultFileName {
    pub fn new(
        czar_id: u64,
        query_id: u64,
        job_id: u64,
        chunk_id: u64,
        attempt_count: u64,
    ) -> ReplicaResult<Self> {
        let narrow = |value: u64, component: &str| -> ReplicaResult<u32> {
            u32::try_from(value).map_err(|_| {
                ReplicaError::invalid_argument(format!(
                    "result file component '{component}' out of range: {value}"
                ))
            })
        };
        Ok(Self {
            czar_id: narrow(czar_id, "czarId")?,
            query_id,
            job_id: narrow(job_id, "jobId")?,
            chunk_id: narrow(chunk_id, "chunkId")?,
            attempt_count: narrow(attempt_count, "attemptCount")?,
        })
    }

    /// Parse a rendered file name back into its components
    pub fn parse(name: &str) -> ReplicaResult<Self> {
        let captures = RESULT_FILE_RE.captures(name).ok_or_else(|| {
            ReplicaError::invalid_argument(format!("not a result file name: '{name}'"))
        })?;
        let component = |idx: usize| -> ReplicaResult<u64> {
            captures
                .get(idx)
                .expect("group exists when the pattern matched")
                .as_str()
                .parse::<u64>()
                .map_err(|_| {
                    ReplicaError::invalid_argument(format!(
                        "numeric overflow in result file name: '{name}'"
                    ))
                })
        };
        Self::new(
            component(1)?,
            component(2)?,
            component(3)?,
            component(4)?,
            component(5)?,
        )
    }
}

impl std::fmt::Display for ResultFileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}-{}.proto",
            self.czar_id, self.query_id, self.job_id, self.chunk_id, self.attempt_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database() -> DatabaseInfo {
        DatabaseInfo {
            name: "D".into(),
            family: "production".into(),
            director_table: "Obj".into(),
            partitioned_tables: vec!["Obj".into(), "Src".into()],
            regular_tables: vec![],
            is_published: false,
        }
    }

    #[test]
    fn test_partitioned_files_enumeration() {
        let files = partitioned_files(&database(), 42);
        assert_eq!(files.len(), 12);
        assert!(files.contains(&"Obj_42.MYD".to_string()));
        assert!(files.contains(&"ObjFullOverlap_42.frm".to_string()));
        assert!(files.contains(&"Src_42.MYI".to_string()));
    }

    #[test]
    fn test_parse_partitioned_file() {
        let parsed = parse_partitioned_file("Obj_42.MYD", &database()).unwrap();
        assert_eq!(parsed.table, "Obj");
        assert_eq!(parsed.chunk, 42);
        assert_eq!(parsed.ext, "MYD");

        let overlap = parse_partitioned_file("SrcFullOverlap_7.frm", &database()).unwrap();
        assert_eq!(overlap.table, "SrcFullOverlap");
        assert_eq!(overlap.chunk, 7);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let db = database();
        assert!(parse_partitioned_file("Obj_42.db", &db).is_none());
        assert!(parse_partitioned_file("Unknown_42.MYD", &db).is_none());
        assert!(parse_partitioned_file("Obj_.MYD", &db).is_none());
        assert!(parse_partitioned_file("Obj_99999999999999.MYD", &db).is_none());
        assert!(parse_partitioned_file("../Obj_42.MYD", &db).is_none());
    }

    #[test]
    fn test_table_names() {
        assert_eq!(director_index_table("D", "Obj"), "D__Obj");
        assert_eq!(row_counters_table("D", "Src"), "D__Src__rows");
    }

    #[test]
    fn test_result_file_round_trip() {
        let name = ResultFileName::new(3, 987654321098, 12, 42, 1).unwrap();
        let rendered = name.to_string();
        assert_eq!(rendered, "3-987654321098-12-42-1.proto");
        assert_eq!(ResultFileName::parse(&rendered).unwrap(), name);
    }

    #[test]
    fn test_result_file_range_checks() {
        assert!(ResultFileName::new(u64::MAX, 1, 1, 1, 1).is_err());
        assert!(ResultFileName::new(1, u64::MAX, 1, 1, 1).is_ok());
        assert!(ResultFileName::parse("1-2-3-4.proto").is_err());
        assert!(ResultFileName::parse("1-2-3-4-5.txt").is_err());
        assert!(ResultFileName::parse("99999999999-2-3-4-5.proto").is_err());
    }
}
