//! The worker's embedded schema/query service.
//!
//! The real SQL engine is an external collaborator; this module is its
//! contract plus a transient implementation backed by an in-memory catalog.
//! The request family, the ingest loader and the director-index extractor
//! all go through this interface, so a production engine plugs in behind it
//! without touching the request machinery.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Mutex;

use replicore_shared::errors::{ReplicaError, ReplicaResult};
use replicore_shared::protocol::{ProtoSqlRow, SqlRequestBody, SqlResponseBody};
use replicore_shared::sql::{IndexColumn, IndexSpec, SqlOperation};

#[derive(Debug, Default, Clone)]
struct TableState {
    columns: Vec<(String, String)>,
    is_partitioned: bool,
    /// Transaction-id keyed partitions of a partitioned table
    partitions: BTreeSet<u32>,
    indexes: BTreeMap<String, (IndexSpec, Vec<IndexColumn>)>,
    /// Loaded row counts per chunk
    rows_per_chunk: BTreeMap<u32, u64>,
    /// Director-index payloads per chunk, keyed by transaction id (0 when
    /// transactions are not in use)
    index_data: BTreeMap<(u32, u32), Vec<u8>>,
}

#[derive(Debug, Default, Clone)]
struct DatabaseState {
    enabled: bool,
    grants: BTreeSet<String>,
    tables: BTreeMap<String, TableState>,
}

#[derive(Debug, Default)]
struct Catalog {
    databases: BTreeMap<String, DatabaseState>,
}

/// Transient schema/query service
#[derive(Debug, Default)]
pub struct SqlBackend {
    catalog: Mutex<Catalog>,
    /// Chunks currently pinned by running queries, with use counts
    chunk_uses: Mutex<std::collections::HashMap<(String, u32), usize>>,
}

fn sql_err(message: impl Into<String>) -> ReplicaError {
    ReplicaError::worker(message.into())
}

fn ok_response() -> SqlResponseBody {
    SqlResponseBody::default()
}

fn result_set(fields: Vec<String>, rows: Vec<Vec<String>>) -> SqlResponseBody {
    SqlResponseBody {
        has_result: true,
        fields,
        rows: rows
            .into_iter()
            .map(|cells| {
                let nulls = vec![false; cells.len()];
                ProtoSqlRow { cells, nulls }
            })
            .collect(),
        error: String::new(),
    }
}

impl SqlBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Catalog> {
        self.catalog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Execute one schema-maintenance operation
    pub fn execute(&self, body: &SqlRequestBody) -> ReplicaResult<SqlResponseBody> {
        let operation = replicore_shared::protocol::ProtoSqlOperation::try_from(body.operation)
            .map_err(|_| {
                ReplicaError::protocol(format!("unknown SQL operation {}", body.operation))
            })?;
        let operation = SqlOperation::from(operation);
        match operation {
            SqlOperation::Query => self.query(&body.query),
            SqlOperation::CreateDatabase => self.create_database(&body.database),
            SqlOperation::DropDatabase => self.drop_database(&body.database),
            SqlOperation::EnableDatabase => self.set_database_enabled(&body.database, true),
            SqlOperation::DisableDatabase => self.set_database_enabled(&body.database, false),
            SqlOperation::GrantAccess => self.grant_access(&body.database, &body.user),
            SqlOperation::CreateTable => {
                self.create_table(&body.database, &body.table, &body.schema_columns)
            }
            SqlOperation::DropTable => self.drop_table(&body.database, &body.table),
            SqlOperation::RemoveTablePartitioning => {
                self.remove_table_partitioning(&body.database, &body.table)
            }
            SqlOperation::DropTablePartition => {
                self.drop_table_partition(&body.database, &body.table, body.transaction_id)
            }
            SqlOperation::GetTableIndex => self.get_table_index(&body.database, &body.table),
            SqlOperation::CreateTableIndex => self.create_table_index(body),
            SqlOperation::DropTableIndex => {
                self.drop_table_index(&body.database, &body.table, &body.index)
            }
            SqlOperation::AlterTable => self.alter_table(&body.database, &body.table, &body.query),
            SqlOperation::TableRowStats => self.table_row_stats(&body.database, &body.table),
        }
    }

    fn with_database<T>(
        &self,
        database: &str,
        f: impl FnOnce(&mut DatabaseState) -> ReplicaResult<T>,
    ) -> ReplicaResult<T> {
        let mut catalog = self.lock();
        let state = catalog
            .databases
            .get_mut(database)
            .ok_or_else(|| sql_err(format!("no such database '{database}'")))?;
        f(state)
    }

    fn with_table<T>(
        &self,
        database: &str,
        table: &str,
        f: impl FnOnce(&mut TableState) -> ReplicaResult<T>,
    ) -> ReplicaResult<T> {
        self.with_database(database, |db| {
            let state = db
                .tables
                .get_mut(table)
                .ok_or_else(|| sql_err(format!("no such table '{database}.{table}'")))?;
            f(state)
        })
    }

    fn query(&self, text: &str) -> ReplicaResult<SqlResponseBody> {
        // The transient backend answers only trivial probes; anything else
        // is the production engine's business.
        if text.trim().eq_ignore_ascii_case("SELECT 1") {
            return Ok(result_set(vec!["1".into()], vec![vec!["1".into()]]));
        }
        Err(sql_err(format!("unsupported query '{text}'")))
    }

    fn create_database(&self, database: &str) -> ReplicaResult<SqlResponseBody> {
        let mut catalog = self.lock();
        if catalog.databases.contains_key(database) {
            return Err(sql_err(format!("database '{database}' already exists")));
        }
        catalog.databases.insert(
            database.to_string(),
            DatabaseState {
                enabled: false,
                ..DatabaseState::default()
            },
        );
        Ok(ok_response())
    }

    fn drop_database(&self, database: &str) -> ReplicaResult<SqlResponseBody> {
        let mut catalog = self.lock();
        catalog
            .databases
            .remove(database)
            .ok_or_else(|| sql_err(format!("no such database '{database}'")))?;
        Ok(ok_response())
    }

    fn set_database_enabled(&self, database: &str, enabled: bool) -> ReplicaResult<SqlResponseBody> {
        self.with_database(database, |db| {
            db.enabled = enabled;
            Ok(ok_response())
        })
    }

    fn grant_access(&self, database: &str, user: &str) -> ReplicaResult<SqlResponseBody> {
        if user.is_empty() {
            return Err(sql_err("empty user name"));
        }
        self.with_database(database, |db| {
            db.grants.insert(user.to_string());
            Ok(ok_response())
        })
    }

    fn create_table(
        &self,
        database: &str,
        table: &str,
        schema_columns: &[String],
    ) -> ReplicaResult<SqlResponseBody> {
        let columns = schema_columns
            .iter()
            .map(|entry| {
                entry
                    .split_once(' ')
                    .map(|(name, type_)| (name.to_string(), type_.to_string()))
                    .ok_or_else(|| sql_err(format!("malformed schema column '{entry}'")))
            })
            .collect::<ReplicaResult<Vec<_>>>()?;
        self.with_database(database, |db| {
            if db.tables.contains_key(table) {
                return Err(sql_err(format!("table '{database}.{table}' already exists")));
            }
            db.tables.insert(
                table.to_string(),
                TableState {
                    columns,
                    is_partitioned: true,
                    ..TableState::default()
                },
            );
            Ok(ok_response())
        })
    }

    fn drop_table(&self, database: &str, table: &str) -> ReplicaResult<SqlResponseBody> {
        self.with_database(database, |db| {
            db.tables
                .remove(table)
                .ok_or_else(|| sql_err(format!("no such table '{database}.{table}'")))?;
            Ok(ok_response())
        })
    }

    fn remove_table_partitioning(
        &self,
        database: &str,
        table: &str,
    ) -> ReplicaResult<SqlResponseBody> {
        self.with_table(database, table, |t| {
            t.is_partitioned = false;
            t.partitions.clear();
            Ok(ok_response())
        })
    }

    fn drop_table_partition(
        &self,
        database: &str,
        table: &str,
        transaction_id: u32,
    ) -> ReplicaResult<SqlResponseBody> {
        self.with_table(database, table, |t| {
            if !t.is_partitioned {
                return Err(sql_err(format!(
                    "table '{database}.{table}' is not partitioned"
                )));
            }
            t.partitions.remove(&transaction_id);
            t.index_data
                .retain(|(_, partition), _| *partition != transaction_id);
            Ok(ok_response())
        })
    }

    fn get_table_index(&self, database: &str, table: &str) -> ReplicaResult<SqlResponseBody> {
        self.with_table(database, table, |t| {
            let rows = t
                .indexes
                .iter()
                .map(|(name, (spec, columns))| {
                    vec![
                        name.clone(),
                        spec.to_string(),
                        columns
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(","),
                    ]
                })
                .collect();
            Ok(result_set(
                vec!["name".into(), "spec".into(), "columns".into()],
                rows,
            ))
        })
    }

    fn create_table_index(&self, body: &SqlRequestBody) -> ReplicaResult<SqlResponseBody> {
        let spec = IndexSpec::from_str(&body.index_spec)?;
        let columns = body
            .columns
            .iter()
            .map(|c| IndexColumn::parse(c))
            .collect::<Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            return Err(sql_err("an index needs at least one column"));
        }
        self.with_table(&body.database, &body.table, |t| {
            if t.indexes.contains_key(&body.index) {
                return Err(sql_err(format!("index '{}' already exists", body.index)));
            }
            t.indexes.insert(body.index.clone(), (spec, columns));
            Ok(ok_response())
        })
    }

    fn drop_table_index(
        &self,
        database: &str,
        table: &str,
        index: &str,
    ) -> ReplicaResult<SqlResponseBody> {
        self.with_table(database, table, |t| {
            t.indexes
                .remove(index)
                .ok_or_else(|| sql_err(format!("no such index '{index}'")))?;
            Ok(ok_response())
        })
    }

    fn alter_table(
        &self,
        database: &str,
        table: &str,
        specification: &str,
    ) -> ReplicaResult<SqlResponseBody> {
        if specification.trim().is_empty() {
            return Err(sql_err("empty ALTER TABLE specification"));
        }
        // The transient backend only validates the target's existence
        self.with_table(database, table, |_| Ok(ok_response()))
    }

    fn table_row_stats(&self, database: &str, table: &str) -> ReplicaResult<SqlResponseBody> {
        self.with_table(database, table, |t| {
            let rows = t
                .rows_per_chunk
                .iter()
                .map(|(chunk, rows)| vec![chunk.to_string(), rows.to_string()])
                .collect();
            Ok(result_set(vec!["chunk".into(), "rows".into()], rows))
        })
    }

    // -- Query-service chunk usage -----------------------------------------

    fn lock_uses(
        &self,
    ) -> std::sync::MutexGuard<'_, std::collections::HashMap<(String, u32), usize>> {
        self.chunk_uses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pin a chunk on behalf of a running query
    pub fn acquire_chunk(&self, database: &str, chunk: u32) {
        *self
            .lock_uses()
            .entry((database.to_string(), chunk))
            .or_insert(0) += 1;
    }

    /// Release a pinned chunk
    pub fn release_chunk(&self, database: &str, chunk: u32) {
        let mut uses = self.lock_uses();
        if let Some(count) = uses.get_mut(&(database.to_string(), chunk)) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                uses.remove(&(database.to_string(), chunk));
            }
        }
    }

    /// Number of running queries pinning a chunk
    pub fn chunk_use_count(&self, database: &str, chunk: u32) -> usize {
        *self
            .lock_uses()
            .get(&(database.to_string(), chunk))
            .unwrap_or(&0)
    }

    // -- Loader and extractor entry points ---------------------------------

    /// Account rows loaded into a chunk of a table (the ingest load stage)
    pub fn load_table_data(
        &self,
        database: &str,
        table: &str,
        chunk: u32,
        transaction_id: u32,
        num_rows: u64,
    ) -> ReplicaResult<()> {
        self.with_table(database, table, |t| {
            *t.rows_per_chunk.entry(chunk).or_insert(0) += num_rows;
            if t.is_partitioned {
                t.partitions.insert(transaction_id);
            }
            Ok(())
        })
    }

    /// Seed director-index payload of one chunk (tests, ingest pipeline)
    pub fn put_director_index(
        &self,
        database: &str,
        table: &str,
        chunk: u32,
        transaction_id: u32,
        data: Vec<u8>,
    ) -> ReplicaResult<()> {
        self.with_table(database, table, |t| {
            t.index_data.insert((chunk, transaction_id), data);
            Ok(())
        })
    }

    /// The full director-index payload of one chunk
    pub fn director_index(
        &self,
        database: &str,
        table: &str,
        chunk: u32,
        transaction_id: Option<u32>,
    ) -> ReplicaResult<Vec<u8>> {
        self.with_table(database, table, |t| {
            Ok(match transaction_id {
                Some(id) => t.index_data.get(&(chunk, id)).cloned().unwrap_or_default(),
                None => {
                    let mut data = Vec::new();
                    for ((c, _), payload) in t.index_data.iter() {
                        if *c == chunk {
                            data.extend_from_slice(payload);
                        }
                    }
                    data
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicore_shared::protocol::ProtoSqlOperation;

    fn body(operation: ProtoSqlOperation) -> SqlRequestBody {
        SqlRequestBody {
            operation: operation as i32,
            database: "D".into(),
            table: "Obj".into(),
            ..SqlRequestBody::default()
        }
    }

    fn backend_with_table() -> SqlBackend {
        let backend = SqlBackend::new();
        backend.execute(&body(ProtoSqlOperation::CreateDatabase)).unwrap();
        let mut create = body(ProtoSqlOperation::CreateTable);
        create.schema_columns = vec!["objectId BIGINT".into(), "ra DOUBLE".into()];
        backend.execute(&create).unwrap();
        backend
    }

    #[test]
    fn test_database_lifecycle() {
        let backend = SqlBackend::new();
        backend.execute(&body(ProtoSqlOperation::CreateDatabase)).unwrap();
        assert!(backend
            .execute(&body(ProtoSqlOperation::CreateDatabase))
            .is_err());
        backend.execute(&body(ProtoSqlOperation::EnableDatabase)).unwrap();
        backend.execute(&body(ProtoSqlOperation::DropDatabase)).unwrap();
        assert!(backend
            .execute(&body(ProtoSqlOperation::EnableDatabase))
            .is_err());
    }

    #[test]
    fn test_index_operations() {
        let backend = backend_with_table();
        let mut create = body(ProtoSqlOperation::CreateTableIndex);
        create.index = "idx_obj".into();
        create.index_spec = "UNIQUE".into();
        create.columns = vec!["objectId".into()];
        backend.execute(&create).unwrap();
        // Duplicate index rejected
        assert!(backend.execute(&create).is_err());

        let listing = backend
            .execute(&body(ProtoSqlOperation::GetTableIndex))
            .unwrap();
        assert!(listing.has_result);
        assert_eq!(listing.rows.len(), 1);
        assert_eq!(listing.rows[0].cells[1], "UNIQUE");

        let mut drop = body(ProtoSqlOperation::DropTableIndex);
        drop.index = "idx_obj".into();
        backend.execute(&drop).unwrap();
        assert!(backend.execute(&drop).is_err());
    }

    #[test]
    fn test_bad_index_spec_rejected() {
        let backend = backend_with_table();
        let mut create = body(ProtoSqlOperation::CreateTableIndex);
        create.index = "idx".into();
        create.index_spec = "HASH".into();
        create.columns = vec!["objectId".into()];
        assert!(backend.execute(&create).is_err());
    }

    #[test]
    fn test_partition_drop_removes_index_data() {
        let backend = backend_with_table();
        backend.load_table_data("D", "Obj", 42, 7, 100).unwrap();
        backend
            .put_director_index("D", "Obj", 42, 7, b"rows".to_vec())
            .unwrap();
        let mut drop = body(ProtoSqlOperation::DropTablePartition);
        drop.transaction_id = 7;
        backend.execute(&drop).unwrap();
        assert!(backend
            .director_index("D", "Obj", 42, Some(7))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_row_stats() {
        let backend = backend_with_table();
        backend.load_table_data("D", "Obj", 1, 5, 10).unwrap();
        backend.load_table_data("D", "Obj", 1, 6, 15).unwrap();
        let stats = backend
            .execute(&body(ProtoSqlOperation::TableRowStats))
            .unwrap();
        assert_eq!(stats.rows.len(), 1);
        assert_eq!(stats.rows[0].cells, vec!["1", "25"]);
    }
}
