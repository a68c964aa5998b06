//! SQL schema-maintenance operation types shared by the controller request
//! family and the worker-side executor.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ReplicaError;
use crate::protocol::ProtoSqlOperation;

/// The discriminated operation union of a SQL request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SqlOperation {
    Query,
    CreateDatabase,
    DropDatabase,
    EnableDatabase,
    DisableDatabase,
    GrantAccess,
    CreateTable,
    DropTable,
    RemoveTablePartitioning,
    DropTablePartition,
    GetTableIndex,
    CreateTableIndex,
    DropTableIndex,
    AlterTable,
    TableRowStats,
}

impl SqlOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlOperation::Query => "QUERY",
            SqlOperation::CreateDatabase => "CREATE_DATABASE",
            SqlOperation::DropDatabase => "DROP_DATABASE",
            SqlOperation::EnableDatabase => "ENABLE_DATABASE",
            SqlOperation::DisableDatabase => "DISABLE_DATABASE",
            SqlOperation::GrantAccess => "GRANT_ACCESS",
            SqlOperation::CreateTable => "CREATE_TABLE",
            SqlOperation::DropTable => "DROP_TABLE",
            SqlOperation::RemoveTablePartitioning => "REMOVE_TABLE_PARTITIONING",
            SqlOperation::DropTablePartition => "DROP_TABLE_PARTITION",
            SqlOperation::GetTableIndex => "GET_TABLE_INDEX",
            SqlOperation::CreateTableIndex => "CREATE_TABLE_INDEX",
            SqlOperation::DropTableIndex => "DROP_TABLE_INDEX",
            SqlOperation::AlterTable => "ALTER_TABLE",
            SqlOperation::TableRowStats => "TABLE_ROW_STATS",
        }
    }
}

impl std::fmt::Display for SqlOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SqlOperation> for ProtoSqlOperation {
    fn from(op: SqlOperation) -> Self {
        match op {
            SqlOperation::Query => ProtoSqlOperation::Query,
            SqlOperation::CreateDatabase => ProtoSqlOperation::CreateDatabase,
            SqlOperation::DropDatabase => ProtoSqlOperation::DropDatabase,
            SqlOperation::EnableDatabase => ProtoSqlOperation::EnableDatabase,
            SqlOperation::DisableDatabase => ProtoSqlOperation::DisableDatabase,
            SqlOperation::GrantAccess => ProtoSqlOperation::GrantAccess,
            SqlOperation::CreateTable => ProtoSqlOperation::CreateTable,
            SqlOperation::DropTable => ProtoSqlOperation::DropTable,
            SqlOperation::RemoveTablePartitioning => ProtoSqlOperation::RemoveTablePartitioning,
            SqlOperation::DropTablePartition => ProtoSqlOperation::DropTablePartition,
            SqlOperation::GetTableIndex => ProtoSqlOperation::GetTableIndex,
            SqlOperation::CreateTableIndex => ProtoSqlOperation::CreateTableIndex,
            SqlOperation::DropTableIndex => ProtoSqlOperation::DropTableIndex,
            SqlOperation::AlterTable => ProtoSqlOperation::AlterTable,
            SqlOperation::TableRowStats => ProtoSqlOperation::TableRowStats,
        }
    }
}

impl From<ProtoSqlOperation> for SqlOperation {
    fn from(op: ProtoSqlOperation) -> Self {
        match op {
            ProtoSqlOperation::Query => SqlOperation::Query,
            ProtoSqlOperation::CreateDatabase => SqlOperation::CreateDatabase,
            ProtoSqlOperation::DropDatabase => SqlOperation::DropDatabase,
            ProtoSqlOperation::EnableDatabase => SqlOperation::EnableDatabase,
            ProtoSqlOperation::DisableDatabase => SqlOperation::DisableDatabase,
            ProtoSqlOperation::GrantAccess => SqlOperation::GrantAccess,
            ProtoSqlOperation::CreateTable => SqlOperation::CreateTable,
            ProtoSqlOperation::DropTable => SqlOperation::DropTable,
            ProtoSqlOperation::RemoveTablePartitioning => SqlOperation::RemoveTablePartitioning,
            ProtoSqlOperation::DropTablePartition => SqlOperation::DropTablePartition,
            ProtoSqlOperation::GetTableIndex => SqlOperation::GetTableIndex,
            ProtoSqlOperation::CreateTableIndex => SqlOperation::CreateTableIndex,
            ProtoSqlOperation::DropTableIndex => SqlOperation::DropTableIndex,
            ProtoSqlOperation::AlterTable => SqlOperation::AlterTable,
            ProtoSqlOperation::TableRowStats => SqlOperation::TableRowStats,
        }
    }
}

/// Index specification tag of the index maintenance operations.
///
/// Parseable from and emittable to its string form; the round trip
/// `IndexSpec::from_str(spec.to_string())` recovers the original value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexSpec {
    #[default]
    Default,
    Unique,
    Fulltext,
    Spatial,
}

impl IndexSpec {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexSpec::Default => "DEFAULT",
            IndexSpec::Unique => "UNIQUE",
            IndexSpec::Fulltext => "FULLTEXT",
            IndexSpec::Spatial => "SPATIAL",
        }
    }
}

impl std::fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexSpec {
    type Err = ReplicaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEFAULT" => Ok(IndexSpec::Default),
            "UNIQUE" => Ok(IndexSpec::Unique),
            "FULLTEXT" => Ok(IndexSpec::Fulltext),
            "SPATIAL" => Ok(IndexSpec::Spatial),
            other => Err(ReplicaError::invalid_argument(format!(
                "unknown index specification '{other}'"
            ))),
        }
    }
}

/// One column of an index definition, `<column>[:<length>]`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub name: String,
    /// Prefix length for string columns; 0 means the full column
    pub length: u32,
}

impl IndexColumn {
    pub fn parse(text: &str) -> Result<Self, ReplicaError> {
        match text.split_once(':') {
            None => Ok(Self {
                name: text.to_string(),
                length: 0,
            }),
            Some((name, length)) => {
                let length = length.parse::<u32>().map_err(|_| {
                    ReplicaError::invalid_argument(format!(
                        "bad index column length in '{text}'"
                    ))
                })?;
                Ok(Self {
                    name: name.to_string(),
                    length,
                })
            }
        }
    }
}

impl std::fmt::Display for IndexColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.length == 0 {
            f.write_str(&self.name)
        } else {
            write!(f, "{}:{}", self.name, self.length)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_spec_round_trip() {
        for spec in [
            IndexSpec::Default,
            IndexSpec::Unique,
            IndexSpec::Fulltext,
            IndexSpec::Spatial,
        ] {
            assert_eq!(IndexSpec::from_str(spec.as_str()).unwrap(), spec);
        }
    }

    #[test]
    fn test_index_spec_rejects_unknown() {
        assert!(IndexSpec::from_str("BTREE").is_err());
        assert!(IndexSpec::from_str("unique").is_err());
    }

    #[test]
    fn test_sql_operation_proto_round_trip() {
        for op in [
            SqlOperation::Query,
            SqlOperation::GrantAccess,
            SqlOperation::DropTablePartition,
            SqlOperation::TableRowStats,
        ] {
            assert_eq!(SqlOperation::from(ProtoSqlOperation::from(op)), op);
        }
    }

    #[test]
    fn test_index_column_parse() {
        assert_eq!(
            IndexColumn::parse("objectId").unwrap(),
            IndexColumn {
                name: "objectId".into(),
                length: 0
            }
        );
        let with_len = IndexColumn::parse("name:16").unwrap();
        assert_eq!(with_len.length, 16);
        assert_eq!(with_len.to_string(), "name:16");
        assert!(IndexColumn::parse("name:abc").is_err());
    }
}
