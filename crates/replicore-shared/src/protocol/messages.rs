//! Hand-written `prost` messages of the replication wire protocol.
//!
//! The schema is stable and closed, so the messages are maintained directly
//! in Rust rather than generated from `.proto` sources at build time. Field
//! tags are part of the wire contract and must never be reused.

use prost::Message;

use crate::errors::{ReplicaError, ReplicaResult};
use crate::replica::{FileInfo, ReplicaInfo, ReplicaStatus};

/// Performance counters carried inside response headers
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct ProtoPerformance {
    #[prost(uint64, tag = "1")]
    pub create_time: u64,
    #[prost(uint64, tag = "2")]
    pub start_time: u64,
    #[prost(uint64, tag = "3")]
    pub finish_time: u64,
}

/// The first frame of every exchange sent by the controller
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestHeader {
    /// Unique id of the request the frame belongs to
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(enumeration = "super::RequestCategory", tag = "2")]
    pub category: i32,
    /// Valid when `category == Queued`
    #[prost(enumeration = "super::QueuedRequestKind", tag = "3")]
    pub queued_type: i32,
    /// Valid when `category == Request`
    #[prost(enumeration = "super::ManagementRequestKind", tag = "4")]
    pub management_type: i32,
    /// Valid when `category == Service`
    #[prost(enumeration = "super::ServiceRequestKind", tag = "5")]
    pub service_type: i32,
    /// Remaining lifetime of the request in seconds; 0 disables expiration
    #[prost(uint32, tag = "6")]
    pub timeout_sec: u32,
    #[prost(enumeration = "super::Priority", tag = "7")]
    pub priority: i32,
    /// Identity of the deployment; a mismatch is reported as `BAD`
    #[prost(string, tag = "8")]
    pub instance_id: ::prost::alloc::string::String,
}

/// The first frame of every exchange sent back by a worker
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseHeader {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(int32, tag = "2")]
    pub status: i32,
    #[prost(int32, tag = "3")]
    pub status_ext: i32,
    /// Single human-readable message on failure
    #[prost(string, tag = "4")]
    pub error: ::prost::alloc::string::String,
    /// Performance of the operation this reply reports on
    #[prost(message, optional, tag = "5")]
    pub performance: ::core::option::Option<ProtoPerformance>,
    /// For status probes: the original operation's performance record
    #[prost(message, optional, tag = "6")]
    pub target_performance: ::core::option::Option<ProtoPerformance>,
    /// Id of a matching prior request detected by the worker, if any
    #[prost(string, tag = "7")]
    pub duplicate_request_id: ::prost::alloc::string::String,
}

impl ResponseHeader {
    pub fn status(&self) -> ReplicaResult<super::ProtoStatus> {
        super::ProtoStatus::try_from(self.status)
            .map_err(|_| ReplicaError::protocol(format!("unknown response status {}", self.status)))
    }

    pub fn status_ext(&self) -> super::ProtoStatusExt {
        super::ProtoStatusExt::try_from(self.status_ext).unwrap_or(super::ProtoStatusExt::None)
    }
}

// ---------------------------------------------------------------------------
// Queued request bodies
// ---------------------------------------------------------------------------

/// Body of `REPLICA_CREATE`: pull chunk files from `worker_from`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicationRequestBody {
    #[prost(string, tag = "1")]
    pub database: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub chunk: u32,
    #[prost(string, tag = "3")]
    pub worker_from: ::prost::alloc::string::String,
}

/// Body of `REPLICA_DELETE`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteRequestBody {
    #[prost(string, tag = "1")]
    pub database: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub chunk: u32,
}

/// Body of `REPLICA_FIND`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindRequestBody {
    #[prost(string, tag = "1")]
    pub database: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub chunk: u32,
    #[prost(bool, tag = "3")]
    pub compute_check_sum: bool,
}

/// Body of `REPLICA_FIND_ALL`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindAllRequestBody {
    #[prost(string, tag = "1")]
    pub database: ::prost::alloc::string::String,
}

/// Body of `TEST_ECHO`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoRequestBody {
    #[prost(string, tag = "1")]
    pub data: ::prost::alloc::string::String,
    /// Artificial processing delay, milliseconds
    #[prost(uint64, tag = "2")]
    pub delay_ms: u64,
}

/// Body of `SQL`
#[derive(Clone, PartialEq, ::prost::Message, serde::Deserialize)]
pub struct SqlRequestBody {
    #[prost(enumeration = "ProtoSqlOperation", tag = "1")]
    pub operation: i32,
    #[prost(string, tag = "2")]
    pub database: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub table: ::prost::alloc::string::String,
    /// Free-form query text for the `QUERY` operation
    #[prost(string, tag = "4")]
    pub query: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub user: ::prost::alloc::string::String,
    /// Index name for the index operations
    #[prost(string, tag = "6")]
    pub index: ::prost::alloc::string::String,
    /// Index specification tag in its string form
    #[prost(string, tag = "7")]
    pub index_spec: ::prost::alloc::string::String,
    /// Indexed columns, `<column>[:<length>]`
    #[prost(string, repeated, tag = "8")]
    pub columns: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Partition (transaction) id for `DROP_TABLE_PARTITION`
    #[prost(uint32, tag = "9")]
    pub transaction_id: u32,
    /// Table schema as `<column> <type>` pairs for `CREATE_TABLE`
    #[prost(string, repeated, tag = "10")]
    pub schema_columns: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

/// Wire form of the SQL operation union
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProtoSqlOperation {
    Query = 0,
    CreateDatabase = 1,
    DropDatabase = 2,
    EnableDatabase = 3,
    DisableDatabase = 4,
    GrantAccess = 5,
    CreateTable = 6,
    DropTable = 7,
    RemoveTablePartitioning = 8,
    DropTablePartition = 9,
    GetTableIndex = 10,
    CreateTableIndex = 11,
    DropTableIndex = 12,
    AlterTable = 13,
    TableRowStats = 14,
}

/// Body of `INDEX`: extract one chunk's director-index data
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DirectorIndexRequestBody {
    #[prost(string, tag = "1")]
    pub database: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub director_table: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub chunk: u32,
    #[prost(bool, tag = "4")]
    pub has_transactions: bool,
    #[prost(uint32, tag = "5")]
    pub transaction_id: u32,
    /// Byte offset into the worker-side table scan
    #[prost(uint64, tag = "6")]
    pub offset: u64,
}

// ---------------------------------------------------------------------------
// Management request bodies
// ---------------------------------------------------------------------------

/// Body of `STATUS`, `TRACK` and `STOP`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ManagementRequestBody {
    /// Id of the queued request the operation targets
    #[prost(string, tag = "1")]
    pub target_id: ::prost::alloc::string::String,
}

/// Body of `DISPOSE`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisposeRequestBody {
    #[prost(string, repeated, tag = "1")]
    pub ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

/// Wire form of one file of a replica
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoFileInfo {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub size: u64,
    /// Modification time, seconds since the epoch
    #[prost(uint64, tag = "3")]
    pub mtime: u64,
    /// Decimal string form of the control sum; empty when not computed
    #[prost(string, tag = "4")]
    pub cs: ::prost::alloc::string::String,
    #[prost(uint64, tag = "5")]
    pub begin_transfer_time: u64,
    #[prost(uint64, tag = "6")]
    pub end_transfer_time: u64,
}

/// Wire form of one replica
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoReplicaInfo {
    #[prost(enumeration = "ProtoReplicaStatus", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub worker: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub database: ::prost::alloc::string::String,
    #[prost(uint32, tag = "4")]
    pub chunk: u32,
    #[prost(uint64, tag = "5")]
    pub verify_time: u64,
    #[prost(message, repeated, tag = "6")]
    pub files: ::prost::alloc::vec::Vec<ProtoFileInfo>,
}

/// Wire form of a replica's completeness status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProtoReplicaStatus {
    NotFound = 0,
    Incomplete = 1,
    Complete = 2,
}

/// Body of replies to replica operations
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicaInfoResponseBody {
    #[prost(message, optional, tag = "1")]
    pub replica: ::core::option::Option<ProtoReplicaInfo>,
}

/// Body of replies to `REPLICA_FIND_ALL`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicaInfoCollectionResponseBody {
    #[prost(message, repeated, tag = "1")]
    pub replicas: ::prost::alloc::vec::Vec<ProtoReplicaInfo>,
}

/// Body of replies to `TEST_ECHO`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EchoResponseBody {
    #[prost(string, tag = "1")]
    pub data: ::prost::alloc::string::String,
}

/// One row of a SQL result set; a NULL cell has its flag set and an empty
/// value
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoSqlRow {
    #[prost(string, repeated, tag = "1")]
    pub cells: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(bool, repeated, tag = "2")]
    pub nulls: ::prost::alloc::vec::Vec<bool>,
}

/// Body of replies to `SQL`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SqlResponseBody {
    #[prost(bool, tag = "1")]
    pub has_result: bool,
    #[prost(string, repeated, tag = "2")]
    pub fields: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, repeated, tag = "3")]
    pub rows: ::prost::alloc::vec::Vec<ProtoSqlRow>,
    #[prost(string, tag = "4")]
    pub error: ::prost::alloc::string::String,
}

/// Body of replies to `INDEX`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DirectorIndexResponseBody {
    /// The next slice of index data starting at the requested offset
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    /// Total size of the full extraction
    #[prost(uint64, tag = "2")]
    pub total_bytes: u64,
}

/// Per-id outcome of a `DISPOSE` operation
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisposeStatus {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub disposed: bool,
}

/// Body of replies to `DISPOSE`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisposeResponseBody {
    #[prost(message, repeated, tag = "1")]
    pub ids: ::prost::alloc::vec::Vec<DisposeStatus>,
}

/// Summary of one request in a service census reply
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestSummary {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(enumeration = "super::QueuedRequestKind", tag = "2")]
    pub queued_type: i32,
    #[prost(enumeration = "super::Priority", tag = "3")]
    pub priority: i32,
    #[prost(enumeration = "super::ProtoStatus", tag = "4")]
    pub status: i32,
}

/// Body of replies to the `SERVICE_*` operations
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceStateResponseBody {
    /// `RUNNING`, `SUSPENDED` or `DRAINING`
    #[prost(string, tag = "1")]
    pub state: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub num_new_requests: u64,
    #[prost(uint64, tag = "3")]
    pub num_in_progress_requests: u64,
    #[prost(uint64, tag = "4")]
    pub num_finished_requests: u64,
    #[prost(message, repeated, tag = "5")]
    pub new_requests: ::prost::alloc::vec::Vec<ProtoRequestSummary>,
    #[prost(message, repeated, tag = "6")]
    pub in_progress_requests: ::prost::alloc::vec::Vec<ProtoRequestSummary>,
    #[prost(message, repeated, tag = "7")]
    pub finished_requests: ::prost::alloc::vec::Vec<ProtoRequestSummary>,
}

// ---------------------------------------------------------------------------
// Domain conversions
// ---------------------------------------------------------------------------

impl From<&FileInfo> for ProtoFileInfo {
    fn from(f: &FileInfo) -> Self {
        Self {
            name: f.name.clone(),
            size: f.size,
            mtime: f.mtime,
            cs: f.cs.clone(),
            begin_transfer_time: f.begin_transfer_time,
            end_transfer_time: f.end_transfer_time,
        }
    }
}

impl From<ProtoFileInfo> for FileInfo {
    fn from(f: ProtoFileInfo) -> Self {
        Self {
            name: f.name,
            size: f.size,
            mtime: f.mtime,
            cs: f.cs,
            begin_transfer_time: f.begin_transfer_time,
            end_transfer_time: f.end_transfer_time,
        }
    }
}

impl From<&ReplicaInfo> for ProtoReplicaInfo {
    fn from(r: &ReplicaInfo) -> Self {
        Self {
            status: ProtoReplicaStatus::from(r.status) as i32,
            worker: r.worker.clone(),
            database: r.database.clone(),
            chunk: r.chunk,
            verify_time: r.verify_time,
            files: r.files.iter().map(ProtoFileInfo::from).collect(),
        }
    }
}

impl TryFrom<ProtoReplicaInfo> for ReplicaInfo {
    type Error = ReplicaError;

    fn try_from(r: ProtoReplicaInfo) -> ReplicaResult<Self> {
        let status = ProtoReplicaStatus::try_from(r.status)
            .map_err(|_| ReplicaError::protocol(format!("unknown replica status {}", r.status)))?;
        Ok(Self {
            status: status.into(),
            worker: r.worker,
            database: r.database,
            chunk: r.chunk,
            verify_time: r.verify_time,
            files: r.files.into_iter().map(FileInfo::from).collect(),
        })
    }
}

impl From<ReplicaStatus> for ProtoReplicaStatus {
    fn from(s: ReplicaStatus) -> Self {
        match s {
            ReplicaStatus::NotFound => ProtoReplicaStatus::NotFound,
            ReplicaStatus::Incomplete => ProtoReplicaStatus::Incomplete,
            ReplicaStatus::Complete => ProtoReplicaStatus::Complete,
        }
    }
}

impl From<ProtoReplicaStatus> for ReplicaStatus {
    fn from(s: ProtoReplicaStatus) -> Self {
        match s {
            ProtoReplicaStatus::NotFound => ReplicaStatus::NotFound,
            ProtoReplicaStatus::Incomplete => ReplicaStatus::Incomplete,
            ProtoReplicaStatus::Complete => ReplicaStatus::Complete,
        }
    }
}

/// Encode a message into a standalone buffer
pub fn encode_body<M: Message>(message: &M) -> bytes::Bytes {
    let mut buf = bytes::BytesMut::with_capacity(message.encoded_len());
    message
        .encode(&mut buf)
        .expect("BytesMut grows on demand, encoding cannot fail");
    buf.freeze()
}

/// Decode a message from a received frame
pub fn decode_body<M: Message + Default>(frame: &[u8]) -> ReplicaResult<M> {
    M::decode(frame).map_err(ReplicaError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_round_trip() {
        let header = RequestHeader {
            id: "abc-123".into(),
            category: super::super::RequestCategory::Queued as i32,
            queued_type: super::super::QueuedRequestKind::ReplicaCreate as i32,
            management_type: 0,
            service_type: 0,
            timeout_sec: 30,
            priority: super::super::Priority::High as i32,
            instance_id: "qdev".into(),
        };
        let bytes = encode_body(&header);
        let decoded: RequestHeader = decode_body(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_replica_info_conversion_round_trip() {
        let replica = ReplicaInfo {
            status: ReplicaStatus::Complete,
            worker: "W2".into(),
            database: "D".into(),
            chunk: 42,
            verify_time: 1234,
            files: vec![FileInfo {
                name: "Obj_42.MYD".into(),
                size: 1_000_000,
                mtime: 1700000000,
                cs: "123456".into(),
                begin_transfer_time: 0,
                end_transfer_time: 0,
            }],
        };
        let proto = ProtoReplicaInfo::from(&replica);
        let back = ReplicaInfo::try_from(proto).unwrap();
        assert_eq!(back, replica);
    }

    #[test]
    fn test_unknown_replica_status_rejected() {
        let proto = ProtoReplicaInfo {
            status: 17,
            ..Default::default()
        };
        assert!(ReplicaInfo::try_from(proto).is_err());
    }
}
