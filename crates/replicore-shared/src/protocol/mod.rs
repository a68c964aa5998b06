//! # Wire Protocol Types
//!
//! Status enumerations, the performance record and the typed message set of
//! the replication wire protocol. Every message is a hand-written `prost`
//! struct; framing (a 4-byte big-endian length prefix per record) lives in
//! [`codec`].
//!
//! A logical exchange is two frames in each direction: a request header
//! identifying the request id, its category and priority, followed by a typed
//! body; then a response header with the worker-reported status, followed by
//! a typed body.

pub mod codec;
pub mod messages;

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub use messages::*;

/// The reserved overflow chunk number. Chunks of a director table with this
/// id are never admitted into the replica system.
pub const OVERFLOW_CHUNK_ID: u32 = 1234567890;

/// Milliseconds since the UNIX epoch
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Worker-reported completion status of a request
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum ProtoStatus {
    Success = 0,
    Created = 1,
    Queued = 2,
    InProgress = 3,
    IsCancelling = 4,
    Bad = 5,
    Failed = 6,
    Cancelled = 7,
}

impl ProtoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtoStatus::Success => "SUCCESS",
            ProtoStatus::Created => "CREATED",
            ProtoStatus::Queued => "QUEUED",
            ProtoStatus::InProgress => "IN_PROGRESS",
            ProtoStatus::IsCancelling => "IS_CANCELLING",
            ProtoStatus::Bad => "BAD",
            ProtoStatus::Failed => "FAILED",
            ProtoStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ProtoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extended (error) code accompanying a worker-reported status
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum ProtoStatusExt {
    None = 0,
    InvalidParam = 1,
    InvalidId = 2,
    Duplicate = 3,
    FolderStat = 4,
    FolderCreate = 5,
    FileStat = 6,
    FileSize = 7,
    FileRead = 8,
    FileCopy = 9,
    FileDelete = 10,
    FileMtime = 11,
    NoFolder = 12,
    NoFile = 13,
    NoAccess = 14,
    NoSpace = 15,
    SqlError = 16,
    InvalidDatabase = 17,
    Expired = 18,
}

impl ProtoStatusExt {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtoStatusExt::None => "NONE",
            ProtoStatusExt::InvalidParam => "INVALID_PARAM",
            ProtoStatusExt::InvalidId => "INVALID_ID",
            ProtoStatusExt::Duplicate => "DUPLICATE",
            ProtoStatusExt::FolderStat => "FOLDER_STAT",
            ProtoStatusExt::FolderCreate => "FOLDER_CREATE",
            ProtoStatusExt::FileStat => "FILE_STAT",
            ProtoStatusExt::FileSize => "FILE_SIZE",
            ProtoStatusExt::FileRead => "FILE_READ",
            ProtoStatusExt::FileCopy => "FILE_COPY",
            ProtoStatusExt::FileDelete => "FILE_DELETE",
            ProtoStatusExt::FileMtime => "FILE_MTIME",
            ProtoStatusExt::NoFolder => "NO_FOLDER",
            ProtoStatusExt::NoFile => "NO_FILE",
            ProtoStatusExt::NoAccess => "NO_ACCESS",
            ProtoStatusExt::NoSpace => "NO_SPACE",
            ProtoStatusExt::SqlError => "SQL_ERROR",
            ProtoStatusExt::InvalidDatabase => "INVALID_DATABASE",
            ProtoStatusExt::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for ProtoStatusExt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request priority; five levels, `Normal` by default
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[repr(i32)]
pub enum Priority {
    VeryLow = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    VeryHigh = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl ::core::convert::From<Priority> for i32 {
    fn from(value: Priority) -> i32 {
        value as i32
    }
}

impl ::core::convert::TryFrom<i32> for Priority {
    type Error = ::prost::UnknownEnumValue;

    fn try_from(value: i32) -> ::core::result::Result<Priority, ::prost::UnknownEnumValue> {
        match value {
            0 => ::core::result::Result::Ok(Priority::VeryLow),
            1 => ::core::result::Result::Ok(Priority::Low),
            2 => ::core::result::Result::Ok(Priority::Normal),
            3 => ::core::result::Result::Ok(Priority::High),
            4 => ::core::result::Result::Ok(Priority::VeryHigh),
            _ => ::core::result::Result::Err(::prost::UnknownEnumValue(value)),
        }
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::VeryLow => "VERY_LOW",
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::VeryHigh => "VERY_HIGH",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level category of a request frame
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum RequestCategory {
    /// Long-running operations placed into the worker's priority queue
    Queued = 0,
    /// Management operations against a previously submitted request
    Request = 1,
    /// Operations against the worker service itself
    Service = 2,
}

/// Type tag of a queued operation
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum QueuedRequestKind {
    ReplicaCreate = 0,
    ReplicaDelete = 1,
    ReplicaFind = 2,
    ReplicaFindAll = 3,
    TestEcho = 4,
    Sql = 5,
    Index = 6,
}

impl QueuedRequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueuedRequestKind::ReplicaCreate => "REPLICA_CREATE",
            QueuedRequestKind::ReplicaDelete => "REPLICA_DELETE",
            QueuedRequestKind::ReplicaFind => "REPLICA_FIND",
            QueuedRequestKind::ReplicaFindAll => "REPLICA_FIND_ALL",
            QueuedRequestKind::TestEcho => "TEST_ECHO",
            QueuedRequestKind::Sql => "SQL",
            QueuedRequestKind::Index => "INDEX",
        }
    }
}

impl std::fmt::Display for QueuedRequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type tag of a management operation
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum ManagementRequestKind {
    /// Probe the current status of a queued request
    Status = 0,
    /// Best-effort cancellation of a queued request
    Stop = 1,
    /// Tracking probe issued by the retry timer
    Track = 2,
    /// Garbage-collect finished requests at the worker
    Dispose = 3,
}

/// Type tag of a service operation
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum ServiceRequestKind {
    Status = 0,
    Requests = 1,
    Suspend = 2,
    Resume = 3,
    Drain = 4,
}

/// Timestamps of one request's life cycle, milliseconds since the epoch.
/// A zero value means the stage has not been reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Performance {
    pub create_time: u64,
    pub start_time: u64,
    pub finish_time: u64,
}

impl Performance {
    /// A fresh record stamped with the current time
    pub fn new() -> Self {
        Self {
            create_time: now_ms(),
            ..Self::default()
        }
    }

    pub fn set_update_start(&mut self) {
        self.start_time = now_ms();
    }

    pub fn set_update_finish(&mut self) {
        self.finish_time = now_ms();
    }

    /// Total latency in milliseconds, when both endpoints are known
    pub fn elapsed_ms(&self) -> Option<u64> {
        (self.finish_time > 0 && self.create_time > 0)
            .then(|| self.finish_time.saturating_sub(self.create_time))
    }
}

impl From<ProtoPerformance> for Performance {
    fn from(p: ProtoPerformance) -> Self {
        Self {
            create_time: p.create_time,
            start_time: p.start_time,
            finish_time: p.finish_time,
        }
    }
}

impl From<Performance> for ProtoPerformance {
    fn from(p: Performance) -> Self {
        Self {
            create_time: p.create_time,
            start_time: p.start_time,
            finish_time: p.finish_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_i32() {
        for status in [
            ProtoStatus::Success,
            ProtoStatus::Queued,
            ProtoStatus::IsCancelling,
            ProtoStatus::Cancelled,
        ] {
            assert_eq!(ProtoStatus::try_from(status as i32).unwrap(), status);
        }
        assert!(ProtoStatus::try_from(99).is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::VeryHigh > Priority::Normal);
        assert!(Priority::Normal > Priority::VeryLow);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_performance_elapsed() {
        let mut perf = Performance::new();
        assert_eq!(perf.elapsed_ms(), None);
        perf.set_update_start();
        perf.set_update_finish();
        assert!(perf.elapsed_ms().is_some());
    }
}
