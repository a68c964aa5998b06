//! Ingest transaction and contribution data model.
//!
//! A *contribution* is one asynchronous ingest of a single chunk of a single
//! table under a single transaction. The persisted record survives worker
//! restarts; its quadruple of stage timestamps
//! `create_time → start_time → read_time → load_time` is the ground truth
//! for crash recovery, identifying the latest stage a contribution had
//! completed when the service went down.

use serde::{Deserialize, Serialize};

use crate::protocol::now_ms;

/// State of an ingest (super-)transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Started,
    Finished,
    Aborted,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Started => "STARTED",
            TransactionState::Finished => "FINISHED",
            TransactionState::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted ingest transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: u32,
    pub database: String,
    pub state: TransactionState,
    pub begin_time: u64,
    pub end_time: u64,
}

/// Persisted status of a contribution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContribStatus {
    /// Queued or actively being processed
    InProgress,
    /// Failed while being registered
    CreateFailed,
    /// Failed before the input source was opened
    StartFailed,
    /// Failed while reading the input source
    ReadFailed,
    /// Failed while loading into the database
    LoadFailed,
    Cancelled,
    Finished,
}

impl ContribStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContribStatus::InProgress => "IN_PROGRESS",
            ContribStatus::CreateFailed => "CREATE_FAILED",
            ContribStatus::StartFailed => "START_FAILED",
            ContribStatus::ReadFailed => "READ_FAILED",
            ContribStatus::LoadFailed => "LOAD_FAILED",
            ContribStatus::Cancelled => "CANCELLED",
            ContribStatus::Finished => "FINISHED",
        }
    }

    /// Whether the status is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ContribStatus::InProgress)
    }
}

impl std::fmt::Display for ContribStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CSV dialect of a contribution's payload.
///
/// Empty strings submitted by a client are substituted with the documented
/// defaults, which mirror the database loader's own defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvDialect {
    pub fields_terminated_by: String,
    pub fields_enclosed_by: String,
    pub fields_escaped_by: String,
    pub lines_terminated_by: String,
}

impl Default for CsvDialect {
    fn default() -> Self {
        Self {
            fields_terminated_by: "\t".to_string(),
            fields_enclosed_by: String::new(),
            fields_escaped_by: "\\".to_string(),
            lines_terminated_by: "\n".to_string(),
        }
    }
}

impl CsvDialect {
    /// Build a dialect from client-supplied values, substituting defaults
    /// for empty fields
    pub fn from_parts(
        fields_terminated_by: Option<String>,
        fields_enclosed_by: Option<String>,
        fields_escaped_by: Option<String>,
        lines_terminated_by: Option<String>,
    ) -> Self {
        let defaults = Self::default();
        let pick = |value: Option<String>, default: String| match value {
            Some(v) if !v.is_empty() => v,
            _ => default,
        };
        Self {
            fields_terminated_by: pick(fields_terminated_by, defaults.fields_terminated_by),
            fields_enclosed_by: fields_enclosed_by.unwrap_or(defaults.fields_enclosed_by),
            fields_escaped_by: pick(fields_escaped_by, defaults.fields_escaped_by),
            lines_terminated_by: pick(lines_terminated_by, defaults.lines_terminated_by),
        }
    }
}

/// One preserved snapshot of a failed attempt at a contribution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContribRetry {
    pub status: ContribStatus,
    pub error: String,
    pub start_time: u64,
    pub read_time: u64,
    pub tmp_file: String,
}

/// The stage a contribution had reached, derived from its timestamps
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContribStage {
    /// Never picked up from the input queue
    Queued,
    /// Reading the input source was in flight
    Reading,
    /// Loading into the database was in flight
    Loading,
    /// The load completed; terminal
    Loaded,
}

/// A persisted ingest contribution record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionContribInfo {
    pub id: u32,
    pub transaction_id: u32,
    pub worker: String,
    pub database: String,
    pub table: String,
    pub chunk: u32,
    pub is_overlap: bool,
    /// Source location: `file:///...` or `http(s)://...`
    pub url: String,
    /// HTTP verb for pulled sources; empty means GET
    pub http_method: String,
    /// Request body sent with pulled sources
    pub http_data: String,
    /// Extra request headers, `<name>: <value>`
    pub http_headers: Vec<String>,
    pub charset_name: String,
    pub dialect: CsvDialect,
    /// Stage timestamps, milliseconds since the epoch; 0 if unreached
    pub create_time: u64,
    pub start_time: u64,
    pub read_time: u64,
    pub load_time: u64,
    pub status: ContribStatus,
    pub tmp_file: String,
    pub num_bytes: u64,
    pub num_rows: u64,
    pub num_rows_loaded: u64,
    /// Per-row warnings retained up to the configured cap
    pub max_num_warnings: u64,
    pub warnings: Vec<String>,
    /// Remaining automatic retries
    pub max_retries: u32,
    pub num_failed_retries: u32,
    pub retries: Vec<ContribRetry>,
    pub error: String,
    pub retry_allowed: bool,
}

impl TransactionContribInfo {
    /// A fresh record in the `IN_PROGRESS` state stamped with the current
    /// time
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        transaction_id: u32,
        worker: &str,
        database: &str,
        table: &str,
        chunk: u32,
        is_overlap: bool,
        url: &str,
    ) -> Self {
        Self {
            id,
            transaction_id,
            worker: worker.to_string(),
            database: database.to_string(),
            table: table.to_string(),
            chunk,
            is_overlap,
            url: url.to_string(),
            http_method: String::new(),
            http_data: String::new(),
            http_headers: Vec::new(),
            charset_name: String::new(),
            dialect: CsvDialect::default(),
            create_time: now_ms(),
            start_time: 0,
            read_time: 0,
            load_time: 0,
            status: ContribStatus::InProgress,
            tmp_file: String::new(),
            num_bytes: 0,
            num_rows: 0,
            num_rows_loaded: 0,
            max_num_warnings: 0,
            warnings: Vec::new(),
            max_retries: 0,
            num_failed_retries: 0,
            retries: Vec::new(),
            error: String::new(),
            retry_allowed: false,
        }
    }

    /// The latest stage implied by the monotone timestamp progression.
    ///
    /// For a record persisted as `IN_PROGRESS` the `Loaded` stage is
    /// impossible; observing it indicates a corrupted record.
    pub fn latest_stage(&self) -> ContribStage {
        if self.load_time != 0 {
            ContribStage::Loaded
        } else if self.read_time != 0 {
            ContribStage::Loading
        } else if self.start_time != 0 {
            ContribStage::Reading
        } else {
            ContribStage::Queued
        }
    }

    /// Whether another automatic retry may be attempted
    pub fn can_retry(&self) -> bool {
        self.retry_allowed && self.num_failed_retries < self.max_retries
    }

    /// Preserve the current failure as a retry snapshot and reset the
    /// per-attempt fields
    pub fn record_failed_retry(&mut self) {
        self.retries.push(ContribRetry {
            status: self.status,
            error: std::mem::take(&mut self.error),
            start_time: self.start_time,
            read_time: self.read_time,
            tmp_file: std::mem::take(&mut self.tmp_file),
        });
        self.num_failed_retries += 1;
        self.start_time = 0;
        self.read_time = 0;
        self.num_bytes = 0;
        self.num_rows = 0;
        self.status = ContribStatus::InProgress;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_stage_progression() {
        let mut contrib = TransactionContribInfo::new(1, 10, "W1", "D", "Obj", 42, false, "");
        assert_eq!(contrib.latest_stage(), ContribStage::Queued);
        contrib.start_time = 100;
        assert_eq!(contrib.latest_stage(), ContribStage::Reading);
        contrib.read_time = 200;
        assert_eq!(contrib.latest_stage(), ContribStage::Loading);
        contrib.load_time = 300;
        assert_eq!(contrib.latest_stage(), ContribStage::Loaded);
    }

    #[test]
    fn test_dialect_defaults_substituted_for_empty() {
        let dialect = CsvDialect::from_parts(
            Some(String::new()),
            Some("\"".to_string()),
            None,
            Some(",".to_string()),
        );
        assert_eq!(dialect.fields_terminated_by, "\t");
        assert_eq!(dialect.fields_enclosed_by, "\"");
        assert_eq!(dialect.fields_escaped_by, "\\");
        assert_eq!(dialect.lines_terminated_by, ",");
    }

    #[test]
    fn test_retry_snapshot_resets_attempt_fields() {
        let mut contrib = TransactionContribInfo::new(1, 10, "W1", "D", "Obj", 42, false, "");
        contrib.max_retries = 2;
        contrib.retry_allowed = true;
        contrib.start_time = 100;
        contrib.read_time = 0;
        contrib.status = ContribStatus::ReadFailed;
        contrib.error = "connection reset".to_string();
        contrib.tmp_file = "/tmp/c1".to_string();

        assert!(contrib.can_retry());
        contrib.record_failed_retry();

        assert_eq!(contrib.num_failed_retries, 1);
        assert_eq!(contrib.status, ContribStatus::InProgress);
        assert_eq!(contrib.start_time, 0);
        assert!(contrib.error.is_empty());
        assert_eq!(contrib.retries.len(), 1);
        assert_eq!(contrib.retries[0].error, "connection reset");
        assert_eq!(contrib.retries[0].tmp_file, "/tmp/c1");
    }

    #[test]
    fn test_retry_exhaustion() {
        let mut contrib = TransactionContribInfo::new(1, 10, "W1", "D", "Obj", 42, false, "");
        contrib.max_retries = 1;
        contrib.retry_allowed = true;
        contrib.record_failed_retry();
        assert!(!contrib.can_retry());
    }
}
