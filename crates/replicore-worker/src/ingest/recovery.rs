//! Boot-time recovery of interrupted contributions.
//!
//! Every contribution persisted as `IN_PROGRESS` whose transaction is still
//! open is reclassified from its timestamp quadruple: the latest non-zero
//! timestamp identifies the stage that was in flight when the service went
//! down. Contributions interrupted at or before the read stage may be
//! re-submitted when auto-resume is enabled; a contribution whose database
//! load had started is never resumed because the load's outcome is unknown.

use std::sync::Arc;

use tracing::{error, info, warn};

use replicore_shared::errors::ReplicaResult;
use replicore_shared::ingest::{
    ContribStage, ContribStatus, TransactionContribInfo, TransactionState,
};

use crate::context::WorkerContext;

use super::{IngestRequest, IngestRequestMgr};

/// Explanation recorded on contributions failed at the queued stage
pub const ERROR_START: &str = "The request was still in the queued state when the service was \
     restarted. Resuming requests at this stage after a restart is prohibited by the \
     configuration of the replication/ingest system.";

/// Explanation recorded on contributions failed at the read stage
pub const ERROR_READ: &str = "Reading input data was interrupted when the service was restarted. \
     Resuming requests at this stage after a restart is prohibited by the configuration of the \
     replication/ingest system.";

/// Explanation recorded on contributions failed at the load stage
pub const ERROR_LOAD: &str = "Loading into the database was interrupted when the service was \
     restarted. Resuming requests at this stage is not possible.";

/// Explanation recorded on corrupted records
pub const ERROR_CORRUPT: &str = "The persisted record is corrupt: an in-progress contribution \
     cannot have completed its load stage.";

/// What the recovery pass does with one interrupted contribution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Re-enqueue as if never processed
    Resubmit,
    /// Fail at the queued stage, retry allowed
    MarkStartFailed,
    /// Fail at the read stage, retry allowed
    MarkReadFailed,
    /// Fail at the load stage, no retry
    MarkLoadFailed,
    /// The record contradicts its own status
    Corrupt,
}

/// Classify one interrupted contribution per the stage table.
///
/// The caller guarantees `contrib.status == IN_PROGRESS` and an open
/// transaction.
pub fn classify_interrupted(contrib: &TransactionContribInfo, auto_resume: bool) -> RecoveryAction {
    match contrib.latest_stage() {
        ContribStage::Loaded => RecoveryAction::Corrupt,
        ContribStage::Loading => RecoveryAction::MarkLoadFailed,
        ContribStage::Reading => {
            if auto_resume {
                RecoveryAction::Resubmit
            } else {
                RecoveryAction::MarkReadFailed
            }
        }
        ContribStage::Queued => {
            if auto_resume {
                RecoveryAction::Resubmit
            } else {
                RecoveryAction::MarkStartFailed
            }
        }
    }
}

/// Run the recovery pass and return the number of re-submitted and failed
/// contributions.
///
/// Contributions whose transaction is no longer `STARTED` are left alone
/// (the surrounding transaction abort handles them).
pub async fn bootstrap(mgr: &Arc<IngestRequestMgr>, ctx: &WorkerContext) -> ReplicaResult<(usize, usize)> {
    let cleanup_on_resume = ctx.config.worker.cleanup_on_resume();
    let auto_resume = ctx.config.worker.auto_resume();

    // Interrupted contributions across all open transactions, oldest first,
    // so auto-resume preserves the original submission order
    let mut interrupted: Vec<TransactionContribInfo> = Vec::new();
    for transaction in ctx.db.transactions(Some(TransactionState::Started)).await? {
        let contribs = ctx
            .db
            .transaction_contribs(
                transaction.id,
                Some(ContribStatus::InProgress),
                Some(mgr.worker()),
            )
            .await?;
        interrupted.extend(contribs);
    }
    interrupted.sort_by_key(|c| c.create_time);

    let mut resubmitted = 0;
    let mut failed = 0;
    for mut contrib in interrupted {
        // Best-effort cleanup of temporary files left by the previous run;
        // resumed requests open fresh files as they are processed
        if cleanup_on_resume && !contrib.tmp_file.is_empty() {
            if let Err(e) = tokio::fs::remove_file(&contrib.tmp_file).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        id = contrib.id,
                        tmp_file = %contrib.tmp_file,
                        "temporary file removal failed: {e}"
                    );
                }
            }
            contrib.tmp_file.clear();
        }

        match classify_interrupted(&contrib, auto_resume) {
            RecoveryAction::Resubmit => {
                contrib.start_time = 0;
                ctx.db.save_contrib(&contrib).await?;
                info!(id = contrib.id, database = %contrib.database, "resuming contribution");
                mgr.submit(IngestRequest::new(contrib))?;
                resubmitted += 1;
            }
            RecoveryAction::MarkStartFailed => {
                contrib.status = ContribStatus::StartFailed;
                contrib.retry_allowed = true;
                contrib.error = ERROR_START.to_string();
                ctx.db.save_contrib(&contrib).await?;
                failed += 1;
            }
            RecoveryAction::MarkReadFailed => {
                contrib.status = ContribStatus::ReadFailed;
                contrib.retry_allowed = true;
                contrib.error = ERROR_READ.to_string();
                ctx.db.save_contrib(&contrib).await?;
                failed += 1;
            }
            RecoveryAction::MarkLoadFailed => {
                contrib.status = ContribStatus::LoadFailed;
                contrib.retry_allowed = false;
                contrib.error = ERROR_LOAD.to_string();
                ctx.db.save_contrib(&contrib).await?;
                failed += 1;
            }
            RecoveryAction::Corrupt => {
                error!(
                    id = contrib.id,
                    "corrupt contribution record: load_time set on an in-progress record"
                );
                contrib.status = ContribStatus::LoadFailed;
                contrib.retry_allowed = false;
                contrib.error = ERROR_CORRUPT.to_string();
                ctx.db.save_contrib(&contrib).await?;
                failed += 1;
            }
        }
    }
    if resubmitted + failed > 0 {
        info!(resubmitted, failed, "ingest recovery pass complete");
    }
    Ok((resubmitted, failed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contrib(start_time: u64, read_time: u64) -> TransactionContribInfo {
        let mut c = TransactionContribInfo::new(1, 10, "W1", "D", "Obj", 42, false, "");
        c.start_time = start_time;
        c.read_time = read_time;
        c
    }

    #[test]
    fn test_stage_table_without_auto_resume() {
        assert_eq!(
            classify_interrupted(&contrib(0, 0), false),
            RecoveryAction::MarkStartFailed
        );
        assert_eq!(
            classify_interrupted(&contrib(100, 0), false),
            RecoveryAction::MarkReadFailed
        );
        assert_eq!(
            classify_interrupted(&contrib(100, 200), false),
            RecoveryAction::MarkLoadFailed
        );
    }

    #[test]
    fn test_stage_table_with_auto_resume() {
        assert_eq!(
            classify_interrupted(&contrib(0, 0), true),
            RecoveryAction::Resubmit
        );
        assert_eq!(
            classify_interrupted(&contrib(100, 0), true),
            RecoveryAction::Resubmit
        );
        // A load in flight is never auto-resumed
        assert_eq!(
            classify_interrupted(&contrib(100, 200), true),
            RecoveryAction::MarkLoadFailed
        );
    }

    #[test]
    fn test_corrupt_record_detected() {
        let mut c = contrib(100, 200);
        c.load_time = 300;
        assert_eq!(classify_interrupted(&c, true), RecoveryAction::Corrupt);
        assert_eq!(classify_interrupted(&c, false), RecoveryAction::Corrupt);
    }
}
