//! Boot-time recovery scenarios: interrupted contributions are reclassified
//! from their timestamp quadruple, honouring the auto-resume and
//! cleanup-on-resume switches.

mod common;

use std::sync::Arc;

use replicore_shared::database::InMemoryDatabaseServices;
use replicore_shared::ingest::{ContribStatus, TransactionContribInfo};
use replicore_worker::ingest::{recovery, IngestRequestMgr};

use common::{in_memory_db, test_config, test_context};

struct Fixture {
    ctx: Arc<replicore_worker::context::WorkerContext>,
    mgr: Arc<IngestRequestMgr>,
    ids: (u32, u32, u32),
    tmp_file: std::path::PathBuf,
}

/// Persist the canonical pre-restart state: an open transaction with
/// contributions `A` (queued), `B` (read interrupted) and `C` (load
/// interrupted), all `IN_PROGRESS`.
async fn fixture(auto_resume: bool, cleanup_on_resume: bool) -> Fixture {
    let w1 = tempfile::tempdir().unwrap().keep();
    let w2 = tempfile::tempdir().unwrap().keep();
    let mut config = test_config(&w1, &w2);
    config.worker.async_loader_auto_resume = u32::from(auto_resume);
    config.worker.async_loader_cleanup_on_resume = u32::from(cleanup_on_resume);

    let store = InMemoryDatabaseServices::new();
    let db = in_memory_db(&store, 2);
    let transaction = db.begin_transaction("D").await.unwrap();

    let tmp_file = w1.join("contrib-b.csv");
    std::fs::write(&tmp_file, b"partial").unwrap();

    let mut a = TransactionContribInfo::new(0, transaction.id, "W1", "D", "Obj", 1, false, "");
    a.create_time = 100;
    db.save_new_contrib(&mut a).await.unwrap();

    let mut b = TransactionContribInfo::new(0, transaction.id, "W1", "D", "Obj", 2, false, "");
    b.create_time = 200;
    b.start_time = 210;
    b.tmp_file = tmp_file.display().to_string();
    db.save_new_contrib(&mut b).await.unwrap();

    let mut c = TransactionContribInfo::new(0, transaction.id, "W1", "D", "Obj", 3, false, "");
    c.create_time = 300;
    c.start_time = 310;
    c.read_time = 320;
    db.save_new_contrib(&mut c).await.unwrap();

    let ctx = test_context(config, "W1", &store);
    let mgr = IngestRequestMgr::new(Arc::clone(&ctx.db), "W1", 2);
    Fixture {
        ctx,
        mgr,
        ids: (a.id, b.id, c.id),
        tmp_file,
    }
}

#[tokio::test]
async fn test_recovery_without_auto_resume() {
    let fixture = fixture(false, false).await;
    let (resubmitted, failed) = recovery::bootstrap(&fixture.mgr, &fixture.ctx)
        .await
        .unwrap();
    assert_eq!(resubmitted, 0);
    assert_eq!(failed, 3);

    let (a, b, c) = fixture.ids;
    let db = &fixture.ctx.db;
    let a = db.contrib(a).await.unwrap();
    assert_eq!(a.status, ContribStatus::StartFailed);
    assert!(a.retry_allowed);
    assert!(a.error.contains("still in the queued state"));

    let b = db.contrib(b).await.unwrap();
    assert_eq!(b.status, ContribStatus::ReadFailed);
    assert!(b.retry_allowed);

    let c = db.contrib(c).await.unwrap();
    assert_eq!(c.status, ContribStatus::LoadFailed);
    assert!(!c.retry_allowed);

    // Nothing was re-enqueued
    assert_eq!(fixture.mgr.num_queued(), 0);
}

#[tokio::test]
async fn test_recovery_with_auto_resume() {
    let fixture = fixture(true, false).await;
    let (resubmitted, failed) = recovery::bootstrap(&fixture.mgr, &fixture.ctx)
        .await
        .unwrap();
    assert_eq!(resubmitted, 2);
    assert_eq!(failed, 1);

    let (a, b, c) = fixture.ids;
    let db = &fixture.ctx.db;
    // A and B are back in the input queue with a cleared start stage
    assert_eq!(fixture.mgr.num_queued(), 2);
    let b = db.contrib(b).await.unwrap();
    assert_eq!(b.status, ContribStatus::InProgress);
    assert_eq!(b.start_time, 0);
    let a = db.contrib(a).await.unwrap();
    assert_eq!(a.status, ContribStatus::InProgress);

    // The interrupted load is never auto-resumed
    let c = db.contrib(c).await.unwrap();
    assert_eq!(c.status, ContribStatus::LoadFailed);
    assert!(!c.retry_allowed);

    // Resumed requests drain in their original submission order
    let first = fixture.mgr.next().await;
    assert_eq!(first.contrib.id, a.id);
}

#[tokio::test]
async fn test_cleanup_on_resume_removes_tmp_files() {
    let fixture = fixture(false, true).await;
    assert!(fixture.tmp_file.exists());
    recovery::bootstrap(&fixture.mgr, &fixture.ctx).await.unwrap();
    assert!(!fixture.tmp_file.exists());
}

#[tokio::test]
async fn test_contribs_of_closed_transactions_left_alone() {
    let fixture = fixture(false, false).await;
    // Abort the transaction before recovery runs
    let transaction_id = {
        let db = &fixture.ctx.db;
        let transactions = db.transactions(None).await.unwrap();
        transactions[0].id
    };
    fixture
        .ctx
        .db
        .end_transaction(transaction_id, true)
        .await
        .unwrap();

    let (resubmitted, failed) = recovery::bootstrap(&fixture.mgr, &fixture.ctx)
        .await
        .unwrap();
    assert_eq!(resubmitted + failed, 0);
    let (a, _, _) = fixture.ids;
    assert_eq!(
        fixture.ctx.db.contrib(a).await.unwrap().status,
        ContribStatus::InProgress
    );
}
