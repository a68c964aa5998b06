//! The contribution execution pipeline: stage timestamps, row accounting,
//! the load into the query service and the retry bookkeeping.

mod common;

use replicore_shared::database::InMemoryDatabaseServices;
use replicore_shared::ingest::{ContribStatus, TransactionContribInfo};
use replicore_shared::protocol::{ProtoSqlOperation, SqlRequestBody};
use replicore_worker::ingest::request::process_one;
use replicore_worker::ingest::IngestRequest;

use common::{test_config, test_context};

fn create_table(ctx: &replicore_worker::context::WorkerContext) {
    ctx.sql
        .execute(&SqlRequestBody {
            operation: ProtoSqlOperation::CreateDatabase as i32,
            database: "D".to_string(),
            ..SqlRequestBody::default()
        })
        .unwrap();
    ctx.sql
        .execute(&SqlRequestBody {
            operation: ProtoSqlOperation::CreateTable as i32,
            database: "D".to_string(),
            table: "Obj".to_string(),
            schema_columns: vec!["objectId BIGINT".to_string()],
            ..SqlRequestBody::default()
        })
        .unwrap();
}

#[tokio::test]
async fn test_contribution_runs_to_finished() {
    let w1 = tempfile::tempdir().unwrap().keep();
    let w2 = tempfile::tempdir().unwrap().keep();
    let source = w1.join("input.csv");
    std::fs::write(&source, b"1\t10.5\n2\t11.5\n3\t12.5\n").unwrap();

    let store = InMemoryDatabaseServices::new();
    let ctx = test_context(test_config(&w1, &w2), "W1", &store);
    create_table(&ctx);
    let transaction = ctx.db.begin_transaction("D").await.unwrap();

    let mut contrib = TransactionContribInfo::new(
        0,
        transaction.id,
        "W1",
        "D",
        "Obj",
        42,
        false,
        &format!("file://{}", source.display()),
    );
    ctx.db.save_new_contrib(&mut contrib).await.unwrap();
    let id = contrib.id;

    let outcome = process_one(&ctx, IngestRequest::new(contrib)).await;
    assert!(!outcome.resubmit);
    assert_eq!(outcome.contrib.status, ContribStatus::Finished);
    assert_eq!(outcome.contrib.num_rows, 3);
    assert_eq!(outcome.contrib.num_rows_loaded, 3);
    assert_eq!(outcome.contrib.num_bytes, 21);
    // The timestamp quadruple progressed monotonically
    assert!(outcome.contrib.create_time > 0);
    assert!(outcome.contrib.start_time >= outcome.contrib.create_time);
    assert!(outcome.contrib.read_time >= outcome.contrib.start_time);
    assert!(outcome.contrib.load_time >= outcome.contrib.read_time);

    // The persisted record matches and the rows landed in the query service
    let persisted = ctx.db.contrib(id).await.unwrap();
    assert_eq!(persisted.status, ContribStatus::Finished);
    let stats = ctx
        .sql
        .execute(&SqlRequestBody {
            operation: ProtoSqlOperation::TableRowStats as i32,
            database: "D".to_string(),
            table: "Obj".to_string(),
            ..SqlRequestBody::default()
        })
        .unwrap();
    assert_eq!(stats.rows[0].cells, vec!["42", "3"]);
}

#[tokio::test]
async fn test_unterminated_tail_counts_and_warns() {
    let w1 = tempfile::tempdir().unwrap().keep();
    let w2 = tempfile::tempdir().unwrap().keep();
    let source = w1.join("input.csv");
    std::fs::write(&source, b"1\t10.5\n2\t11.5").unwrap();

    let store = InMemoryDatabaseServices::new();
    let ctx = test_context(test_config(&w1, &w2), "W1", &store);
    create_table(&ctx);
    let transaction = ctx.db.begin_transaction("D").await.unwrap();

    let mut contrib = TransactionContribInfo::new(
        0,
        transaction.id,
        "W1",
        "D",
        "Obj",
        1,
        false,
        &format!("file://{}", source.display()),
    );
    contrib.max_num_warnings = 8;
    ctx.db.save_new_contrib(&mut contrib).await.unwrap();

    let outcome = process_one(&ctx, IngestRequest::new(contrib)).await;
    assert_eq!(outcome.contrib.status, ContribStatus::Finished);
    assert_eq!(outcome.contrib.num_rows, 2);
    assert_eq!(outcome.contrib.warnings.len(), 1);
    assert!(outcome.contrib.warnings[0].contains("not terminated"));
}

#[tokio::test]
async fn test_failed_read_retries_until_exhaustion() {
    let w1 = tempfile::tempdir().unwrap().keep();
    let w2 = tempfile::tempdir().unwrap().keep();

    let store = InMemoryDatabaseServices::new();
    let ctx = test_context(test_config(&w1, &w2), "W1", &store);
    create_table(&ctx);
    let transaction = ctx.db.begin_transaction("D").await.unwrap();

    let mut contrib = TransactionContribInfo::new(
        0,
        transaction.id,
        "W1",
        "D",
        "Obj",
        2,
        false,
        "/nonexistent/source.csv",
    );
    contrib.max_retries = 2;
    contrib.retry_allowed = true;
    ctx.db.save_new_contrib(&mut contrib).await.unwrap();
    let id = contrib.id;

    // First two attempts are preserved as retry snapshots and re-submitted
    let mut request = IngestRequest::new(contrib);
    for expected_retries in 1..=2 {
        let outcome = process_one(&ctx, request).await;
        assert!(outcome.resubmit);
        assert_eq!(outcome.contrib.status, ContribStatus::InProgress);
        assert_eq!(outcome.contrib.num_failed_retries, expected_retries);
        assert_eq!(outcome.contrib.start_time, 0);
        request = IngestRequest::new(outcome.contrib);
    }

    // The third attempt exhausts the budget and latches the failure
    let outcome = process_one(&ctx, request).await;
    assert!(!outcome.resubmit);
    assert_eq!(outcome.contrib.status, ContribStatus::ReadFailed);
    assert!(outcome.contrib.retry_allowed);
    assert_eq!(outcome.contrib.retries.len(), 2);

    let persisted = ctx.db.contrib(id).await.unwrap();
    assert_eq!(persisted.status, ContribStatus::ReadFailed);
    assert_eq!(persisted.num_failed_retries, 2);
}
