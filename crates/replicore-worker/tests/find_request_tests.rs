//! Replica lookup against a real data folder: the stat mode, the
//! control-sum mode and the dropped-database edge case.

mod common;

use std::sync::Arc;
use std::time::Duration;

use replicore_shared::database::InMemoryDatabaseServices;
use replicore_shared::protocol::{decode_body, Priority, ProtoStatus, ReplicaInfoResponseBody};
use replicore_shared::replica::ReplicaInfo;
use replicore_worker::processor::WorkerProcessor;
use replicore_worker::requests::{find::FindWorker, WorkerRequest, WorkerRequestKind};

use common::{seed_file, test_config, test_context};

async fn run_find(
    processor: &Arc<WorkerProcessor>,
    id: &str,
    database: &str,
    chunk: u32,
    compute_check_sum: bool,
) -> ReplicaInfo {
    processor.submit(
        WorkerRequest::new(
            id.to_string(),
            Priority::Normal,
            WorkerRequestKind::Find(FindWorker::new(
                database.to_string(),
                chunk,
                compute_check_sum,
            )),
        ),
        0,
    );
    for _ in 0..200 {
        if let Some(snapshot) = processor.check_status(id).await {
            if snapshot.status == ProtoStatus::Success {
                let body: ReplicaInfoResponseBody = decode_body(&snapshot.body).unwrap();
                return ReplicaInfo::try_from(body.replica.unwrap()).unwrap();
            }
            assert!(
                !matches!(snapshot.status, ProtoStatus::Failed | ProtoStatus::Bad),
                "find request failed: {}",
                snapshot.error
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("find request never finished");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_checksum_mode_over_three_present_files() {
    let w1 = tempfile::tempdir().unwrap().keep();
    let w2 = tempfile::tempdir().unwrap().keep();
    let mut config = test_config(&w1, &w2);
    // A single-table database: three base files make the replica complete
    config.databases[0].partitioned_tables = vec!["Obj".to_string()];

    let frm = vec![1u8; 100];
    let myd = vec![2u8; 1_000_000];
    let myi = vec![3u8; 200];
    seed_file(&w1, "D", "Obj_7.frm", &frm);
    seed_file(&w1, "D", "Obj_7.MYD", &myd);
    seed_file(&w1, "D", "Obj_7.MYI", &myi);

    let store = InMemoryDatabaseServices::new();
    let ctx = test_context(config, "W1", &store);
    let processor = WorkerProcessor::new(ctx);
    processor.start();

    let replica = run_find(&processor, "find-cs", "D", 7, true).await;
    assert_eq!(replica.status, replicore_shared::replica::ReplicaStatus::Complete);
    assert_eq!(replica.worker, "W1");
    assert_eq!(replica.chunk, 7);
    assert_eq!(replica.files.len(), 3);

    let expect_sum = |content: &[u8]| {
        content
            .iter()
            .map(|b| u64::from(*b))
            .sum::<u64>()
            .to_string()
    };
    for (name, content) in [
        ("Obj_7.frm", &frm),
        ("Obj_7.MYD", &myd),
        ("Obj_7.MYI", &myi),
    ] {
        let file = replica
            .files
            .iter()
            .find(|f| f.name == name)
            .unwrap_or_else(|| panic!("missing file entry {name}"));
        assert_eq!(file.size, content.len() as u64);
        assert!(file.mtime > 0);
        assert_eq!(file.cs, expect_sum(content));
    }
    processor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stat_mode_flags_incomplete_replica() {
    let w1 = tempfile::tempdir().unwrap().keep();
    let w2 = tempfile::tempdir().unwrap().keep();
    let config = test_config(&w1, &w2);
    // Only one of the required files of table Obj; table Src fully absent
    seed_file(&w1, "D", "Obj_3.frm", b"x");

    let store = InMemoryDatabaseServices::new();
    let ctx = test_context(config, "W1", &store);
    let processor = WorkerProcessor::new(ctx);
    processor.start();

    let replica = run_find(&processor, "find-partial", "D", 3, false).await;
    assert_eq!(
        replica.status,
        replicore_shared::replica::ReplicaStatus::Incomplete
    );
    assert_eq!(replica.files.len(), 1);
    // Control sums are not computed in stat mode
    assert!(replica.files[0].cs.is_empty());
    processor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_absent_chunk_reports_not_found() {
    let w1 = tempfile::tempdir().unwrap().keep();
    let w2 = tempfile::tempdir().unwrap().keep();
    let config = test_config(&w1, &w2);

    let store = InMemoryDatabaseServices::new();
    let ctx = test_context(config, "W1", &store);
    let processor = WorkerProcessor::new(ctx);
    processor.start();

    let replica = run_find(&processor, "find-absent", "D", 99, false).await;
    assert_eq!(
        replica.status,
        replicore_shared::replica::ReplicaStatus::NotFound
    );
    assert!(replica.files.is_empty());
    processor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unconfigured_database_is_a_clean_miss() {
    let w1 = tempfile::tempdir().unwrap().keep();
    let w2 = tempfile::tempdir().unwrap().keep();
    let config = test_config(&w1, &w2);

    let store = InMemoryDatabaseServices::new();
    let ctx = test_context(config, "W1", &store);
    let processor = WorkerProcessor::new(ctx);
    processor.start();

    // The worker accepts the lookup even though the database vanished from
    // the configuration, reporting success with no files
    let replica = run_find(&processor, "find-dropped", "Dropped", 1, false).await;
    assert_eq!(
        replica.status,
        replicore_shared::replica::ReplicaStatus::NotFound
    );
    assert!(replica.files.is_empty());
    processor.shutdown();
}
