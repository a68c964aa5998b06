//! End-to-end scenarios over the real wire protocol: a controller driving
//! two in-process workers.

mod common;

use std::time::Duration;

use replicore_controller::jobs::{JobExtendedState, JobKind, JobSpec};
use replicore_controller::requests::{
    ExtendedState, RequestKind, RequestPayload, RequestSpec, RequestState,
};
use replicore_shared::protocol::ProtoStatus;
use replicore_shared::replica::ReplicaStatus;

use common::{fleet, seed_complete_chunk};

#[tokio::test(flavor = "multi_thread")]
async fn test_single_replication_success() {
    let fleet = fleet(|_| {}).await;
    seed_complete_chunk(&fleet.w1_dir, "D", &["Obj", "Src"], 42);

    let handle = fleet
        .controller
        .submit_request(
            RequestSpec::new(
                "W2",
                RequestKind::Replicate {
                    database: "D".to_string(),
                    chunk: 42,
                    worker_from: "W1".to_string(),
                },
            )
            .expiration_ival_sec(30),
        )
        .unwrap();
    handle.wait().await;

    let status = handle.status();
    assert_eq!(status.state, RequestState::Finished);
    assert_eq!(status.extended_state, ExtendedState::Success, "{}", status.error);
    let RequestPayload::Replica(replica) = status.payload else {
        panic!("expected a replica payload");
    };
    assert_eq!(replica.worker, "W2");
    assert_eq!(replica.database, "D");
    assert_eq!(replica.chunk, 42);
    assert_eq!(replica.status, ReplicaStatus::Complete);
    // The files actually landed at the destination
    assert!(fleet.w2_dir.join("D").join("Obj_42.MYD").exists());
    assert!(fleet.w2_dir.join("D").join("Src_42.MYI").exists());
    // The terminal snapshot is immutable: the performance record is closed
    assert!(status.performance.finish_time > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tracking_probes_reach_slow_success() {
    let fleet = fleet(|_| {}).await;
    let handle = fleet
        .controller
        .submit_request(RequestSpec::new(
            "W1",
            RequestKind::Echo {
                data: "slow".to_string(),
                delay_ms: 1500,
            },
        ))
        .unwrap();
    let begin = std::time::Instant::now();
    handle.wait().await;

    let status = handle.status();
    assert_eq!(status.extended_state, ExtendedState::Success, "{}", status.error);
    let RequestPayload::Echo(data) = status.payload else {
        panic!("expected an echo payload");
    };
    assert_eq!(data, "slow");
    // The success was only observable through tracking probes
    assert!(begin.elapsed() >= Duration::from_millis(1500));
    // The probe reply carried the worker-side performance record
    assert!(status.remote_performance.start_time > 0);
    assert!(status.remote_performance.finish_time > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_without_tracking_a_single_exchange_is_sent() {
    let fleet = fleet(|_| {}).await;
    let handle = fleet
        .controller
        .submit_request(
            RequestSpec::new(
                "W1",
                RequestKind::Echo {
                    data: "fire-and-observe".to_string(),
                    delay_ms: 500,
                },
            )
            .keep_tracking(false),
        )
        .unwrap();
    handle.wait().await;

    // The worker accepted the operation; without tracking the non-terminal
    // server status of the single exchange is latched as the terminal
    // extended state
    let status = handle.status();
    assert!(
        matches!(
            status.extended_state,
            ExtendedState::ServerQueued | ExtendedState::ServerInProgress
        ),
        "unexpected terminal state {}",
        status.extended_state
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_stops_the_worker_side() {
    let fleet = fleet(|_| {}).await;
    let handle = fleet
        .controller
        .submit_request(RequestSpec::new(
            "W1",
            RequestKind::Echo {
                data: "doomed".to_string(),
                delay_ms: 60_000,
            },
        ))
        .unwrap();

    // Give the initial exchange time to reach the worker
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.cancel();
    handle.wait().await;
    assert_eq!(handle.status().extended_state, ExtendedState::Cancelled);

    // The best-effort stop eventually lands at the worker
    let mut stopped = false;
    for _ in 0..100 {
        if let Some(snapshot) = fleet.w1.processor.check_status(handle.id()).await {
            if snapshot.status == ProtoStatus::Cancelled {
                stopped = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(stopped, "the worker never observed the stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_find_all_persists_the_census() {
    let fleet = fleet(|_| {}).await;
    seed_complete_chunk(&fleet.w1_dir, "D", &["Obj", "Src"], 5);

    let handle = fleet
        .controller
        .submit_request(RequestSpec::new(
            "W1",
            RequestKind::FindAll {
                database: "D".to_string(),
                save_replica_info: true,
            },
        ))
        .unwrap();
    handle.wait().await;
    let status = handle.status();
    assert_eq!(status.extended_state, ExtendedState::Success, "{}", status.error);

    let persisted = fleet
        .controller
        .provider
        .db
        .find_database_replicas("D")
        .await
        .unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].chunk, 5);
    assert_eq!(persisted[0].status, ReplicaStatus::Complete);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fixup_restores_colocation() {
    let fleet = fleet(|_| {}).await;
    // W1 holds the full chunk; W2 holds only table Obj of it
    seed_complete_chunk(&fleet.w1_dir, "D", &["Obj", "Src"], 11);
    seed_complete_chunk(&fleet.w2_dir, "D", &["Obj"], 11);

    let job = fleet
        .controller
        .submit_job(
            JobKind::FixUp {
                family: "production".to_string(),
            },
            JobSpec::default(),
        )
        .unwrap();
    job.wait().await;

    let status = job.status();
    assert_eq!(status.extended_state, JobExtendedState::Success);
    // W2 now holds the Src files it lacked
    assert!(fleet.w2_dir.join("D").join("Src_11.MYD").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fixup_fails_on_unrecoverable_chunk() {
    let fleet = fleet(|_| {}).await;
    // Chunk 7 exists only as an incomplete replica: no source anywhere
    let db_dir = fleet.w1_dir.join("D");
    std::fs::create_dir_all(&db_dir).unwrap();
    std::fs::write(db_dir.join("Obj_7.frm"), b"stub").unwrap();

    let job = fleet
        .controller
        .submit_job(
            JobKind::FixUp {
                family: "production".to_string(),
            },
            JobSpec::default(),
        )
        .unwrap();
    job.wait().await;

    let status = job.status();
    assert_eq!(status.extended_state, JobExtendedState::Failed);
    let failed_workers: Vec<_> = job
        .persistent_log_data()
        .into_iter()
        .filter(|(kind, _)| kind == "failed-worker")
        .collect();
    assert!(
        !failed_workers.is_empty(),
        "expected at least one failed-worker entry"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_director_index_streams_in_slices() {
    // A tiny buffer forces the extraction to stream in multiple slices
    let fleet = fleet(|config| {
        config.common.request_buf_size_bytes = 16;
    })
    .await;
    let payload = b"1,11,42\n2,17,42\n3,23,42\n4,29,42\n".to_vec();
    fleet
        .w1
        .ctx
        .sql
        .execute(&replicore_shared::protocol::SqlRequestBody {
            operation: replicore_shared::protocol::ProtoSqlOperation::CreateDatabase as i32,
            database: "D".to_string(),
            ..Default::default()
        })
        .unwrap();
    fleet
        .w1
        .ctx
        .sql
        .execute(&replicore_shared::protocol::SqlRequestBody {
            operation: replicore_shared::protocol::ProtoSqlOperation::CreateTable as i32,
            database: "D".to_string(),
            table: "Obj".to_string(),
            schema_columns: vec!["objectId BIGINT".to_string()],
            ..Default::default()
        })
        .unwrap();
    fleet
        .w1
        .ctx
        .sql
        .put_director_index("D", "Obj", 42, 0, payload.clone())
        .unwrap();

    let handle = fleet
        .controller
        .submit_request(RequestSpec::new(
            "W1",
            RequestKind::DirectorIndex {
                database: "D".to_string(),
                director_table: "Obj".to_string(),
                chunk: 42,
                has_transactions: false,
                transaction_id: 0,
            },
        ))
        .unwrap();
    handle.wait().await;

    let status = handle.status();
    assert_eq!(status.extended_state, ExtendedState::Success, "{}", status.error);
    let RequestPayload::Index { file, total_bytes } = status.payload else {
        panic!("expected an index payload");
    };
    assert_eq!(total_bytes, payload.len() as u64);
    assert_eq!(std::fs::read(&file).unwrap(), payload);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_instance_identity_mismatch_is_server_bad() {
    let fleet = fleet(|_| {}).await;
    // A second controller with a different instance identity talks to the
    // same worker fleet
    let mut foreign = (*fleet.config).clone();
    foreign.common.instance_id = "imposter".to_string();
    let foreign = std::sync::Arc::new(foreign);
    let provider = replicore_controller::service_provider::ServiceProvider::with_parts(
        std::sync::Arc::clone(&foreign),
        std::sync::Arc::clone(&fleet.controller.provider.db),
        replicore_controller::messenger::Messenger::new(foreign),
    );
    let controller = replicore_controller::controller::Controller::new(provider);

    let handle = controller
        .submit_request(RequestSpec::new(
            "W1",
            RequestKind::Echo {
                data: "who goes there".to_string(),
                delay_ms: 0,
            },
        ))
        .unwrap();
    handle.wait().await;
    assert_eq!(handle.status().extended_state, ExtendedState::ServerBad);
}
