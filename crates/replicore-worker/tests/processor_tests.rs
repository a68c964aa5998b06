//! Worker processor behaviour: priority ordering, execution, cancellation,
//! expiration and disposal.

mod common;

use std::sync::Arc;
use std::time::Duration;

use replicore_shared::database::InMemoryDatabaseServices;
use replicore_shared::protocol::{Priority, ProtoStatus, ProtoStatusExt};
use replicore_worker::processor::{ServiceState, SubmitOutcome, WorkerProcessor};
use replicore_worker::requests::{echo::EchoWorker, WorkerRequest, WorkerRequestKind};

use common::{test_config, test_context};

fn echo_request(id: &str, priority: Priority, delay_ms: u64) -> WorkerRequest {
    WorkerRequest::new(
        id.to_string(),
        priority,
        WorkerRequestKind::Echo(EchoWorker::new(format!("data-{id}"), delay_ms)),
    )
}

fn processor_with_pool(pool_size: usize) -> Arc<WorkerProcessor> {
    let w1 = tempfile::tempdir().unwrap().keep();
    let w2 = tempfile::tempdir().unwrap().keep();
    let store = InMemoryDatabaseServices::new();
    let mut config = test_config(&w1, &w2);
    config.worker.num_svc_processing_threads = pool_size;
    let ctx = test_context(config, "W1", &store);
    WorkerProcessor::new(ctx)
}

fn processor() -> Arc<WorkerProcessor> {
    processor_with_pool(2)
}

async fn wait_for_status(
    processor: &Arc<WorkerProcessor>,
    id: &str,
    expected: ProtoStatus,
) -> replicore_worker::processor::StatusSnapshot {
    for _ in 0..200 {
        if let Some(snapshot) = processor.check_status(id).await {
            if snapshot.status == expected {
                return snapshot;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("request '{id}' never reached {expected}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_executes_to_success() {
    let processor = processor();
    processor.start();
    processor.submit(echo_request("r1", Priority::Normal, 50), 0);
    let snapshot = wait_for_status(&processor, "r1", ProtoStatus::Success).await;
    assert_eq!(snapshot.status_ext, ProtoStatusExt::None);
    assert!(snapshot.performance.finish_time > 0);
    processor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_priority_order_with_stable_fifo() {
    // One executor: completion order equals queue order
    let processor = processor_with_pool(1);
    processor.submit(echo_request("low-1", Priority::Low, 0), 0);
    processor.submit(echo_request("high", Priority::High, 0), 0);
    processor.submit(echo_request("low-2", Priority::Low, 0), 0);
    processor.start();

    for id in ["high", "low-1", "low-2"] {
        wait_for_status(&processor, id, ProtoStatus::Success).await;
    }
    // Completion order is observable through the start timestamps
    let high = processor.check_status("high").await.unwrap();
    let low_1 = processor.check_status("low-1").await.unwrap();
    let low_2 = processor.check_status("low-2").await.unwrap();
    assert!(high.performance.start_time <= low_1.performance.start_time);
    assert!(low_1.performance.start_time <= low_2.performance.start_time);
    processor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_of_pending_request() {
    let processor = processor();
    // Not started: the request stays pending
    processor.submit(echo_request("victim", Priority::Normal, 1000), 0);
    let snapshot = processor.stop_request("victim").await.unwrap();
    assert_eq!(snapshot.status, ProtoStatus::Cancelled);
    // Idempotent: a second stop reports the same terminal status
    let again = processor.stop_request("victim").await.unwrap();
    assert_eq!(again.status, ProtoStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_of_executing_request() {
    let processor = processor();
    processor.start();
    processor.submit(echo_request("slow", Priority::Normal, 10_000), 0);
    wait_for_status(&processor, "slow", ProtoStatus::InProgress).await;
    processor.stop_request("slow").await.unwrap();
    let snapshot = wait_for_status(&processor, "slow", ProtoStatus::Cancelled).await;
    assert!(snapshot.performance.finish_time > 0);
    processor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expiration_of_executing_request() {
    let processor = processor();
    processor.start();
    processor.submit(echo_request("overdue", Priority::Normal, 60_000), 1);
    let snapshot = wait_for_status(&processor, "overdue", ProtoStatus::Failed).await;
    assert_eq!(snapshot.status_ext, ProtoStatusExt::Expired);
    processor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dispose_forgets_finished_requests() {
    let processor = processor();
    processor.start();
    processor.submit(echo_request("gc", Priority::Normal, 0), 0);
    wait_for_status(&processor, "gc", ProtoStatus::Success).await;

    let disposed = processor.dispose(&["gc".to_string(), "absent".to_string()]);
    assert_eq!(disposed[0], ("gc".to_string(), true));
    assert_eq!(disposed[1], ("absent".to_string(), false));
    assert!(processor.check_status("gc").await.is_none());
    processor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_suspend_holds_the_queue() {
    let processor = processor();
    processor.start();
    processor.set_service_state(ServiceState::Suspended).await;
    processor.submit(echo_request("held", Priority::Normal, 0), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshot = processor.check_status("held").await.unwrap();
    assert_eq!(snapshot.status, ProtoStatus::Queued);

    processor.set_service_state(ServiceState::Running).await;
    wait_for_status(&processor, "held", ProtoStatus::Success).await;
    processor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_census_counts() {
    let processor = processor();
    processor.submit(echo_request("q1", Priority::Normal, 0), 0);
    processor.submit(echo_request("q2", Priority::Normal, 0), 0);
    let census = processor.census(true).await;
    assert_eq!(census.state, "RUNNING");
    assert_eq!(census.num_new_requests, 2);
    assert_eq!(census.new_requests.len(), 2);
}
