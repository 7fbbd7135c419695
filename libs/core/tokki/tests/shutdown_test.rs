//! Graceful shutdown: draining, close ordering and broker-initiated closes.

mod common;

use common::{connect, eventually, options, Job, Recorder};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokki::memory::Op;
use tokki::transport::{EventSource, TransportEvent};
use tokki::{
    HandlerError, Instance, MemoryBroker, ServiceKind, Task, TokkiError, TransportError, Worker,
};

async fn slow_consumer(worker: &Worker<Job>, delay: Duration, done: Arc<Recorder<i64>>) {
    worker
        .set_consumer(move |task: Task<Job>| {
            let done = done.clone();
            async move {
                tokio::time::sleep(delay).await;
                done.push(task.payload().z);
                task.next().await?;
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();
}

fn position(ops: &[Op], matcher: impl Fn(&Op) -> bool) -> Option<usize> {
    ops.iter().position(matcher)
}

fn last_position(ops: &[Op], matcher: impl Fn(&Op) -> bool) -> Option<usize> {
    ops.iter().rposition(matcher)
}

// ============================================================================
// Draining
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_close_finishes_running_tasks_only() {
    let broker = MemoryBroker::new();
    let instance = connect(&broker).await;

    let q1 = instance.worker::<Job>("sd-q1", None).unwrap();
    let q2 = instance.worker::<Job>("sd-q2", None).unwrap();

    let done1 = Recorder::new();
    let done2 = Recorder::new();
    slow_consumer(&q1, Duration::from_millis(1500), done1.clone()).await;
    slow_consumer(&q2, Duration::from_millis(1000), done2.clone()).await;

    q1.send(&Job { z: 13 }).await.unwrap();
    q2.send(&Job { z: 7 }).await.unwrap();
    q2.send(&Job { z: 23 }).await.unwrap();
    q1.send(&Job { z: 42 }).await.unwrap();
    q2.send(&Job { z: 3 }).await.unwrap();
    q1.send(&Job { z: 99 }).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1150)).await;
    instance.close().await.unwrap();

    assert_eq!(done1.all(), [13]);
    assert_eq!(done2.all(), [7, 23]);
    assert!(instance.is_closed());
    assert_eq!(instance.task_count(), 0);

    // Unprocessed tasks stay in their queues.
    assert_eq!(broker.queue_len("sd-q1"), 2);
    assert_eq!(broker.queue_len("sd-q2"), 1);
    assert_eq!(broker.unacked_len(), 0);

    let ops = broker.ops();
    let last_ack = last_position(&ops, |op| matches!(op, Op::Ack { .. })).unwrap();
    let close_channel = position(&ops, |op| *op == Op::CloseChannel).unwrap();
    let close_connection = position(&ops, |op| *op == Op::CloseConnection).unwrap();
    assert!(last_ack < close_channel);
    assert!(close_channel < close_connection);
}

#[tokio::test(start_paused = true)]
async fn test_consumer_is_cancelled_before_running_tasks_finish() {
    let broker = MemoryBroker::new();
    let instance = connect(&broker).await;
    let worker = instance.worker::<Job>("jobs", None).unwrap();

    let started = Recorder::new();
    let observed = Recorder::new();
    {
        let broker = broker.clone();
        let started = started.clone();
        let observed = observed.clone();
        worker
            .set_consumer(move |task: Task<Job>| {
                let broker = broker.clone();
                let started = started.clone();
                let observed = observed.clone();
                async move {
                    started.push(());
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    let ops = broker.ops();
                    observed.push((
                        ops.iter().any(|op| matches!(op, Op::Cancel { .. })),
                        ops.contains(&Op::CloseChannel),
                    ));
                    task.next().await?;
                    Ok::<(), HandlerError>(())
                }
            })
            .await
            .unwrap();
    }

    worker.send(&Job { z: 1 }).await.unwrap();
    eventually(|| started.len() == 1).await;
    assert_eq!(instance.task_count(), 1);

    let begin = Instant::now();
    instance.close().await.unwrap();

    assert!(begin.elapsed() >= Duration::from_millis(290));
    assert_eq!(observed.all(), [(true, false)]);
    assert_eq!(instance.task_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_drain_timeout() {
    let broker = MemoryBroker::new();
    let instance = Instance::connect_with(
        &broker,
        options().with_drain_timeout(Duration::from_millis(100)),
    )
    .await
    .unwrap();
    let worker = instance.worker::<Job>("jobs", None).unwrap();

    let done = Recorder::new();
    slow_consumer(&worker, Duration::from_secs(10), done.clone()).await;
    worker.send(&Job { z: 1 }).await.unwrap();
    eventually(|| instance.task_count() == 1).await;

    let err = instance.close().await.unwrap_err();
    assert!(matches!(
        err,
        TokkiError::DrainTimeout { ref service, pending: 1 } if service == "jobs"
    ));
    assert!(instance.is_closed());
    assert!(done.all().is_empty());
}

#[tokio::test]
async fn test_cancel_waits_for_the_service_only() {
    let broker = MemoryBroker::new();
    let instance = connect(&broker).await;
    let worker = instance.worker::<Job>("jobs", None).unwrap();

    let done = Recorder::new();
    slow_consumer(&worker, Duration::from_millis(50), done.clone()).await;
    worker.send(&Job { z: 1 }).await.unwrap();
    eventually(|| worker.service().task_count() == 1).await;

    worker.cancel().await.unwrap();
    assert_eq!(done.all(), [1]);
    assert!(!worker.service().is_consuming());

    // The instance is still usable.
    assert!(!instance.is_closed());
    worker.send(&Job { z: 2 }).await.unwrap();
    assert_eq!(broker.queue_len("jobs"), 1);
}

// ============================================================================
// Close semantics
// ============================================================================

#[tokio::test]
async fn test_close_is_idempotent() {
    let broker = MemoryBroker::new();
    let instance = connect(&broker).await;
    instance.worker::<Job>("jobs", None).unwrap();

    let mut on_close = instance.on_close();
    assert!(!*on_close.borrow());

    instance.close().await.unwrap();
    assert!(on_close.has_changed().unwrap());
    assert!(*on_close.borrow_and_update());

    instance.close().await.unwrap();
    assert!(!on_close.has_changed().unwrap());

    let ops = broker.ops();
    assert_eq!(ops.iter().filter(|op| **op == Op::CloseChannel).count(), 1);
    assert_eq!(ops.iter().filter(|op| **op == Op::CloseConnection).count(), 1);
}

#[tokio::test]
async fn test_no_services_after_close() {
    let broker = MemoryBroker::new();
    let instance = connect(&broker).await;
    instance.close().await.unwrap();

    assert!(matches!(
        instance.worker::<Job>("jobs", None),
        Err(TokkiError::Closed)
    ));
    assert!(matches!(
        instance.create_service(ServiceKind::Publisher, "events", None, None),
        Err(TokkiError::Closed)
    ));
}

// ============================================================================
// Broker-initiated closes
// ============================================================================

#[tokio::test]
async fn test_channel_error_closes_the_instance() {
    let broker = MemoryBroker::new();
    let instance = connect(&broker).await;

    broker.emit(TransportEvent::Error(
        EventSource::Channel,
        TransportError::channel("PRECONDITION_FAILED - inequivalent arg"),
    ));

    tokio::time::timeout(Duration::from_secs(5), instance.closed())
        .await
        .expect("instance should close");

    let ops = broker.ops();
    assert!(ops.contains(&Op::CloseChannel));
    assert!(ops.contains(&Op::CloseConnection));

    // Nothing left to close.
    instance.close().await.unwrap();
    assert_eq!(
        broker.ops().iter().filter(|op| **op == Op::CloseConnection).count(),
        1
    );
}

#[tokio::test]
async fn test_lost_connection_closes_the_instance() {
    let broker = MemoryBroker::new();
    let instance = connect(&broker).await;
    let mut on_close = instance.on_close();

    broker.shutdown();

    tokio::time::timeout(Duration::from_secs(5), on_close.wait_for(|closed| *closed))
        .await
        .expect("instance should close")
        .unwrap();
    assert!(instance.is_closed());
}
