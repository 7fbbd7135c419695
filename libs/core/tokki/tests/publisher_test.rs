//! Publisher services against the in-memory broker.

mod common;

use common::{connect, eventually, Job, Recorder};
use std::sync::Arc;
use tokki::{
    HandlerError, JsonSchema, MemoryBroker, Service, ServiceKind, Task, TokkiError,
};

async fn subscribe(service: &Arc<Service>, seen: Arc<Recorder<(String, i64)>>) {
    let id = service.id().to_string();
    service
        .set_consumer(
            move |task: Task<Job>| {
                let seen = seen.clone();
                let id = id.clone();
                async move {
                    seen.push((id, task.payload().z));
                    task.next().await?;
                    Ok::<(), HandlerError>(())
                }
            },
            JsonSchema::<Job>::new(),
        )
        .await
        .unwrap();
}

// ============================================================================
// Fanout
// ============================================================================

#[tokio::test]
async fn test_every_subscriber_sees_every_message() {
    let broker = MemoryBroker::new();
    let instance = connect(&broker).await;

    let seen = Recorder::new();
    let mut queues = Vec::new();
    for id in ["events-a", "events-b"] {
        let service = instance
            .create_service(ServiceKind::Publisher, "events", None, Some(id))
            .unwrap();
        subscribe(&service, seen.clone()).await;
        queues.push(service.consumer_queue());
    }

    assert_ne!(queues[0], queues[1]);
    assert!(queues.iter().all(|q| q.starts_with("amq.gen-")));
    assert!(!broker.has_queue("events"));

    let publisher = instance.publisher::<Job>("events", None).unwrap();
    publisher.send(&Job { z: 1 }).await.unwrap();
    publisher.send(&Job { z: 2 }).await.unwrap();

    eventually(|| seen.len() == 4).await;
    let mut all = seen.all();
    all.sort();
    assert_eq!(
        all,
        [
            ("events-a".to_string(), 1),
            ("events-a".to_string(), 2),
            ("events-b".to_string(), 1),
            ("events-b".to_string(), 2),
        ]
    );
}

#[tokio::test]
async fn test_publish_carries_no_priority() {
    let broker = MemoryBroker::new();
    let instance = connect(&broker).await;
    let publisher = instance.publisher::<Job>("events", None).unwrap();

    publisher.send(&Job { z: 1 }).await.unwrap();

    let published = broker.published_to("events");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].options.priority, None);
    assert!(published[0].options.persistent);
    assert!(broker.has_exchange("events"));
    // Nobody is subscribed, so the message is gone.
    assert!(!broker.has_queue("events"));
}

#[tokio::test]
async fn test_replacing_a_subscriber_binds_a_new_queue() {
    let broker = MemoryBroker::new();
    let instance = connect(&broker).await;
    let events = instance.publisher::<Job>("events", None).unwrap();

    let first = Recorder::new();
    subscribe(events.service(), first.clone()).await;
    let old_queue = events.service().consumer_queue();

    let second = Recorder::new();
    subscribe(events.service(), second.clone()).await;
    let new_queue = events.service().consumer_queue();

    // The auto-delete queue went away with the cancelled consumer.
    assert_ne!(new_queue, old_queue);
    assert!(!broker.has_queue(&old_queue));
    assert!(broker.has_queue(&new_queue));
    assert_eq!(broker.consumer_count(&new_queue), 1);

    events.send(&Job { z: 7 }).await.unwrap();
    eventually(|| second.len() == 1).await;
    assert_eq!(first.len(), 0);
}

#[tokio::test]
async fn test_subscriber_queue_goes_away_with_the_connection() {
    let broker = MemoryBroker::new();
    let instance = connect(&broker).await;
    let events = instance.publisher::<Job>("events", None).unwrap();

    subscribe(events.service(), Recorder::new()).await;
    let queue = events.service().consumer_queue();
    assert!(broker.has_queue(&queue));

    instance.close().await.unwrap();
    assert!(!broker.has_queue(&queue));
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_kind_conflict() {
    let broker = MemoryBroker::new();
    let instance = connect(&broker).await;

    instance.worker::<Job>("jobs", None).unwrap();
    let err = instance.publisher::<Job>("jobs", None).unwrap_err();

    assert!(matches!(
        err,
        TokkiError::ServiceConflict {
            existing: ServiceKind::Worker,
            requested: ServiceKind::Publisher,
            ..
        }
    ));

    // A distinct registry id on the same name is fine.
    instance
        .create_service(ServiceKind::Publisher, "jobs-events", None, Some("jobs-fanout"))
        .unwrap();
}

#[tokio::test]
async fn test_same_name_returns_the_same_service() {
    let broker = MemoryBroker::new();
    let instance = connect(&broker).await;

    let a = instance.publisher::<Job>("events", None).unwrap();
    let b = instance.publisher::<Job>("events", None).unwrap();

    assert!(Arc::ptr_eq(a.service(), b.service()));
    assert_eq!(instance.services().len(), 1);
}
