//! Tasks and task handlers.
//!
//! A [`Task`] is handed to the consumer for every delivery. The handler must
//! settle it with exactly one of [`Task::next`], [`Task::discard`] or
//! [`Task::defer`]. Those consume the task, so settling twice does not
//! compile; returning without settling is reported as a task error.

use crate::error::{HandlerError, TransportError};
use crate::metrics::TaskMetrics;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::{Channel, Delivery};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, Instrument, Span};

/// How a task was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acked
    Completed,
    /// Nacked without requeue
    Discarded,
    /// Nacked with requeue
    Deferred,
}

/// Everything needed to settle a delivery.
pub(crate) struct Settlement {
    pub(crate) channel: Arc<dyn Channel>,
    pub(crate) coordinator: Arc<ShutdownCoordinator>,
    pub(crate) service_id: String,
    pub(crate) settled: Arc<AtomicBool>,
}

/// One in-flight delivery.
pub struct Task<P> {
    payload: P,
    created: Option<DateTime<Utc>>,
    delivery: Delivery,
    span: Span,
    settlement: Settlement,
}

impl<P> Task<P> {
    pub(crate) fn new(payload: P, delivery: Delivery, span: Span, settlement: Settlement) -> Self {
        let created = delivery
            .properties
            .timestamp
            .and_then(|ms| i64::try_from(ms).ok())
            .and_then(DateTime::from_timestamp_millis);

        Self {
            payload,
            created,
            delivery,
            span,
            settlement,
        }
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// When the message was published, if the sender stamped it.
    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created
    }

    pub fn message_id(&self) -> Option<&str> {
        self.delivery.properties.message_id.as_deref()
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    /// Span carrying the queue and message context of this task.
    ///
    /// Handlers already run inside it; use it to attach work spawned elsewhere.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Acknowledge the message.
    pub async fn next(self) -> Result<(), TransportError> {
        self.settle(Disposition::Completed).await
    }

    /// Reject the message for good.
    pub async fn discard(self) -> Result<(), TransportError> {
        self.settle(Disposition::Discarded).await
    }

    /// Put the message back on the queue.
    pub async fn defer(self) -> Result<(), TransportError> {
        self.settle(Disposition::Deferred).await
    }

    async fn settle(self, disposition: Disposition) -> Result<(), TransportError> {
        let Settlement {
            channel,
            coordinator,
            service_id,
            settled,
        } = self.settlement;
        let delivery = self.delivery;
        settled.store(true, Ordering::SeqCst);

        async move {
            let result = match disposition {
                Disposition::Completed => {
                    info!("Task completed successfully");
                    channel.ack(&delivery).await
                }
                Disposition::Discarded => {
                    info!("Task has failed");
                    channel.nack(&delivery, false, false).await
                }
                Disposition::Deferred => {
                    info!("Task is requeued");
                    channel.nack(&delivery, false, true).await
                }
            };

            // Finish even when the ack fails.
            TaskMetrics::new(service_id.as_str()).task_settled(disposition);
            coordinator.finish(&service_id);
            result
        }
        .instrument(self.span)
        .await
    }
}

impl<P: std::fmt::Debug> std::fmt::Debug for Task<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("payload", &self.payload)
            .field("created", &self.created)
            .field("message_id", &self.message_id())
            .finish()
    }
}

/// Processes tasks for a consumer.
///
/// Implemented for any `Fn(Task<P>) -> impl Future<Output = Result<(), HandlerError>>`.
#[async_trait]
pub trait TaskHandler<P: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, task: Task<P>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<P, F, Fut> TaskHandler<P> for F
where
    P: Send + 'static,
    F: Fn(Task<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, task: Task<P>) -> Result<(), HandlerError> {
        (self)(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DeliveryProperties, MockChannel};

    fn delivery(timestamp: Option<u64>) -> Delivery {
        Delivery {
            delivery_tag: 7,
            consumer_tag: "ctag-1".to_string(),
            exchange: "jobs".to_string(),
            routing_key: String::new(),
            redelivered: false,
            properties: DeliveryProperties {
                message_id: Some("m-1".to_string()),
                priority: Some(1),
                timestamp,
            },
            data: br#"{"a":1}"#.to_vec(),
        }
    }

    fn make_task(
        channel: MockChannel,
        coordinator: Arc<ShutdownCoordinator>,
    ) -> (Task<u8>, Arc<AtomicBool>) {
        let settled = Arc::new(AtomicBool::new(false));
        let task = Task::new(
            1,
            delivery(Some(1_700_000_000_123)),
            Span::none(),
            Settlement {
                channel: Arc::new(channel),
                coordinator,
                service_id: "jobs".to_string(),
                settled: settled.clone(),
            },
        );
        (task, settled)
    }

    #[tokio::test]
    async fn test_next_acks_and_finishes() {
        let mut channel = MockChannel::new();
        channel
            .expect_ack()
            .withf(|d| d.delivery_tag == 7)
            .times(1)
            .returning(|_| Ok(()));

        let coordinator = Arc::new(ShutdownCoordinator::new());
        coordinator.start("jobs");

        let (task, settled) = make_task(channel, coordinator.clone());
        assert_eq!(task.message_id(), Some("m-1"));
        assert_eq!(task.created().map(|c| c.timestamp_millis()), Some(1_700_000_000_123));

        task.next().await.unwrap();
        assert!(settled.load(Ordering::SeqCst));
        assert_eq!(coordinator.pending("jobs"), 0);
    }

    #[tokio::test]
    async fn test_discard_and_defer_nack() {
        let mut channel = MockChannel::new();
        channel
            .expect_nack()
            .withf(|_, multiple, requeue| !*multiple && !*requeue)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let (task, _) = make_task(channel, coordinator.clone());
        task.discard().await.unwrap();

        let mut channel = MockChannel::new();
        channel
            .expect_nack()
            .withf(|_, multiple, requeue| !*multiple && *requeue)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let (task, _) = make_task(channel, coordinator);
        task.defer().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_ack_still_finishes() {
        let mut channel = MockChannel::new();
        channel
            .expect_ack()
            .returning(|_| Err(TransportError::Closed("channel".to_string())));

        let coordinator = Arc::new(ShutdownCoordinator::new());
        coordinator.start("jobs");

        let (task, _) = make_task(channel, coordinator.clone());
        assert!(task.next().await.is_err());
        assert_eq!(coordinator.pending("jobs"), 0);
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = |task: Task<u8>| async move {
            assert_eq!(*task.payload(), 1);
            task.next().await?;
            Ok::<(), HandlerError>(())
        };

        let mut channel = MockChannel::new();
        channel.expect_ack().times(1).returning(|_| Ok(()));
        let (task, settled) = make_task(channel, Arc::new(ShutdownCoordinator::new()));

        handler.handle(task).await.unwrap();
        assert!(settled.load(Ordering::SeqCst));
    }
}
