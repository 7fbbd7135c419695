//! Services.
//!
//! A [`Service`] mediates all broker interaction for one queue name: it asserts
//! the topology of its kind on first use, publishes, runs the consumer and
//! keeps the in-flight task count in the [`ShutdownCoordinator`].
//!
//! ```text
//! delivery ─▶ start(id) ─▶ accepting? ──no──▶ nack(requeue) ─▶ finish(id)
//!                              │yes
//!                              ▼
//!             decode ─▶ schema ─▶ handler ─▶ next / discard / defer ─▶ finish(id)
//!               │         │         │
//!               └─────────┴─────────┴──▶ nack ─▶ error sink ─▶ finish(id)
//! ```

use crate::error::{Result, TaskError, TokkiError};
use crate::kind::{SendOptions, ServiceKind};
use crate::metrics::TaskMetrics;
use crate::report::ErrorReport;
use crate::schema::Schema;
use crate::session::Session;
use crate::shutdown::ShutdownCoordinator;
use crate::task::{Settlement, Task, TaskHandler};
use crate::transport::{Delivery, DeliveryCallback, PublishOptions};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Default)]
struct Initialized {
    global: bool,
    sender: bool,
    consumer: bool,
}

struct ActiveConsumer {
    tag: String,
    accepting: Arc<AtomicBool>,
}

/// One named queue bound to a [`ServiceKind`].
pub struct Service {
    id: String,
    name: String,
    kind: ServiceKind,
    error_sink: Option<Arc<Service>>,
    session: Arc<Session>,
    coordinator: Arc<ShutdownCoordinator>,
    drain_timeout: Option<Duration>,
    initialized: tokio::sync::Mutex<Initialized>,
    // Serializes set_consumer and cancel.
    consumer_lock: tokio::sync::Mutex<()>,
    consumer: Mutex<Option<ActiveConsumer>>,
    consumer_queue: Mutex<String>,
}

impl Service {
    pub(crate) fn new(
        id: String,
        name: String,
        kind: ServiceKind,
        error_sink: Option<Arc<Service>>,
        session: Arc<Session>,
        coordinator: Arc<ShutdownCoordinator>,
        drain_timeout: Option<Duration>,
    ) -> Self {
        Self {
            consumer_queue: Mutex::new(name.clone()),
            id,
            name,
            kind,
            error_sink,
            session,
            coordinator,
            drain_timeout,
            initialized: tokio::sync::Mutex::new(Initialized::default()),
            consumer_lock: tokio::sync::Mutex::new(()),
            consumer: Mutex::new(None),
        }
    }

    /// Registry id; defaults to the name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Exchange name and, for workers, queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn error_sink(&self) -> Option<&Arc<Service>> {
        self.error_sink.as_ref()
    }

    /// Tasks currently running on this service.
    pub fn task_count(&self) -> usize {
        self.coordinator.pending(&self.id)
    }

    pub fn consumer_tag(&self) -> Option<String> {
        lock(&self.consumer).as_ref().map(|c| c.tag.clone())
    }

    /// Queue the consumer reads from.
    pub fn consumer_queue(&self) -> String {
        lock(&self.consumer_queue).clone()
    }

    pub fn is_consuming(&self) -> bool {
        lock(&self.consumer).is_some()
    }

    /// Publish `payload` as JSON.
    ///
    /// Options are validated before anything reaches the transport.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        options: SendOptions,
    ) -> Result<()> {
        let priority = self.kind.resolve_priority(options)?;
        let data = serde_json::to_vec(payload)?;

        self.ensure_sender().await?;

        info!(
            queue = %self.name,
            service = %self.id,
            payload = %String::from_utf8_lossy(&data),
            "New payload for queue"
        );

        self.session
            .channel
            .publish(
                &self.name,
                "",
                data,
                PublishOptions {
                    persistent: true,
                    priority,
                    timestamp: Some(now_millis()),
                },
            )
            .await?;

        Ok(())
    }

    /// Register `handler` as the consumer, replacing any previous one.
    ///
    /// The previous consumer is cancelled and drained first.
    pub async fn set_consumer<P, H, S>(self: &Arc<Self>, handler: H, schema: S) -> Result<()>
    where
        P: Send + 'static,
        H: TaskHandler<P>,
        S: Schema<P> + 'static,
    {
        let _guard = self.consumer_lock.lock().await;

        self.ensure_consumer().await?;
        self.cancel_consumer().await?;
        // Declares a fresh queue if the cancel took the old one with it.
        let queue = self.ensure_consumer().await?;
        info!(queue = %queue, service = %self.id, "Set consumer");

        let accepting = Arc::new(AtomicBool::new(true));
        let handler = Arc::new(handler);
        let schema = Arc::new(schema);
        let callback: DeliveryCallback = {
            let service = Arc::clone(self);
            let accepting = accepting.clone();
            Arc::new(move |delivery: Option<Delivery>| {
                let service = service.clone();
                let accepting = accepting.clone();
                let handler = handler.clone();
                let schema = schema.clone();
                async move {
                    service
                        .on_delivery::<P, H, S>(
                            delivery,
                            &accepting,
                            handler.as_ref(),
                            schema.as_ref(),
                        )
                        .await
                }
                .boxed()
            })
        };

        let tag = self.session.channel.consume(&queue, callback).await?;
        debug!(queue = %queue, consumer_tag = %tag, "Consumer registered");

        *lock(&self.consumer) = Some(ActiveConsumer { tag, accepting });
        Ok(())
    }

    /// Stop accepting deliveries and wait for running tasks to finish.
    pub async fn cancel(&self) -> Result<()> {
        let _guard = self.consumer_lock.lock().await;
        self.cancel_consumer().await
    }

    async fn cancel_consumer(&self) -> Result<()> {
        let active = lock(&self.consumer).take();

        let cancelled = match active {
            Some(active) => {
                active.accepting.store(false, Ordering::SeqCst);
                info!(service = %self.id, consumer_tag = %active.tag, "Cancelling consumer");
                let cancelled = self.session.channel.cancel(&active.tag).await;
                if self.kind.consumer_queue_is_transient() {
                    self.initialized.lock().await.consumer = false;
                }
                cancelled
            }
            None => Ok(()),
        };

        self.drain().await?;
        Ok(cancelled?)
    }

    async fn drain(&self) -> Result<()> {
        let pending = self.coordinator.pending(&self.id);
        if pending > 0 {
            info!(service = %self.id, pending, "Waiting for running tasks");
        }

        let drained = self.coordinator.wait_drained(&self.id);
        match self.drain_timeout {
            None => {
                drained.await;
                Ok(())
            }
            Some(timeout) => tokio::time::timeout(timeout, drained).await.map_err(|_| {
                TokkiError::DrainTimeout {
                    service: self.id.clone(),
                    pending: self.coordinator.pending(&self.id),
                }
            }),
        }
    }

    async fn ensure_global(&self, initialized: &mut Initialized) -> Result<()> {
        if !initialized.global {
            self.kind
                .initialize_global(self.session.channel.as_ref(), &self.name)
                .await?;
            initialized.global = true;
        }
        Ok(())
    }

    async fn ensure_sender(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        self.ensure_global(&mut initialized).await?;
        if !initialized.sender {
            self.kind
                .initialize_sender(self.session.channel.as_ref(), &self.name)
                .await?;
            initialized.sender = true;
        }
        Ok(())
    }

    async fn ensure_consumer(&self) -> Result<String> {
        let mut initialized = self.initialized.lock().await;
        self.ensure_global(&mut initialized).await?;
        if !initialized.consumer {
            let queue = self
                .kind
                .initialize_consumer(self.session.channel.as_ref(), &self.name)
                .await?;
            *lock(&self.consumer_queue) = queue;
            initialized.consumer = true;
        }
        Ok(self.consumer_queue())
    }

    async fn on_delivery<P, H, S>(
        &self,
        delivery: Option<Delivery>,
        accepting: &AtomicBool,
        handler: &H,
        schema: &S,
    ) where
        P: Send + 'static,
        H: TaskHandler<P>,
        S: Schema<P>,
    {
        let Some(delivery) = delivery else {
            info!(service = %self.id, "Consumer was cancelled by the broker");
            return;
        };

        // Counted before the check so a drain cannot slip between the two.
        self.coordinator.start(&self.id);

        if !accepting.load(Ordering::SeqCst) {
            debug!(
                service = %self.id,
                delivery_tag = delivery.delivery_tag,
                "Requeueing delivery for a cancelled consumer"
            );
            if let Err(e) = self.session.channel.nack(&delivery, false, true).await {
                warn!(service = %self.id, error = %e, "Failed to requeue delivery");
            }
            self.coordinator.finish(&self.id);
            return;
        }

        let span = info_span!(
            "task",
            queue = %self.consumer_queue(),
            service = %self.id,
            message_id = delivery.properties.message_id.as_deref().unwrap_or_default(),
        );

        let settled = Arc::new(AtomicBool::new(false));
        let run =
            self.run_task::<P, H, S>(&delivery, handler, schema, span.clone(), settled.clone());
        let outcome = match AssertUnwindSafe(run)
            .catch_unwind()
            .instrument(span.clone())
            .await
        {
            Ok(outcome) => outcome,
            // A settled task already released its counter slot.
            Err(panic) if settled.load(Ordering::SeqCst) => {
                warn!(
                    parent: &span,
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked after the task was settled"
                );
                Ok(())
            }
            Err(panic) => Err(TaskError::Panic(panic_message(panic.as_ref()))),
        };

        if let Err(err) = outcome {
            self.handle_error(&delivery, err).instrument(span).await;
        }
    }

    async fn run_task<P, H, S>(
        &self,
        delivery: &Delivery,
        handler: &H,
        schema: &S,
        span: tracing::Span,
        settled: Arc<AtomicBool>,
    ) -> std::result::Result<(), TaskError>
    where
        P: Send + 'static,
        H: TaskHandler<P>,
        S: Schema<P>,
    {
        let value: Value = serde_json::from_slice(&delivery.data).map_err(TaskError::Syntax)?;
        info!(payload = %value, "New task is started");

        let payload = schema.validate(value)?;

        let task = Task::new(
            payload,
            delivery.clone(),
            span,
            Settlement {
                channel: self.session.channel.clone(),
                coordinator: self.coordinator.clone(),
                service_id: self.id.clone(),
                settled: settled.clone(),
            },
        );

        let result = handler.handle(task).await;
        match (result, settled.load(Ordering::SeqCst)) {
            (Ok(()), true) => Ok(()),
            (Ok(()), false) => Err(TaskError::NotFinalized),
            (Err(e), false) => Err(TaskError::Handler(e)),
            (Err(e), true) => {
                warn!(error = %e, "Handler failed after the task was settled");
                Ok(())
            }
        }
    }

    /// Nack the delivery, forward a report and release the task.
    ///
    /// Failing here leaves the channel in an unknown state, so the connection
    /// is closed.
    async fn handle_error(&self, delivery: &Delivery, err: TaskError) {
        error!(error_name = err.name(), error = %err, "Task has an error");
        TaskMetrics::new(self.id.as_str()).task_failed(err.name());

        let result = self.reject_and_report(delivery, &err).await;
        self.coordinator.finish(&self.id);

        if let Err(e) = result {
            error!(fatal = true, error = %e, task_error = %err, "Error handling for task failed");
            if let Err(close_err) = self.session.close_connection().await {
                error!(error = %close_err, "Failed to close connection");
            }
        }
    }

    async fn reject_and_report(&self, delivery: &Delivery, err: &TaskError) -> Result<()> {
        self.session.channel.nack(delivery, false, false).await?;

        if let Some(sink) = &self.error_sink {
            let report = ErrorReport::new(&self.name, &delivery.data, err);
            sink.send(&report, SendOptions::default()).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("error_sink", &self.error_sink.as_ref().map(|s| s.id.clone()))
            .field("consumer_tag", &self.consumer_tag())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
