//! Instances.
//!
//! An [`Instance`] owns one connection and one channel, the service registry
//! and the shutdown coordinator. It turns transport events into state changes
//! and closes everything in order.

use crate::config::ConnectOptions;
use crate::error::{Result, TokkiError};
use crate::handle::{Payload, Publisher, Worker};
use crate::kind::ServiceKind;
use crate::registry::{check_name, ServiceRegistry};
use crate::service::Service;
use crate::session::Session;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::{Connector, EventSource, TransportEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A connection shared by named services.
pub struct Instance {
    session: Arc<Session>,
    registry: ServiceRegistry,
    coordinator: Arc<ShutdownCoordinator>,
    options: ConnectOptions,
    closing: AtomicBool,
    closed: Arc<watch::Sender<bool>>,
    watcher: JoinHandle<()>,
}

impl Instance {
    /// Connect through `connector` and open the shared channel.
    ///
    /// When the channel cannot be set up the connection is closed again
    /// before the error is returned.
    pub async fn connect_with<C>(connector: &C, options: ConnectOptions) -> Result<Self>
    where
        C: Connector + ?Sized,
    {
        info!(url = %options.redacted_url(), prefetch = options.prefetch, "Connecting");

        let connection = connector.connect(&options.url).await?;
        let events = connection.events();

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "Failed to create channel");
                if let Err(close_err) = connection.close().await {
                    warn!(error = %close_err, "Failed to close connection");
                }
                return Err(e.into());
            }
        };

        if let Err(e) = channel.prefetch(options.prefetch).await {
            error!(error = %e, "Failed to set prefetch");
            if let Err(close_err) = connection.close().await {
                warn!(error = %close_err, "Failed to close connection");
            }
            return Err(e.into());
        }

        let session = Arc::new(Session::new(connection, channel));
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let watcher = tokio::spawn(watch_events(events, session.clone(), closed.clone()));

        info!(url = %options.redacted_url(), "Connected");

        Ok(Self {
            session,
            registry: ServiceRegistry::new(),
            coordinator: Arc::new(ShutdownCoordinator::new()),
            options,
            closing: AtomicBool::new(false),
            closed,
            watcher,
        })
    }

    /// Get or create the service registered under `registry_id` (default: `name`).
    pub fn create_service(
        &self,
        kind: ServiceKind,
        name: &str,
        error_sink: Option<&Arc<Service>>,
        registry_id: Option<&str>,
    ) -> Result<Arc<Service>> {
        check_name(name)?;
        let id = registry_id.unwrap_or(name);
        check_name(id)?;

        if self.is_closing() {
            return Err(TokkiError::Closed);
        }

        self.registry.get_or_insert_with(id, kind, || {
            // close() snapshots the registry after raising the flag.
            if self.is_closing() {
                return Err(TokkiError::Closed);
            }
            debug!(service = %id, queue = %name, kind = %kind, "Registering service");
            Ok(Service::new(
                id.to_string(),
                name.to_string(),
                kind,
                error_sink.cloned(),
                self.session.clone(),
                self.coordinator.clone(),
                self.options.drain_timeout,
            ))
        })
    }

    pub fn worker<P: Payload>(
        &self,
        name: &str,
        error_sink: Option<&Arc<Service>>,
    ) -> Result<Worker<P>> {
        let service = self.create_service(ServiceKind::Worker, name, error_sink, None)?;
        Ok(Worker::new(service))
    }

    pub fn publisher<P: Payload>(
        &self,
        name: &str,
        error_sink: Option<&Arc<Service>>,
    ) -> Result<Publisher<P>> {
        let service = self.create_service(ServiceKind::Publisher, name, error_sink, None)?;
        Ok(Publisher::new(service))
    }

    pub fn service(&self, id: &str) -> Option<Arc<Service>> {
        self.registry.get(id)
    }

    pub fn services(&self) -> Vec<Arc<Service>> {
        self.registry.all()
    }

    /// Tasks running across all services.
    pub fn task_count(&self) -> usize {
        self.coordinator.total()
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.is_closed()
    }

    /// Receiver that turns `true` once the instance is closed.
    pub fn on_close(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Resolves once the instance is closed, by `close()` or by the broker.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Drain every service, then close the channel and the connection.
    ///
    /// Calling it again, or after the broker closed the connection, does
    /// nothing.
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() || self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let services = self.registry.all();
        info!(services = services.len(), pending = self.coordinator.total(), "Closing instance");

        self.coordinator.arm();

        let cancelled = futures::future::join_all(services.iter().map(|s| s.cancel())).await;
        let mut first_error = None;
        for (service, result) in services.iter().zip(cancelled) {
            if let Err(e) = result {
                error!(service = %service.id(), error = %e, "Failed to cancel service");
                first_error.get_or_insert(e);
            }
        }

        if first_error.is_none() {
            self.coordinator.wait_quiescent().await;
        }

        if let Err(e) = self.session.close_channel().await {
            warn!(error = %e, "Failed to close channel");
        }
        if let Err(e) = self.session.close_connection().await {
            warn!(error = %e, "Failed to close connection");
        }

        notify_closed(&self.closed);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("options", &self.options)
            .field("services", &self.registry.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn notify_closed(closed: &watch::Sender<bool>) {
    if closed.send_if_modified(|closed| !std::mem::replace(closed, true)) {
        info!("Instance closed");
    }
}

/// React to connection and channel events until the connection is gone.
async fn watch_events(
    mut events: broadcast::Receiver<TransportEvent>,
    session: Arc<Session>,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut connection_failed = false;
    let mut channel_failed = false;

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed transport events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                session.mark_connection_closed();
                notify_closed(&closed);
                break;
            }
        };

        match event {
            TransportEvent::Closed(EventSource::Connection) => {
                info!("Connection closed");
                session.mark_connection_closed();
                notify_closed(&closed);
                break;
            }
            TransportEvent::Closed(EventSource::Channel) => {
                debug!("Channel closed");
                session.mark_channel_closed();
                if let Err(e) = session.close_connection().await {
                    warn!(error = %e, "Failed to close connection");
                }
            }
            TransportEvent::Error(EventSource::Connection, e) => {
                if !connection_failed {
                    connection_failed = true;
                    error!(fatal = true, error = %e, "Connection error");
                }
            }
            TransportEvent::Error(EventSource::Channel, e) => {
                if !channel_failed {
                    channel_failed = true;
                    error!(fatal = true, error = %e, "Channel error");
                }
                if let Err(close_err) = session.close_channel().await {
                    warn!(error = %close_err, "Failed to close channel");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::{Channel, Connection, MockChannel, MockConnection};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct OneShot(Mutex<Option<Arc<dyn Connection>>>);

    #[async_trait]
    impl Connector for OneShot {
        async fn connect(&self, _url: &str) -> std::result::Result<Arc<dyn Connection>, TransportError> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| TransportError::connect("already used"))
        }
    }

    fn connector(connection: MockConnection) -> OneShot {
        OneShot(Mutex::new(Some(Arc::new(connection))))
    }

    #[tokio::test]
    async fn test_channel_failure_closes_connection() {
        let (events, _) = broadcast::channel(8);
        let mut connection = MockConnection::new();
        connection
            .expect_events()
            .returning(move || events.subscribe());
        connection
            .expect_create_channel()
            .times(1)
            .returning(|| Err(TransportError::channel("no channel")));
        connection.expect_close().times(1).returning(|| Ok(()));

        let result =
            Instance::connect_with(&connector(connection), ConnectOptions::new("amqp://localhost"))
                .await;

        assert!(matches!(
            result,
            Err(TokkiError::Transport(TransportError::Channel(_)))
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned() {
        let connector = OneShot(Mutex::new(None));
        let result = Instance::connect_with(&connector, ConnectOptions::new("amqp://localhost")).await;
        assert!(matches!(
            result,
            Err(TokkiError::Transport(TransportError::Connect(_)))
        ));
    }

    #[tokio::test]
    async fn test_close_with_no_services_closes_transport_once() {
        let (events, _) = broadcast::channel(8);
        let mut channel = MockChannel::new();
        channel.expect_prefetch().with(mockall::predicate::eq(5)).returning(|_| Ok(()));
        channel.expect_close().times(1).returning(|| Ok(()));
        let channel: Arc<dyn Channel> = Arc::new(channel);

        let mut connection = MockConnection::new();
        connection
            .expect_events()
            .returning(move || events.subscribe());
        connection
            .expect_create_channel()
            .returning(move || Ok(channel.clone()));
        connection.expect_close().times(1).returning(|| Ok(()));

        let instance = Instance::connect_with(
            &connector(connection),
            ConnectOptions::new("amqp://localhost").with_prefetch(5),
        )
        .await
        .unwrap();

        let mut on_close = instance.on_close();
        instance.close().await.unwrap();
        instance.close().await.unwrap();

        assert!(instance.is_closed());
        assert!(on_close.has_changed().unwrap());
        assert!(*on_close.borrow_and_update());
        instance.closed().await;
    }

    #[tokio::test]
    async fn test_registration_rules() {
        let (events, _) = broadcast::channel(8);
        let mut channel = MockChannel::new();
        channel.expect_prefetch().returning(|_| Ok(()));
        let channel: Arc<dyn Channel> = Arc::new(channel);

        let mut connection = MockConnection::new();
        connection
            .expect_events()
            .returning(move || events.subscribe());
        connection
            .expect_create_channel()
            .returning(move || Ok(channel.clone()));

        let instance =
            Instance::connect_with(&connector(connection), ConnectOptions::new("amqp://localhost"))
                .await
                .unwrap();

        assert!(matches!(
            instance.worker::<serde_json::Value>("  ", None),
            Err(TokkiError::InvalidQueueName)
        ));

        let a = instance
            .create_service(ServiceKind::Worker, "jobs", None, None)
            .unwrap();
        let b = instance
            .create_service(ServiceKind::Worker, "jobs", None, None)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // Same queue, distinct registry ids: two competing consumers.
        let c = instance
            .create_service(ServiceKind::Worker, "jobs", None, Some("jobs-2"))
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.name(), "jobs");
        assert_eq!(c.id(), "jobs-2");

        let err = instance
            .publisher::<serde_json::Value>("jobs", None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Queue \"jobs\" is a \"worker\" (requested: \"publisher\")"
        );
        assert_eq!(instance.services().len(), 2);
    }
}
