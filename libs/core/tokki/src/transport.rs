//! Transport contract.
//!
//! The core talks to the broker only through these traits. A backend opens a
//! connection, creates one multiplexed channel on it and reports connection and
//! channel lifecycle changes as [`TransportEvent`]s.
//!
//! ```text
//! Connector ──connect──▶ Connection ──create_channel──▶ Channel
//!                             │                            │
//!                             └──────── events() ◀─────────┘
//! ```

use crate::error::TransportError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Exchange routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routes by exact routing key
    Direct,
    /// Copies every message to every bound queue
    Fanout,
}

/// Options for `Channel::assert_exchange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
}

/// Options for `Channel::assert_queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Survives broker restarts
    pub durable: bool,
    /// Only usable by the declaring connection
    pub exclusive: bool,
    /// Deleted once the last consumer goes away
    pub auto_delete: bool,
    /// Enables priority delivery up to this value (`x-max-priority`)
    pub max_priority: Option<u8>,
}

/// Options for `Channel::publish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    /// Delivery mode 2
    pub persistent: bool,
    pub priority: Option<u8>,
    /// Milliseconds since the Unix epoch
    pub timestamp: Option<u64>,
}

/// Message properties carried with a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeliveryProperties {
    pub message_id: Option<String>,
    pub priority: Option<u8>,
    /// Milliseconds since the Unix epoch
    pub timestamp: Option<u64>,
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used for ack/nack
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: DeliveryProperties,
    pub data: Vec<u8>,
}

/// Callback registered with `Channel::consume`.
///
/// Invoked once per delivery. `None` signals that the broker cancelled the
/// consumer. The transport may run several invocations concurrently.
pub type DeliveryCallback = Arc<dyn Fn(Option<Delivery>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Which resource an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Connection,
    Channel,
}

/// Lifecycle notification emitted by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Closed(EventSource),
    Error(EventSource, TransportError),
}

/// Opens connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

/// A broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    /// Create the channel all services share.
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> Result<(), TransportError>;

    /// Subscribe to connection and channel events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// A multiplexed channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Channel: Send + Sync {
    /// Limit unacknowledged deliveries per consumer.
    async fn prefetch(&self, count: u16) -> Result<(), TransportError>;

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), TransportError>;

    /// Declare a queue; an empty name asks the broker to generate one.
    ///
    /// Returns the effective queue name.
    async fn assert_queue(&self, name: &str, options: QueueOptions)
        -> Result<String, TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError>;

    /// Start consuming with manual acknowledgements.
    ///
    /// Returns the consumer tag.
    async fn consume(
        &self,
        queue: &str,
        callback: DeliveryCallback,
    ) -> Result<String, TransportError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    async fn nack(
        &self,
        delivery: &Delivery,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError>;

    /// Stop routing deliveries to a consumer.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    /// Close the channel. Closing twice is not an error.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Strip credentials from a broker url before logging it.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme + 3 => {
            let userinfo = &url[scheme + 3..at];
            match userinfo.find(':') {
                Some(colon) => format!(
                    "{}{}:[protected]{}",
                    &url[..scheme + 3],
                    &userinfo[..colon],
                    &url[at..]
                ),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}
