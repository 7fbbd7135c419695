//! AMQP 0-9-1 backend built on `lapin`.
//!
//! Enabled with the `amqp` feature.

use crate::error::TransportError;
use crate::transport::{
    Channel, Connection, Connector, Delivery, DeliveryCallback, DeliveryProperties, EventSource,
    ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions, TransportEvent,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, ConnectionProperties};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;
const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

/// Opens `lapin` connections.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector {
    connection_name: Option<String>,
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for the connection in the broker's management UI.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(name.as_str().into());
        }

        let connection = lapin::Connection::connect(url, properties)
            .await
            .map_err(TransportError::connect)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        {
            let events = events.clone();
            connection.on_error(move |err| {
                // lapin reports a lost connection only through this callback.
                let _ = events.send(TransportEvent::Error(
                    EventSource::Connection,
                    TransportError::connect(&err),
                ));
                let _ = events.send(TransportEvent::Closed(EventSource::Connection));
            });
        }

        Ok(Arc::new(AmqpConnection {
            inner: connection,
            events,
        }))
    }
}

/// A `lapin` connection.
pub struct AmqpConnection {
    inner: lapin::Connection,
    events: broadcast::Sender<TransportEvent>,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(TransportError::channel)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(TransportError::channel)?;

        Ok(Arc::new(AmqpChannel {
            inner: channel,
            events: self.events.clone(),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))?;
        let _ = self.events.send(TransportEvent::Closed(EventSource::Connection));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// A `lapin` channel.
pub struct AmqpChannel {
    inner: lapin::Channel,
    events: broadcast::Sender<TransportEvent>,
    // Consumer tags cancelled from our side; their stream ends quietly.
    cancelled: Arc<Mutex<HashSet<String>>>,
}

/// Publisher confirms are on for every channel; a nack fails the send.
fn confirmed(confirmation: Confirmation) -> Result<(), TransportError> {
    match confirmation {
        Confirmation::Nack(_) => Err(TransportError::publish("message was nacked by the broker")),
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

fn into_delivery(delivery: lapin::message::Delivery, consumer_tag: &str) -> Delivery {
    let properties = &delivery.properties;
    Delivery {
        delivery_tag: delivery.delivery_tag,
        consumer_tag: consumer_tag.to_string(),
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: DeliveryProperties {
            message_id: properties.message_id().as_ref().map(|id| id.as_str().to_string()),
            priority: *properties.priority(),
            timestamp: *properties.timestamp(),
        },
        data: delivery.data,
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(TransportError::channel)
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), TransportError> {
        self.inner
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(TransportError::channel)
    }

    async fn assert_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        let mut arguments = FieldTable::default();
        if let Some(max_priority) = options.max_priority {
            arguments.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(max_priority));
        }

        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(TransportError::channel)?;

        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(TransportError::channel)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        let mut properties = BasicProperties::default();
        if options.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }
        if let Some(priority) = options.priority {
            properties = properties.with_priority(priority);
        }
        if let Some(timestamp) = options.timestamp {
            properties = properties.with_timestamp(timestamp);
        }

        let confirmation = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &data,
                properties,
            )
            .await
            .map_err(TransportError::publish)?
            .await
            .map_err(TransportError::publish)?;

        confirmed(confirmation)
    }

    async fn consume(
        &self,
        queue: &str,
        callback: DeliveryCallback,
    ) -> Result<String, TransportError> {
        let tag = format!("tokki-{}", Uuid::new_v4());
        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(TransportError::consume)?;

        let events = self.events.clone();
        let cancelled = self.cancelled.clone();
        let consumer_tag = tag.clone();
        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        tokio::spawn(callback(Some(into_delivery(delivery, &consumer_tag))));
                    }
                    Err(e) => {
                        error!(consumer_tag = %consumer_tag, error = %e, "Consumer stream failed");
                        let _ = events.send(TransportEvent::Error(
                            EventSource::Channel,
                            TransportError::consume(&e),
                        ));
                        break;
                    }
                }
            }

            let ours = cancelled
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&consumer_tag);
            if !ours {
                callback(None).await;
            }
            debug!(consumer_tag = %consumer_tag, "Consumer stream ended");
        });

        info!(queue = %queue, consumer_tag = %tag, "Consuming");
        Ok(tag)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.inner
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(TransportError::ack)
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.inner
            .basic_nack(delivery.delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(TransportError::ack)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(consumer_tag.to_string());

        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(TransportError::consume)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))?;
        let _ = self.events.send(TransportEvent::Closed(EventSource::Channel));
        Ok(())
    }
}
