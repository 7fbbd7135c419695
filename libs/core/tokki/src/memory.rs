//! In-process broker.
//!
//! [`MemoryBroker`] implements the transport traits without a network. It
//! follows the AMQP rules the services depend on:
//!
//! - direct and fanout exchanges, plus the default exchange `""`
//! - priority queues (`x-max-priority`), FIFO within one priority
//! - per-consumer prefetch with round-robin dispatch
//! - ack, nack with and without requeue, consumer cancel
//! - channel and connection close events, exclusive queues
//! - auto-delete queues, dropped with their last consumer
//!
//! Every delivery runs on its own tokio task. The broker also records the
//! calls it receives and can inject failures, which is what the tests use.

use crate::error::TransportError;
use crate::transport::{
    Channel, Connection, Connector, Delivery, DeliveryCallback, DeliveryProperties, EventSource,
    ExchangeKind, ExchangeOptions, PublishOptions, QueueOptions, TransportEvent,
};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, trace};

const EVENT_CAPACITY: usize = 64;

/// A call the broker received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Publish {
        exchange: String,
        routing_key: String,
        priority: Option<u8>,
    },
    Consume {
        queue: String,
        consumer_tag: String,
    },
    Ack {
        delivery_tag: u64,
    },
    Nack {
        delivery_tag: u64,
        requeue: bool,
    },
    Cancel {
        consumer_tag: String,
    },
    CloseChannel,
    CloseConnection,
}

/// A message as it was published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub options: PublishOptions,
}

impl Published {
    /// The body parsed as JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.data).ok()
    }
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct Message {
    seq: u64,
    exchange: String,
    routing_key: String,
    data: Vec<u8>,
    properties: DeliveryProperties,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct Queue {
    owner: Option<u64>,
    auto_delete: bool,
    max_priority: Option<u8>,
    messages: Vec<Message>,
    consumers: Vec<String>,
    cursor: usize,
}

impl Queue {
    /// Index of the next message: highest priority first, then oldest.
    fn next_index(&self) -> Option<usize> {
        let cap = self.max_priority;
        self.messages
            .iter()
            .enumerate()
            .max_by_key(|(_, m)| {
                let priority = match cap {
                    Some(cap) => m.properties.priority.unwrap_or(0).min(cap),
                    None => 0,
                };
                (priority, Reverse(m.seq))
            })
            .map(|(index, _)| index)
    }
}

struct Consumer {
    queue: String,
    channel: u64,
    prefetch: u16,
    unacked: usize,
    callback: DeliveryCallback,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked < usize::from(self.prefetch)
    }
}

struct Unacked {
    consumer_tag: String,
    queue: String,
    channel: u64,
    message: Message,
}

struct ConnectionState {
    open: bool,
    events: broadcast::Sender<TransportEvent>,
}

struct ChannelState {
    connection: u64,
    open: bool,
    prefetch: u16,
}

#[derive(Debug, Default)]
struct Faults {
    connect: Option<String>,
    channel: Option<String>,
    publish: Option<String>,
    nack: Option<String>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    consumers: HashMap<String, Consumer>,
    unacked: HashMap<u64, Unacked>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    ops: Vec<Op>,
    published: Vec<Published>,
    faults: Faults,
}

type Dispatch = Vec<(DeliveryCallback, Delivery)>;

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn open_channel(&self, id: u64) -> Result<&ChannelState, TransportError> {
        match self.channels.get(&id) {
            Some(channel) if channel.open => Ok(channel),
            _ => Err(TransportError::Closed("channel".to_string())),
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, TransportError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let target = self.exchanges.get(exchange).ok_or_else(|| {
            TransportError::publish(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        Ok(target
            .bindings
            .iter()
            .filter(|(_, key)| target.kind == ExchangeKind::Fanout || key == routing_key)
            .map(|(queue, _)| queue.clone())
            .collect())
    }

    fn enqueue(
        &mut self,
        exchange: &str,
        routing_key: &str,
        data: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        let targets = self.route(exchange, routing_key)?;
        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message was not routed");
        }

        for queue in targets {
            let seq = self.next_id();
            if let Some(queue) = self.queues.get_mut(&queue) {
                queue.messages.push(Message {
                    seq,
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    data: data.clone(),
                    properties: DeliveryProperties {
                        message_id: None,
                        priority: options.priority,
                        timestamp: options.timestamp,
                    },
                    redelivered: false,
                });
            }
        }
        Ok(())
    }

    /// Hand ready messages to consumers with free prefetch slots.
    fn dispatch(&mut self) -> Dispatch {
        let mut out = Vec::new();
        let names: Vec<String> = self.queues.keys().cloned().collect();

        for name in names {
            loop {
                let Some(queue) = self.queues.get_mut(&name) else {
                    break;
                };
                let count = queue.consumers.len();
                if queue.messages.is_empty() || count == 0 {
                    break;
                }

                let chosen = (0..count)
                    .map(|offset| (queue.cursor + offset) % count)
                    .find(|&index| {
                        self.consumers
                            .get(&queue.consumers[index])
                            .is_some_and(Consumer::has_capacity)
                    });
                let Some(index) = chosen else {
                    break;
                };
                let Some(position) = queue.next_index() else {
                    break;
                };

                queue.cursor = (index + 1) % count;
                let tag = queue.consumers[index].clone();
                let message = queue.messages.remove(position);

                self.next_id += 1;
                let delivery_tag = self.next_id;

                let Some(consumer) = self.consumers.get_mut(&tag) else {
                    break;
                };
                consumer.unacked += 1;

                out.push((
                    consumer.callback.clone(),
                    Delivery {
                        delivery_tag,
                        consumer_tag: tag.clone(),
                        exchange: message.exchange.clone(),
                        routing_key: message.routing_key.clone(),
                        redelivered: message.redelivered,
                        properties: message.properties.clone(),
                        data: message.data.clone(),
                    },
                ));
                let channel = consumer.channel;
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        consumer_tag: tag,
                        queue: name.clone(),
                        channel,
                        message,
                    },
                );
            }
        }

        out
    }

    fn settle(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let unacked = self.unacked.remove(&delivery_tag).ok_or_else(|| {
            TransportError::ack(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))
        })?;

        if let Some(consumer) = self.consumers.get_mut(&unacked.consumer_tag) {
            consumer.unacked = consumer.unacked.saturating_sub(1);
        }
        if requeue {
            self.requeue(unacked);
        }
        Ok(())
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.messages.push(message);
        }
    }

    fn remove_consumer(&mut self, tag: &str) -> Option<Consumer> {
        let consumer = self.consumers.remove(tag)?;
        let unused = match self.queues.get_mut(&consumer.queue) {
            Some(queue) => {
                queue.consumers.retain(|t| t != tag);
                queue.cursor = 0;
                queue.auto_delete && queue.consumers.is_empty()
            }
            None => false,
        };
        if unused {
            debug!(queue = %consumer.queue, "Deleting auto-delete queue");
            self.delete_queue(&consumer.queue);
        }
        Some(consumer)
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queue != name);
        }
    }

    /// Close a channel; returns its connection's event sender if it was open.
    fn close_channel(&mut self, id: u64) -> Option<broadcast::Sender<TransportEvent>> {
        let channel = self.channels.get_mut(&id)?;
        if !channel.open {
            return None;
        }
        channel.open = false;
        let connection = channel.connection;

        let tags: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.channel == id)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in tags {
            self.remove_consumer(&tag);
        }

        let pending: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in pending {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }

        self.ops.push(Op::CloseChannel);
        self.connections.get(&connection).map(|c| c.events.clone())
    }
}

/// In-process broker; clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(batch: Dispatch) {
        for (callback, delivery) in batch {
            trace!(
                delivery_tag = delivery.delivery_tag,
                consumer_tag = %delivery.consumer_tag,
                "Delivering"
            );
            tokio::spawn(callback(Some(delivery)));
        }
    }

    /// Calls received so far, in order.
    pub fn ops(&self) -> Vec<Op> {
        self.state().ops.clone()
    }

    /// Messages published so far, routed or not.
    pub fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    /// Messages published to `exchange`.
    pub fn published_to(&self, exchange: &str) -> Vec<Published> {
        self.state()
            .published
            .iter()
            .filter(|p| p.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Ready (not yet delivered) messages in `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state().exchanges.contains_key(exchange)
    }

    /// Deliveries handed out and not yet settled.
    pub fn unacked_len(&self) -> usize {
        self.state().unacked.len()
    }

    /// Consumers currently attached to `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Publish raw bytes, bypassing every channel.
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), TransportError> {
        let batch = {
            let mut state = self.state();
            state.enqueue(exchange, routing_key, data.into(), PublishOptions::default())?;
            state.dispatch()
        };
        Self::deliver(batch);
        Ok(())
    }

    /// Make `connect` fail until the faults are cleared.
    pub fn fail_connect(&self, reason: impl Into<String>) {
        self.state().faults.connect = Some(reason.into());
    }

    /// Make `create_channel` fail until the faults are cleared.
    pub fn fail_channel(&self, reason: impl Into<String>) {
        self.state().faults.channel = Some(reason.into());
    }

    /// Make `publish` fail until the faults are cleared.
    pub fn fail_publish(&self, reason: impl Into<String>) {
        self.state().faults.publish = Some(reason.into());
    }

    /// Make `nack` fail until the faults are cleared.
    pub fn fail_nack(&self, reason: impl Into<String>) {
        self.state().faults.nack = Some(reason.into());
    }

    pub fn clear_faults(&self) {
        self.state().faults = Faults::default();
    }

    /// Emit an event on every open connection.
    pub fn emit(&self, event: TransportEvent) {
        let senders: Vec<_> = self
            .state()
            .connections
            .values()
            .filter(|c| c.open)
            .map(|c| c.events.clone())
            .collect();
        for sender in senders {
            let _ = sender.send(event.clone());
        }
    }

    /// Cancel a consumer from the broker side; its callback receives `None`.
    pub fn cancel_consumer(&self, consumer_tag: &str) -> bool {
        let consumer = self.state().remove_consumer(consumer_tag);
        match consumer {
            Some(consumer) => {
                tokio::spawn((consumer.callback)(None));
                true
            }
            None => false,
        }
    }

    /// Close every open connection as if the broker went away.
    pub fn shutdown(&self) {
        let ids: Vec<u64> = self
            .state()
            .connections
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.close_connection(id);
        }
    }

    fn close_connection(&self, id: u64) {
        let mut notify = Vec::new();
        let events = {
            let mut state = self.state();
            let Some(connection) = state.connections.get_mut(&id) else {
                return;
            };
            if !connection.open {
                return;
            }
            connection.open = false;
            let events = connection.events.clone();

            let channels: Vec<u64> = state
                .channels
                .iter()
                .filter(|(_, c)| c.connection == id && c.open)
                .map(|(cid, _)| *cid)
                .collect();
            for channel in channels {
                if let Some(sender) = state.close_channel(channel) {
                    notify.push(sender);
                }
            }

            state.queues.retain(|_, q| q.owner != Some(id));
            state.ops.push(Op::CloseConnection);
            events
        };

        for sender in notify {
            let _ = sender.send(TransportEvent::Closed(EventSource::Channel));
        }
        let _ = events.send(TransportEvent::Closed(EventSource::Connection));
        debug!(connection = id, "Memory connection closed");
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let mut state = self.state();
        if let Some(reason) = &state.faults.connect {
            return Err(TransportError::connect(reason));
        }

        let id = state.next_id();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                events: events.clone(),
            },
        );

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            events,
        }))
    }
}

/// Connection handed out by [`MemoryBroker`].
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    events: broadcast::Sender<TransportEvent>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let mut state = self.broker.state();
        if let Some(reason) = &state.faults.channel {
            return Err(TransportError::channel(reason));
        }
        if !state.connections.get(&self.id).is_some_and(|c| c.open) {
            return Err(TransportError::Closed("connection".to_string()));
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                prefetch: 0,
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            connection: self.id,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.close_connection(self.id);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Channel handed out by [`MemoryConnection`].
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    connection: u64,
}

impl MemoryChannel {
    fn settle(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        let batch = {
            let mut state = self.broker.state();
            state.open_channel(self.id)?;
            state.settle(delivery.delivery_tag, requeue)?;
            state.dispatch()
        };
        MemoryBroker::deliver(batch);
        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn prefetch(&self, count: u16) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.open_channel(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        Ok(())
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: ExchangeOptions,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.open_channel(self.id)?;

        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(TransportError::channel(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn assert_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, TransportError> {
        let mut state = self.broker.state();
        state.open_channel(self.id)?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", state.next_id())
        } else {
            name.to_string()
        };

        if !state.queues.contains_key(&name) {
            state.queues.insert(
                name.clone(),
                Queue {
                    owner: options.exclusive.then_some(self.connection),
                    auto_delete: options.auto_delete,
                    max_priority: options.max_priority,
                    ..Default::default()
                },
            );
        }
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.open_channel(self.id)?;

        if !state.queues.contains_key(queue) {
            return Err(TransportError::channel(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let target = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| {
                TransportError::channel(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?;

        let binding = (queue.to_string(), routing_key.to_string());
        if !target.bindings.contains(&binding) {
            target.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        let batch = {
            let mut state = self.broker.state();
            state.open_channel(self.id)?;
            if let Some(reason) = &state.faults.publish {
                return Err(TransportError::publish(reason));
            }

            state.ops.push(Op::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                priority: options.priority,
            });
            state.published.push(Published {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                data: data.clone(),
                options,
            });
            state.enqueue(exchange, routing_key, data, options)?;
            state.dispatch()
        };
        MemoryBroker::deliver(batch);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        callback: DeliveryCallback,
    ) -> Result<String, TransportError> {
        let (tag, batch) = {
            let mut state = self.broker.state();
            let prefetch = state.open_channel(self.id)?.prefetch;
            if !state.queues.contains_key(queue) {
                return Err(TransportError::consume(format!("NOT_FOUND - no queue '{}'", queue)));
            }

            let tag = format!("ctag-{}", state.next_id());
            state.consumers.insert(
                tag.clone(),
                Consumer {
                    queue: queue.to_string(),
                    channel: self.id,
                    prefetch,
                    unacked: 0,
                    callback,
                },
            );
            if let Some(q) = state.queues.get_mut(queue) {
                q.consumers.push(tag.clone());
            }
            state.ops.push(Op::Consume {
                queue: queue.to_string(),
                consumer_tag: tag.clone(),
            });
            (tag, state.dispatch())
        };
        MemoryBroker::deliver(batch);
        Ok(tag)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.broker.state().ops.push(Op::Ack {
            delivery_tag: delivery.delivery_tag,
        });
        self.settle(delivery, false)
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        _multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.broker.state();
            if let Some(reason) = &state.faults.nack {
                return Err(TransportError::ack(reason));
            }
            state.ops.push(Op::Nack {
                delivery_tag: delivery.delivery_tag,
                requeue,
            });
        }
        self.settle(delivery, requeue)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        state.open_channel(self.id)?;
        state.ops.push(Op::Cancel {
            consumer_tag: consumer_tag.to_string(),
        });
        state.remove_consumer(consumer_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let sender = self.broker.state().close_channel(self.id);
        if let Some(sender) = sender {
            let _ = sender.send(TransportEvent::Closed(EventSource::Channel));
        }
        Ok(())
    }
}
