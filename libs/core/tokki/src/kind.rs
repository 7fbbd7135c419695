//! Service kinds and their topology.
//!
//! The kind decides which exchange/queue layout a service asserts and how
//! send options are validated.

use crate::error::{Result, TokkiError};
use crate::transport::{Channel, ExchangeKind, ExchangeOptions, QueueOptions};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Lowest accepted worker priority.
pub const MIN_PRIORITY: u8 = 1;

/// Highest accepted worker priority, also the queue's `x-max-priority`.
pub const MAX_PRIORITY: u8 = 10;

/// Priority used when a worker send does not specify one.
pub const DEFAULT_PRIORITY: u8 = 1;

/// Options for `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOptions {
    pub priority: Option<u8>,
}

impl SendOptions {
    pub fn with_priority(priority: u8) -> Self {
        Self {
            priority: Some(priority),
        }
    }
}

/// The two service protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Durable direct exchange bound to a durable priority queue.
    /// Each message goes to exactly one consumer.
    Worker,
    /// Fanout exchange; each consumer binds its own exclusive queue and
    /// receives every message.
    Publisher,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Worker => "worker",
            ServiceKind::Publisher => "publisher",
        }
    }

    /// Topology shared by senders and consumers.
    pub(crate) async fn initialize_global(&self, channel: &dyn Channel, name: &str) -> Result<()> {
        match self {
            ServiceKind::Worker => {
                channel
                    .assert_exchange(name, ExchangeKind::Direct, ExchangeOptions { durable: true })
                    .await?;
                channel
                    .assert_queue(
                        name,
                        QueueOptions {
                            durable: true,
                            max_priority: Some(MAX_PRIORITY),
                            ..Default::default()
                        },
                    )
                    .await?;
                channel.bind_queue(name, name, "").await?;
            }
            ServiceKind::Publisher => {
                channel
                    .assert_exchange(name, ExchangeKind::Fanout, ExchangeOptions { durable: true })
                    .await?;
            }
        }

        debug!(queue = %name, kind = %self, "Asserted global topology");
        Ok(())
    }

    /// Sender-only topology. Neither kind needs any.
    pub(crate) async fn initialize_sender(
        &self,
        _channel: &dyn Channel,
        _name: &str,
    ) -> Result<()> {
        Ok(())
    }

    /// Consumer-only topology.
    ///
    /// Returns the queue to consume from.
    pub(crate) async fn initialize_consumer(
        &self,
        channel: &dyn Channel,
        name: &str,
    ) -> Result<String> {
        match self {
            ServiceKind::Worker => Ok(name.to_string()),
            ServiceKind::Publisher => {
                let queue = channel
                    .assert_queue(
                        "",
                        QueueOptions {
                            exclusive: true,
                            auto_delete: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                channel.bind_queue(&queue, name, "").await?;

                debug!(exchange = %name, queue = %queue, "Bound subscriber queue");
                Ok(queue)
            }
        }
    }

    /// Whether the consumer queue is deleted together with its consumer.
    pub(crate) fn consumer_queue_is_transient(&self) -> bool {
        matches!(self, ServiceKind::Publisher)
    }

    /// Resolve the priority to publish with.
    ///
    /// Workers default to [`DEFAULT_PRIORITY`] and reject anything outside
    /// `[MIN_PRIORITY, MAX_PRIORITY]`; publishers never carry a priority.
    pub fn resolve_priority(&self, options: SendOptions) -> Result<Option<u8>> {
        match self {
            ServiceKind::Worker => {
                let priority = options.priority.unwrap_or(DEFAULT_PRIORITY);
                if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
                    return Err(TokkiError::PriorityOutOfRange(priority));
                }
                Ok(Some(priority))
            }
            ServiceKind::Publisher => Ok(None),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
