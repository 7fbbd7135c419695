//! The connection and channel shared by every service of an instance.

use crate::error::TransportError;
use crate::transport::{Channel, Connection};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Transport handles plus close-once guards.
///
/// Events, `Instance::close` and the error path of a service may all try to
/// close the same resource; only the first attempt reaches the transport.
pub(crate) struct Session {
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) channel: Arc<dyn Channel>,
    channel_closed: AtomicBool,
    connection_closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(connection: Arc<dyn Connection>, channel: Arc<dyn Channel>) -> Self {
        Self {
            connection,
            channel,
            channel_closed: AtomicBool::new(false),
            connection_closed: AtomicBool::new(false),
        }
    }

    pub(crate) async fn close_channel(&self) -> Result<(), TransportError> {
        if self.channel_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing channel");
        self.channel.close().await
    }

    pub(crate) async fn close_connection(&self) -> Result<(), TransportError> {
        if self.connection_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing connection");
        self.connection.close().await
    }

    /// Record that the connection went away without us closing it.
    pub(crate) fn mark_connection_closed(&self) {
        self.connection_closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_channel_closed(&self) {
        self.channel_closed.store(true, Ordering::SeqCst);
    }
}
