//! Error types for services, transports and tasks.
//!
//! Errors fall into three groups:
//! - **Contract violations** (`InvalidQueueName`, `ServiceConflict`,
//!   `PriorityOutOfRange`) are returned to the immediate caller.
//! - **Transport errors** wrap whatever the backend reported.
//! - **Task errors** never leave the delivery callback; they are turned into a
//!   nack and, optionally, an error report.

use crate::kind::ServiceKind;
use std::error::Error as StdError;
use thiserror::Error;

/// Error returned by a task handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the public API.
#[derive(Debug, Error)]
pub enum TokkiError {
    /// Queue name is empty or whitespace only
    #[error("Queue name is missing")]
    InvalidQueueName,

    /// The registry id is already taken by a service of another kind
    #[error("Queue \"{queue}\" is a \"{existing}\" (requested: \"{requested}\")")]
    ServiceConflict {
        queue: String,
        existing: ServiceKind,
        requested: ServiceKind,
    },

    /// Worker priority outside of [1, 10]
    #[error("Priority \"{0}\" is outside the number range [1-10].")]
    PriorityOutOfRange(u8),

    /// Payload could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error reported by the transport
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The instance is closed
    #[error("Instance is closed")]
    Closed,

    /// A service did not drain within the configured timeout
    #[error("Service \"{service}\" still has {pending} task(s) running")]
    DrainTimeout { service: String, pending: usize },
}

/// Errors reported by a transport backend.
///
/// Backends map their native errors into these variants so the core never
/// depends on a concrete client library.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connect(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("ack error: {0}")]
    Ack(String),

    #[error("resource closed: {0}")]
    Closed(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Create a connection error.
    pub fn connect(error: impl std::fmt::Display) -> Self {
        Self::Connect(error.to_string())
    }

    /// Create a channel error.
    pub fn channel(error: impl std::fmt::Display) -> Self {
        Self::Channel(error.to_string())
    }

    /// Create a publish error.
    pub fn publish(error: impl std::fmt::Display) -> Self {
        Self::Publish(error.to_string())
    }

    /// Create a consume error.
    pub fn consume(error: impl std::fmt::Display) -> Self {
        Self::Consume(error.to_string())
    }

    /// Create an ack/nack error.
    pub fn ack(error: impl std::fmt::Display) -> Self {
        Self::Ack(error.to_string())
    }
}

/// A failure while processing one delivery.
///
/// All variants take the same path: nack without requeue, counter decrement,
/// optional error report.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Body is not valid JSON
    #[error("{0}")]
    Syntax(#[source] serde_json::Error),

    /// Payload was rejected by the schema
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Handler returned an error
    #[error("{0}")]
    Handler(#[source] HandlerError),

    /// Handler returned without next/discard/defer
    #[error("Task was not marked as completed.")]
    NotFinalized,

    /// Handler panicked before settling the task
    #[error("Task handler panicked: {0}")]
    Panic(String),
}

impl TaskError {
    /// Name used in error reports.
    pub fn name(&self) -> &'static str {
        match self {
            TaskError::Syntax(_) => "SyntaxError",
            TaskError::Validation(_) => "ValidationError",
            TaskError::Handler(_) | TaskError::NotFinalized | TaskError::Panic(_) => "Error",
        }
    }

    /// The error and its source chain, one line each.
    ///
    /// Never empty: the first line is `<name>: <message>`.
    pub fn stack(&self) -> Vec<String> {
        let mut lines = vec![format!("{}: {}", self.name(), self)];

        let mut source: Option<&(dyn StdError + 'static)> = match self {
            TaskError::Syntax(e) => StdError::source(e),
            TaskError::Validation(e) => StdError::source(e),
            TaskError::Handler(e) => StdError::source(e.as_ref()),
            TaskError::NotFinalized | TaskError::Panic(_) => None,
        };

        while let Some(err) = source {
            lines.push(format!("    caused by: {}", err));
            source = err.source();
        }

        lines
    }
}

/// Schema validation failure.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Payload has the wrong shape for the target type
    #[error("{0}")]
    Shape(#[from] serde_json::Error),

    /// Field-level rules failed
    #[error("{0}")]
    Rules(#[from] validator::ValidationErrors),

    /// Custom rejection
    #[error("{0}")]
    Custom(String),
}

impl ValidationError {
    /// Create a custom validation error.
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }
}

pub type Result<T, E = TokkiError> = std::result::Result<T, E>;
