//! Service lifecycle and graceful shutdown on top of one shared message-queue
//! connection.
//!
//! An [`Instance`] owns the connection and a single channel. Named services are
//! registered against it:
//! - **Workers**: durable priority queue, each task goes to one consumer
//! - **Publishers**: fanout exchange, every consumer sees every message
//!
//! Every delivery becomes a [`Task`] that the handler settles with `next`,
//! `discard` or `defer`. Failed tasks are nacked and, when an error sink is
//! configured, reported to it as an [`ErrorReport`]. [`Instance::close`] stops
//! all consumers, waits for running tasks and only then closes the channel and
//! the connection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── Instance ─────────────────────────────┐
//! │  ServiceRegistry                ShutdownCoordinator               │
//! │  ┌─────────┐ ┌──────────┐       per-service counters + armed flag │
//! │  │ jobs    │ │ events   │──────▶ start / finish / wait_drained    │
//! │  │ worker  │ │publisher │                                         │
//! │  └────┬────┘ └────┬─────┘                                         │
//! │       └─────┬─────┘                                               │
//! │          Session (connection + channel, close-once)               │
//! └─────────────┬─────────────────────────────────────────────────────┘
//!               ▼
//!     Connector / Connection / Channel  (MemoryBroker, lapin)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tokki::{ConnectOptions, HandlerError, Task};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Resize { image: String }
//!
//! let instance = tokki::connect(ConnectOptions::new("amqp://localhost")).await?;
//! let errors = instance.worker::<tokki::ErrorReport>("errors", None)?;
//! let resize = instance.worker::<Resize>("resize", Some(errors.service()))?;
//!
//! resize
//!     .set_consumer(|task: Task<Resize>| async move {
//!         do_resize(&task.payload().image).await?;
//!         task.next().await?;
//!         Ok::<(), HandlerError>(())
//!     })
//!     .await?;
//!
//! resize.send(&Resize { image: "a.png".into() }).await?;
//!
//! // On SIGTERM
//! instance.close().await?;
//! ```

#[cfg(feature = "amqp")]
pub mod amqp;
mod config;
mod error;
mod handle;
mod instance;
mod kind;
pub mod memory;
mod metrics;
mod registry;
mod report;
mod schema;
mod service;
mod session;
pub mod shutdown;
mod task;
pub mod transport;

pub use config::{ConnectOptions, DEFAULT_PREFETCH};
pub use error::{HandlerError, Result, TaskError, TokkiError, TransportError, ValidationError};
pub use handle::{Payload, Publisher, Worker};
pub use instance::Instance;
pub use kind::{SendOptions, ServiceKind, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY};
pub use memory::MemoryBroker;
pub use registry::ServiceRegistry;
pub use report::{ErrorReport, ReportPayload};
pub use schema::{JsonSchema, Schema, ValidatedSchema};
pub use service::Service;
pub use shutdown::ShutdownCoordinator;
pub use task::{Disposition, Task, TaskHandler};

/// Connect to an AMQP broker.
#[cfg(feature = "amqp")]
pub async fn connect(options: ConnectOptions) -> Result<Instance> {
    Instance::connect_with(&amqp::AmqpConnector::new(), options).await
}
