//! Tokki Worker
//!
//! Reference worker that consumes one queue and shuts down gracefully.
//!
//! ## Architecture
//!
//! ```text
//! AMQP (exchange/queue: $TOKKI_QUEUE)
//!   ↓ (prefetch: $AMQP_PREFETCH)
//! Worker<Value> + LogHandler
//!   ↓ (failed tasks)
//! AMQP (worker queue: $TOKKI_ERROR_QUEUE)
//! ```
//!
//! On SIGINT/SIGTERM the consumer is cancelled, running tasks finish, and only
//! then are the channel and the connection closed.

use async_trait::async_trait;
use core_config::amqp::AmqpConfig;
use core_config::{env_or_default, Environment, FromEnv};
use eyre::{Result, WrapErr};
use serde_json::Value;
use tokio::signal;
use tokki::{ConnectOptions, HandlerError, Instance, Task, TaskHandler, Worker};
use tracing::{info, warn};

/// Queue names read from the environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    pub queue: String,
    /// Error sink; empty disables reporting
    pub error_queue: Option<String>,
}

impl QueueSettings {
    /// - TOKKI_QUEUE: defaults to "tasks"
    /// - TOKKI_ERROR_QUEUE: defaults to "<queue>.errors", empty disables it
    pub fn from_env() -> Self {
        let queue = env_or_default("TOKKI_QUEUE", "tasks");
        let error_queue = env_or_default("TOKKI_ERROR_QUEUE", &format!("{}.errors", queue));
        let error_queue = (!error_queue.trim().is_empty()).then_some(error_queue);

        Self { queue, error_queue }
    }
}

pub fn connect_options(config: &AmqpConfig) -> ConnectOptions {
    let options = ConnectOptions::new(config.url.clone()).with_prefetch(config.prefetch);
    match config.drain_timeout {
        Some(timeout) => options.with_drain_timeout(timeout),
        None => options,
    }
}

/// Logs every task and marks it completed.
#[derive(Clone, Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl TaskHandler<Value> for LogHandler {
    async fn handle(&self, task: Task<Value>) -> Result<(), HandlerError> {
        info!(
            parent: task.span(),
            payload = %task.payload(),
            redelivered = task.redelivered(),
            created = ?task.created(),
            "Processing task"
        );

        task.next().await?;
        Ok(())
    }
}

/// Register the worker (and its error sink) and start consuming.
pub async fn register(instance: &Instance, settings: &QueueSettings) -> Result<Worker<Value>> {
    let sink = settings
        .error_queue
        .as_deref()
        .map(|name| instance.worker::<Value>(name, None))
        .transpose()
        .wrap_err("Failed to register the error queue")?;

    let worker = instance
        .worker::<Value>(&settings.queue, sink.as_ref().map(Worker::service))
        .wrap_err_with(|| format!("Failed to register queue {}", settings.queue))?;

    worker
        .set_consumer(LogHandler)
        .await
        .wrap_err("Failed to start consuming")?;

    info!(
        queue = %settings.queue,
        error_queue = ?settings.error_queue,
        "Worker registered"
    );
    Ok(worker)
}

/// Run the worker
///
/// 1. Sets up structured logging (JSON for prod, pretty for dev)
/// 2. Connects to the broker
/// 3. Consumes until SIGINT/SIGTERM or until the broker closes the connection
/// 4. Drains running tasks and closes the connection
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting tokki worker");

    let config = AmqpConfig::from_env().wrap_err("Failed to load AMQP configuration")?;
    let settings = QueueSettings::from_env();
    info!(config = ?config, "AMQP configuration loaded");

    let instance = tokki::connect(connect_options(&config))
        .await
        .wrap_err("Failed to connect to the broker")?;
    info!("Connected to the broker");

    register(&instance, &settings).await?;

    tokio::select! {
        result = shutdown_signal() => result?,
        _ = instance.closed() => {
            warn!("Connection closed by the broker");
        }
    }

    info!(pending = instance.task_count(), "Draining running tasks...");
    instance
        .close()
        .await
        .wrap_err("Failed to shut down cleanly")?;

    info!("Tokki worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.wrap_err("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokki::MemoryBroker;
    use tokki::memory::Op;

    #[test]
    fn test_queue_settings_defaults() {
        temp_env::with_vars_unset(["TOKKI_QUEUE", "TOKKI_ERROR_QUEUE"], || {
            let settings = QueueSettings::from_env();
            assert_eq!(settings.queue, "tasks");
            assert_eq!(settings.error_queue.as_deref(), Some("tasks.errors"));
        });
    }

    #[test]
    fn test_queue_settings_error_queue_disabled() {
        temp_env::with_vars(
            [("TOKKI_QUEUE", Some("resize")), ("TOKKI_ERROR_QUEUE", Some(""))],
            || {
                let settings = QueueSettings::from_env();
                assert_eq!(settings.queue, "resize");
                assert_eq!(settings.error_queue, None);
            },
        );
    }

    #[test]
    fn test_connect_options_from_config() {
        let mut config = AmqpConfig::new("amqp://localhost".to_string());
        config.prefetch = 4;
        config.drain_timeout = Some(Duration::from_secs(3));

        let options = connect_options(&config);
        assert_eq!(options.url, "amqp://localhost");
        assert_eq!(options.prefetch, 4);
        assert_eq!(options.drain_timeout, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_register_consumes_and_drains() {
        let broker = MemoryBroker::new();
        let instance = Instance::connect_with(&broker, ConnectOptions::new("memory://"))
            .await
            .unwrap();
        let settings = QueueSettings {
            queue: "tasks".to_string(),
            error_queue: Some("tasks.errors".to_string()),
        };

        let worker = register(&instance, &settings).await.unwrap();
        worker.send(&json!({"id": 1})).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !broker.ops().iter().any(|op| matches!(op, Op::Ack { .. })) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        instance.close().await.unwrap();
        assert!(instance.is_closed());
        assert!(broker.published_to("tasks.errors").is_empty());
    }
}
