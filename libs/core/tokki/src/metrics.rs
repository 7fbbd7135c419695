//! Task metrics
//!
//! Emitted through the `metrics` facade. Nothing is recorded until the
//! application installs a recorder, e.g. a Prometheus exporter.

use crate::task::Disposition;
use metrics::{counter, gauge};

/// Metrics helper for one service
#[derive(Clone, Debug)]
pub(crate) struct TaskMetrics {
    /// Registry id, used as the `service` label
    service: String,
}

impl TaskMetrics {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Update the tasks-in-flight gauge
    pub fn in_flight(&self, count: usize) {
        gauge!(
            "tokki_tasks_in_flight",
            "service" => self.service.clone()
        )
        .set(count as f64);
    }

    /// Record a task settled by its handler
    pub fn task_settled(&self, disposition: Disposition) {
        let status = match disposition {
            Disposition::Completed => "completed",
            Disposition::Discarded => "discarded",
            Disposition::Deferred => "deferred",
        };
        counter!(
            "tokki_tasks_processed_total",
            "service" => self.service.clone(),
            "status" => status
        )
        .increment(1);
    }

    /// Record a task that went through the error path
    pub fn task_failed(&self, error_name: &str) {
        counter!(
            "tokki_task_errors_total",
            "service" => self.service.clone(),
            "error" => error_name.to_string()
        )
        .increment(1);
    }
}
