//! Error reports sent to an error sink.

use crate::error::TaskError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Payload of a failed task as it is forwarded.
///
/// Strings are always `Raw`: a body holding a JSON string and a body that is
/// not JSON at all look the same on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReportPayload {
    /// The body was valid JSON other than a string
    Structured(Value),
    /// The body was a JSON string or not JSON; forwarded as (lossy) UTF-8
    Raw(String),
}

impl ReportPayload {
    pub fn from_body(body: &[u8]) -> Self {
        match serde_json::from_slice(body) {
            Ok(value) => Self::from_value(value),
            Err(_) => ReportPayload::Raw(String::from_utf8_lossy(body).into_owned()),
        }
    }

    fn from_value(value: Value) -> Self {
        match value {
            Value::String(raw) => ReportPayload::Raw(raw),
            value => ReportPayload::Structured(value),
        }
    }
}

impl<'de> Deserialize<'de> for ReportPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_value)
    }
}

/// Body sent to an error sink when a task fails.
///
/// ```json
/// {
///   "queue": "jobs",
///   "payload": {"a": 1},
///   "name": "Error",
///   "message": "boom",
///   "stack": ["Error: boom"]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Name of the service the task ran on
    pub queue: String,
    pub payload: ReportPayload,
    /// `SyntaxError`, `ValidationError` or `Error`
    pub name: String,
    pub message: String,
    /// Error followed by its causes, one line each
    pub stack: Vec<String>,
}

impl ErrorReport {
    pub fn new(queue: impl Into<String>, body: &[u8], error: &TaskError) -> Self {
        Self {
            queue: queue.into(),
            payload: ReportPayload::from_body(body),
            name: error.name().to_string(),
            message: error.to_string(),
            stack: error.stack(),
        }
    }
}
