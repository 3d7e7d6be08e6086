//! Observability events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity attached to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl EventSeverity {
    /// The tracing level events of this severity are logged at.
    pub fn level(self) -> tracing::Level {
        match self {
            Self::Error => tracing::Level::ERROR,
            Self::Warn => tracing::Level::WARN,
            Self::Info => tracing::Level::INFO,
            Self::Debug => tracing::Level::DEBUG,
            Self::Trace => tracing::Level::TRACE,
        }
    }
}

/// A state transition reported to the observability sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Dotted event name, e.g. `job-service.job.completed`.
    pub event_name: String,

    /// Severity of the event.
    pub event_severity: EventSeverity,

    /// Component scope, e.g. `job-service:job`.
    pub event_scope: String,

    /// Structured payload.
    pub event_data: serde_json::Value,

    /// When the event was created.
    pub event_timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn new(
        name: impl Into<String>,
        severity: EventSeverity,
        scope: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_name: name.into(),
            event_severity: severity,
            event_scope: scope.into(),
            event_data: data,
            event_timestamp: Utc::now(),
        }
    }

    /// Returns a string field of the event data.
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.event_data.get(field).and_then(|v| v.as_str())
    }

    /// The queue this event refers to, if any.
    pub fn queue_name(&self) -> Option<&str> {
        self.data_str("queueName")
    }

    /// The human-readable message, if any.
    pub fn message(&self) -> Option<&str> {
        self.data_str("message")
    }
}
