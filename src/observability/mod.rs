//! Event sinks for queue, worker and job state transitions.

pub mod event;
pub mod metrics;

use std::sync::Mutex;

use tracing::{debug, error, info, trace, warn};

pub use event::{Event, EventSeverity};
pub use self::metrics::{Metrics, MetricsObservability, MetricsServer};

/// Fire-and-forget event sink. Implementations must not block.
#[cfg_attr(test, mockall::automock)]
pub trait ObservabilityService: Send + Sync {
    /// Records an event.
    fn emit(&self, event: Event);
}

/// Logs every event through `tracing` at the level matching its severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObservability;

impl ObservabilityService for TracingObservability {
    fn emit(&self, event: Event) {
        let message = event.message().unwrap_or(event.event_name.as_str()).to_string();
        let data = event.event_data.to_string();
        let name = event.event_name.as_str();
        let scope = event.event_scope.as_str();

        match event.event_severity {
            EventSeverity::Error => error!(event = name, scope, data = %data, "{}", message),
            EventSeverity::Warn => warn!(event = name, scope, data = %data, "{}", message),
            EventSeverity::Info => info!(event = name, scope, data = %data, "{}", message),
            EventSeverity::Debug => debug!(event = name, scope, data = %data, "{}", message),
            EventSeverity::Trace => trace!(event = name, scope, data = %data, "{}", message),
        }
    }
}

/// Keeps every emitted event in memory.
#[derive(Debug, Default)]
pub struct EventBuffer {
    events: Mutex<Vec<Event>>,
}

impl EventBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded events.
    pub fn events(&self) -> Vec<Event> {
        self.lock().clone()
    }

    /// Returns the recorded events with the given name.
    pub fn named(&self, name: &str) -> Vec<Event> {
        self.lock()
            .iter()
            .filter(|e| e.event_name == name)
            .cloned()
            .collect()
    }

    /// Returns true if an event with the given name matches `predicate`.
    pub fn contains(&self, name: &str, predicate: impl Fn(&Event) -> bool) -> bool {
        self.lock()
            .iter()
            .any(|e| e.event_name == name && predicate(e))
    }

    /// Drops all recorded events.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Event>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ObservabilityService for EventBuffer {
    fn emit(&self, event: Event) {
        self.lock().push(event);
    }
}
