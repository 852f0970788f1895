//! Security event log.
//!
//! Every policy failure or suspicious condition detected by the gate, the API
//! guard or the auth handlers becomes an immutable [`SecurityEvent`] handed to
//! a pluggable [`SecurityEventSink`]. Emission is fire-and-forget.
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{config::Environment, metrics, ports::event_sink::SecurityEventSink};

/// Severity attached to a security event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Get the numeric score for the severity (1-4)
    pub fn score(&self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    fn emoji(&self) -> &'static str {
        match self {
            Severity::Low => "🔵",
            Severity::Medium => "🟡",
            Severity::High => "🟠",
            Severity::Critical => "🔴",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record of a policy-relevant occurrence.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub severity: Severity,
    pub details: Map<String, Value>,
    pub environment: Environment,
}

impl SecurityEvent {
    pub fn new(
        event: impl Into<String>,
        severity: Severity,
        details: Value,
        environment: Environment,
    ) -> Self {
        let details = match details {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("detail".to_string(), other);
                map
            }
        };

        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event: event.into(),
            severity,
            details,
            environment,
        }
    }

    /// Look up a detail field as a string.
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(Value::as_str)
    }
}

/// Handle used by the pipeline stages to emit events. Cheap to clone.
#[derive(Clone)]
pub struct SecurityEventLog {
    sink: Arc<dyn SecurityEventSink>,
    environment: Environment,
}

impl SecurityEventLog {
    pub fn new(sink: Arc<dyn SecurityEventSink>, environment: Environment) -> Self {
        Self { sink, environment }
    }

    /// Build and emit an event.
    pub fn log(&self, event: &str, severity: Severity, details: Value) {
        let event = SecurityEvent::new(event, severity, details, self.environment);
        metrics::increment_security_event(&event.event, severity);
        self.sink.record(&event);
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// The sink events are written to
    pub fn sink(&self) -> Arc<dyn SecurityEventSink> {
        self.sink.clone()
    }
}

impl std::fmt::Debug for SecurityEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityEventLog")
            .field("sink", &self.sink.name())
            .field("environment", &self.environment)
            .finish()
    }
}

/// Writes events through `tracing`: emoji-coded lines in development,
/// structured records everywhere else.
pub struct TracingEventSink {
    environment: Environment,
}

impl TracingEventSink {
    pub fn new(environment: Environment) -> Self {
        Self { environment }
    }
}

impl SecurityEventSink for TracingEventSink {
    fn record(&self, event: &SecurityEvent) {
        let details = Value::Object(event.details.clone());

        if self.environment == Environment::Development {
            let line = format!(
                "{} [SECURITY] {} ({}) {}",
                event.severity.emoji(),
                event.event,
                event.severity,
                details
            );
            match event.severity {
                Severity::Low => tracing::info!(target: "portcullis::security", "{line}"),
                Severity::Medium => tracing::warn!(target: "portcullis::security", "{line}"),
                Severity::High | Severity::Critical => {
                    tracing::error!(target: "portcullis::security", "{line}")
                }
            }
            return;
        }

        match event.severity {
            Severity::Low => tracing::info!(
                target: "portcullis::security",
                event_id = %event.id,
                event = %event.event,
                severity = event.severity.as_str(),
                environment = event.environment.as_str(),
                timestamp = %event.timestamp.to_rfc3339(),
                details = %details,
                "security event"
            ),
            Severity::Medium => tracing::warn!(
                target: "portcullis::security",
                event_id = %event.id,
                event = %event.event,
                severity = event.severity.as_str(),
                environment = event.environment.as_str(),
                timestamp = %event.timestamp.to_rfc3339(),
                details = %details,
                "security event"
            ),
            Severity::High | Severity::Critical => tracing::error!(
                target: "portcullis::security",
                event_id = %event.id,
                event = %event.event,
                severity = event.severity.as_str(),
                environment = event.environment.as_str(),
                timestamp = %event.timestamp.to_rfc3339(),
                details = %details,
                "security event"
            ),
        }
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// Keeps events in memory, oldest first.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events with the given name
    pub fn named(&self, name: &str) -> Vec<SecurityEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event == name)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl SecurityEventSink for MemoryEventSink {
    fn record(&self, event: &SecurityEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Forwards every event to several sinks.
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn SecurityEventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn SecurityEventSink>>) -> Self {
        Self { sinks }
    }
}

impl SecurityEventSink for FanoutEventSink {
    fn record(&self, event: &SecurityEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }

    fn name(&self) -> &str {
        "fanout"
    }
}
