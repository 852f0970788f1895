use crate::core::events::SecurityEvent;

/// Destination for security events.
///
/// Sinks are best-effort: they must not block the request path and have no way
/// to report failure back to the caller. Losing an event is acceptable.
pub trait SecurityEventSink: Send + Sync {
    /// Record a fully built event.
    fn record(&self, event: &SecurityEvent);

    /// Short name used in diagnostics.
    fn name(&self) -> &str;
}
