//! Event types for the engine event system
//!
//! The realtime and disk threads never surface errors or status directly;
//! they either flip atomic flags (realtime) or push [`EngineEvent`]s (disk
//! and control threads). The [`EventBus`] fans events out to any number of
//! consumers (CLI progress output, a future UI layer, tests).

use crate::timeref::TimeRef;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Severity of a user-facing message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InfoLevel {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for InfoLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InfoLevel::Info => write!(f, "info"),
            InfoLevel::Warning => write!(f, "warning"),
            InfoLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Engine event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Transport started rolling
    TransportStarted { location: TimeRef },

    /// Transport stopped
    TransportStopped { location: TimeRef },

    /// A read source dropped out of sync and was re-synced by disk I/O.
    /// Emitted by the control thread from polled counters, never by the
    /// realtime thread itself.
    SyncLost { source_id: i64, occurrences: u64 },

    /// A source was marked invalid (file vanished, decoder rejected it).
    /// Clips referencing it render silence from now on.
    SourceInvalid { source_id: i64, reason: String },

    /// Background peak build progress (percent 0-100)
    PeakBuildProgress { source_id: i64, percent: u8 },

    /// Background peak build finished (or failed)
    PeakBuildFinished { source_id: i64, success: bool },

    /// A capture write source finished and its file is complete on disk
    RecordingFinished {
        source_id: i64,
        frames: i64,
        file_name: String,
    },

    /// A user-facing message with severity
    Message { level: InfoLevel, text: String },
}

impl EngineEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            EngineEvent::TransportStarted { .. } => "TransportStarted",
            EngineEvent::TransportStopped { .. } => "TransportStopped",
            EngineEvent::SyncLost { .. } => "SyncLost",
            EngineEvent::SourceInvalid { .. } => "SourceInvalid",
            EngineEvent::PeakBuildProgress { .. } => "PeakBuildProgress",
            EngineEvent::PeakBuildFinished { .. } => "PeakBuildFinished",
            EngineEvent::RecordingFinished { .. } => "RecordingFinished",
            EngineEvent::Message { .. } => "Message",
        }
    }

    /// Convenience constructor for an informational message
    pub fn info(text: impl Into<String>) -> Self {
        EngineEvent::Message {
            level: InfoLevel::Info,
            text: text.into(),
        }
    }

    /// Convenience constructor for a warning message
    pub fn warning(text: impl Into<String>) -> Self {
        EngineEvent::Message {
            level: InfoLevel::Warning,
            text: text.into(),
        }
    }

    /// Convenience constructor for a critical message
    pub fn critical(text: impl Into<String>) -> Self {
        EngineEvent::Message {
            level: InfoLevel::Critical,
            text: text.into(),
        }
    }
}

/// Broadcast channel capacity.
///
/// Slow consumers past this many buffered events see `Lagged` and skip
/// ahead; events are status reports, not commands, so that is acceptable.
const EVENT_BUS_CAPACITY: usize = 256;

/// Fan-out bus for [`EngineEvent`]s.
///
/// Cloning the bus clones the sender side; every [`EventBus::subscribe`]
/// call returns an independent receiver that sees all events emitted after
/// the call.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        EventBus { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// Events emitted while nobody is subscribed are dropped silently.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::TransportStarted {
            location: TimeRef::ZERO,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "TransportStarted");
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::info("nobody listening"));
    }

    #[test]
    fn message_constructors_set_level() {
        match EngineEvent::warning("w") {
            EngineEvent::Message { level, .. } => assert_eq!(level, InfoLevel::Warning),
            _ => panic!("expected Message"),
        }
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = EngineEvent::PeakBuildProgress {
            source_id: 42,
            percent: 50,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"PeakBuildProgress\""));

        let back: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "PeakBuildProgress");
    }
}
