use crate::csc::SummaryState;
use crate::status::ReflectorStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Events published by the reflector CSC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReflectorEvent {
    /// The CSC moved to a new lifecycle state
    SummaryStateChanged {
        state: SummaryState,
        timestamp: DateTime<Utc>,
    },
    /// The reflector status changed (connection or actuation outcome)
    ReflectorStatusChanged {
        status: ReflectorStatus,
        timestamp: DateTime<Utc>,
    },
    /// An error was reported while entering the fault state
    ErrorReported {
        code: i64,
        report: String,
        timestamp: DateTime<Utc>,
    },
}

impl ReflectorEvent {
    /// Get the timestamp of the event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ReflectorEvent::SummaryStateChanged { timestamp, .. } => *timestamp,
            ReflectorEvent::ReflectorStatusChanged { timestamp, .. } => *timestamp,
            ReflectorEvent::ErrorReported { timestamp, .. } => *timestamp,
        }
    }

    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            ReflectorEvent::SummaryStateChanged { state, .. } => {
                format!("Summary state changed to {}", state)
            }
            ReflectorEvent::ReflectorStatusChanged { status, .. } => {
                format!("Reflector status changed to {}", status)
            }
            ReflectorEvent::ErrorReported { code, report, .. } => {
                format!("Error {}: {}", code, report)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            ReflectorEvent::SummaryStateChanged { .. } => "summary_state",
            ReflectorEvent::ReflectorStatusChanged { .. } => "reflector_status",
            ReflectorEvent::ErrorReported { .. } => "error_report",
        }
    }
}

/// Async event bus carrying CSC events to all subscribers.
///
/// Events are telemetry: publishing to a bus with no subscribers is not an
/// error, the event is simply dropped.
pub struct EventBus {
    sender: broadcast::Sender<ReflectorEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ReflectorEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers, returning how many received it
    pub fn publish(&self, event: ReflectorEvent) -> usize {
        match &event {
            ReflectorEvent::SummaryStateChanged { state, .. } => {
                info!("Summary state: {}", state);
            }
            ReflectorEvent::ReflectorStatusChanged { status, .. } => {
                info!("Reflector status: {}", status);
            }
            ReflectorEvent::ErrorReported { code, report, .. } => {
                error!("Error {} reported: {}", code, report);
            }
        }

        match self.sender.send(event) {
            Ok(count) => count,
            Err(broadcast::error::SendError(event)) => {
                debug!("No subscribers for event: {}", event.description());
                0
            }
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if there are any active subscribers
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_basic_operations() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let event = ReflectorEvent::ReflectorStatusChanged {
            status: ReflectorStatus::Connected,
            timestamp: Utc::now(),
        };

        let subscriber_count = event_bus.publish(event);
        assert_eq!(subscriber_count, 1);

        let received = receiver.recv().await.unwrap();
        match received {
            ReflectorEvent::ReflectorStatusChanged { status, .. } => {
                assert_eq!(status, ReflectorStatus::Connected);
            }
            _ => panic!("Unexpected event type"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let event_bus = EventBus::new(10);

        // No receivers: the event is dropped, not an error
        let count = event_bus.publish(ReflectorEvent::SummaryStateChanged {
            state: SummaryState::Standby,
            timestamp: Utc::now(),
        });
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        assert_eq!(event_bus.subscriber_count(), 2);

        let event = ReflectorEvent::ErrorReported {
            code: 2,
            report: "Failed to connect".to_string(),
            timestamp: Utc::now(),
        };

        event_bus.publish(event);

        let _ = timeout(Duration::from_millis(100), receiver1.recv())
            .await
            .unwrap()
            .unwrap();
        let _ = timeout(Duration::from_millis(100), receiver2.recv())
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_events_serialize_for_the_wire() {
        let event = ReflectorEvent::SummaryStateChanged {
            state: SummaryState::Enabled,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("SummaryStateChanged"));
        assert!(json.contains("Enabled"));
    }

    #[test]
    fn test_event_properties() {
        let event = ReflectorEvent::ReflectorStatusChanged {
            status: ReflectorStatus::Disconnected,
            timestamp: Utc::now(),
        };

        assert_eq!(event.event_type(), "reflector_status");
        assert!(event.description().contains("Disconnected"));
    }
}
