use crate::events::{EventBus, ReflectorEvent};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Reflector device status as published on the event stream.
///
/// Connection outcomes (Unknown/Connected/Disconnected) come from the
/// summary-state handler; actuation outcomes (Open/Closed) come from the
/// command handler after the CIO state is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReflectorStatus {
    Unknown,
    Connected,
    Disconnected,
    Open,
    Closed,
}

impl fmt::Display for ReflectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReflectorStatus::Unknown => "Unknown",
            ReflectorStatus::Connected => "Connected",
            ReflectorStatus::Disconnected => "Disconnected",
            ReflectorStatus::Open => "Open",
            ReflectorStatus::Closed => "Closed",
        };
        write!(f, "{}", name)
    }
}

/// Publishes reflector status transitions on the event bus.
///
/// Each status value is published exactly once per transition: reporting the
/// value that was last published is a no-op.
pub struct StatusReporter {
    event_bus: EventBus,
    last: Mutex<Option<ReflectorStatus>>,
}

impl StatusReporter {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            event_bus,
            last: Mutex::new(None),
        }
    }

    /// Publish `status` if it differs from the last published value.
    ///
    /// Returns true if an event was published.
    pub fn report(&self, status: ReflectorStatus) -> bool {
        {
            let mut last = self.last.lock();
            if *last == Some(status) {
                debug!("Reflector status unchanged ({}), not republishing", status);
                return false;
            }
            *last = Some(status);
        }

        self.event_bus.publish(ReflectorEvent::ReflectorStatusChanged {
            status,
            timestamp: Utc::now(),
        });
        true
    }

    /// The most recently published status, if any
    pub fn current(&self) -> Option<ReflectorStatus> {
        *self.last.lock()
    }
}
