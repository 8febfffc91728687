//! Session event stream.
//!
//! A [`crate::DeviceSession`] publishes what happens during a refresh on a
//! broadcast channel. Hosts that only need the latest values read the
//! snapshot instead; events are for logging, UIs and tests.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use miband_types::{DeviceAddress, Reading, ReadingKind};

use crate::session::{RefreshOutcome, SessionState};

/// Default capacity of a session's event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Events emitted by a device session.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionEvent {
    /// The session moved to a new state.
    StateChanged {
        device: DeviceAddress,
        from: SessionState,
        to: SessionState,
    },
    /// A reading was written to the snapshot.
    ReadingUpdated {
        device: DeviceAddress,
        reading: Reading,
    },
    /// A payload could not be decoded; the reading was skipped.
    DecodeFailed {
        device: DeviceAddress,
        kind: ReadingKind,
        error: String,
    },
    /// A cycle failed at the link level and will be restarted.
    CycleRetry {
        device: DeviceAddress,
        attempt: u32,
        error: String,
    },
    /// A refresh finished.
    RefreshFinished {
        device: DeviceAddress,
        outcome: RefreshOutcome,
    },
}

/// Receiver for session events.
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

/// Fan-out of session events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventDispatcher {
    /// Create a dispatcher with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn send(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> DeviceAddress {
        DeviceAddress::parse("C8:0F:10:AA:BB:CC").unwrap()
    }

    #[test]
    fn test_send_without_receivers() {
        let dispatcher = EventDispatcher::default();
        assert_eq!(dispatcher.receiver_count(), 0);
        dispatcher.send(SessionEvent::RefreshFinished {
            device: addr(),
            outcome: RefreshOutcome::Failure,
        });
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let dispatcher = EventDispatcher::new(4);
        let mut rx = dispatcher.subscribe();

        dispatcher.send(SessionEvent::StateChanged {
            device: addr(),
            from: SessionState::Idle,
            to: SessionState::Connecting,
        });

        match rx.recv().await.unwrap() {
            SessionEvent::StateChanged { from, to, .. } => {
                assert_eq!(from, SessionState::Idle);
                assert_eq!(to, SessionState::Connecting);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::RefreshFinished {
            device: addr(),
            outcome: RefreshOutcome::PartialFailure,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "refresh_finished");
        assert_eq!(json["device"], "C8:0F:10:AA:BB:CC");
        assert_eq!(json["outcome"], "partial_failure");
    }
}
