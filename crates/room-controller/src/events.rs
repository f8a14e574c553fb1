//! Room event notifications.
//!
//! Observers are plain callbacks registered on the coordinator, called as
//! `listener(event_type, event)`. They run on the coordinator task,
//! synchronously and in registration order, so they must not block.

use common::types::WorkerId;
use serde::Serialize;

/// Something observers of a room are told about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RoomEvent {
    /// A worker stopped answering keepalives; its publishers are gone.
    Unpublish {
        #[serde(rename = "workerId")]
        worker_id: WorkerId,
    },
}

impl RoomEvent {
    /// Event type string handed to observers alongside the payload.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            RoomEvent::Unpublish { .. } => "unpublish",
        }
    }
}

/// Observer callback.
pub type EventListener = Box<dyn Fn(&str, &RoomEvent) + Send + Sync>;

/// Ordered list of observers.
#[derive(Default)]
pub(crate) struct EventListeners {
    listeners: Vec<EventListener>,
}

impl EventListeners {
    pub(crate) fn push(&mut self, listener: EventListener) {
        self.listeners.push(listener);
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn dispatch(&self, event: &RoomEvent) {
        for listener in &self.listeners {
            listener(event.event_type(), event);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_listeners_called_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut listeners = EventListeners::default();

        for name in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            listeners.push(Box::new(move |event_type: &str, event: &RoomEvent| {
                assert_eq!(event_type, event.event_type());
                seen.lock().unwrap().push((name, event_type.to_string()));
            }));
        }

        listeners.dispatch(&RoomEvent::Unpublish {
            worker_id: WorkerId::from("w1"),
        });

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("first", "unpublish".to_string()),
                ("second", "unpublish".to_string()),
                ("third", "unpublish".to_string())
            ]
        );
    }

    #[test]
    fn test_unpublish_payload_wire_format() {
        let event = RoomEvent::Unpublish {
            worker_id: WorkerId::from("w1"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "unpublish");
        assert_eq!(json["workerId"], "w1");
    }
}
