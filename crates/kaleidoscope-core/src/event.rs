//! Input events and per-program routing
//!
//! Events are routed into per-program FIFO queues at enqueue time, based on
//! the subscriptions each program declared during setup. Ordering is FIFO per
//! program; no cross-program ordering is guaranteed.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::{Address, Value};

/// A discrete input occurrence, tagged with its source address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Source channel.
    pub address: Address,
    /// What happened.
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event payloads.
///
/// The legacy kind name `change` is accepted on input as a synonym for
/// `update`; it is never produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// The channel reported a new value.
    #[serde(alias = "change")]
    Update {
        /// The new channel value.
        value: Value,
    },
    /// A button was pressed.
    ButtonDown,
    /// A button was released.
    ButtonUp,
    /// A full press-and-release, with the press duration in seconds.
    ButtonClicked {
        /// Press duration in seconds.
        duration: f64,
    },
    /// The button has been held down, with the duration so far in seconds.
    ButtonLongPress {
        /// Hold duration in seconds.
        duration: f64,
    },
    /// The input source reported a failure on this channel.
    Error,
}

/// The event kinds a subscription can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilterKind {
    /// Value updates.
    Update,
    /// Button pressed.
    ButtonDown,
    /// Button released.
    ButtonUp,
    /// Click (press + release).
    ButtonClicked,
    /// Long press.
    ButtonLongPress,
    /// Channel errors.
    Error,
}

impl EventFilterKind {
    /// Parse the script-facing kind name.
    pub fn from_name(name: &str) -> Option<EventFilterKind> {
        match name {
            "update" | "change" => Some(EventFilterKind::Update),
            "button_down" => Some(EventFilterKind::ButtonDown),
            "button_up" => Some(EventFilterKind::ButtonUp),
            "button_clicked" => Some(EventFilterKind::ButtonClicked),
            "button_long_press" => Some(EventFilterKind::ButtonLongPress),
            "error" => Some(EventFilterKind::Error),
            _ => None,
        }
    }

    /// Whether an event payload matches this kind.
    pub fn matches(&self, kind: &EventKind) -> bool {
        matches!(
            (self, kind),
            (EventFilterKind::Update, EventKind::Update { .. })
                | (EventFilterKind::ButtonDown, EventKind::ButtonDown)
                | (EventFilterKind::ButtonUp, EventKind::ButtonUp)
                | (EventFilterKind::ButtonClicked, EventKind::ButtonClicked { .. })
                | (
                    EventFilterKind::ButtonLongPress,
                    EventKind::ButtonLongPress { .. }
                )
                | (EventFilterKind::Error, EventKind::Error)
        )
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    program: String,
    kind: EventFilterKind,
}

/// Routes incoming events into per-program FIFO queues.
#[derive(Debug, Default)]
pub struct EventRouter {
    subscriptions: HashMap<Address, Vec<Subscription>>,
    queues: HashMap<String, VecDeque<Event>>,
}

impl EventRouter {
    /// Create an empty router.
    pub fn new() -> EventRouter {
        EventRouter::default()
    }

    /// Register a program's interest in one event kind on one address.
    pub fn subscribe(&mut self, program: &str, address: Address, kind: EventFilterKind) {
        self.subscriptions
            .entry(address)
            .or_default()
            .push(Subscription {
                program: program.to_string(),
                kind,
            });
        self.queues.entry(program.to_string()).or_default();
    }

    /// Route one event; returns the number of program queues it landed in.
    ///
    /// An event is enqueued at most once per program even when several of the
    /// program's subscriptions match it.
    pub fn route(&mut self, event: &Event) -> usize {
        let Some(subs) = self.subscriptions.get(&event.address) else {
            return 0;
        };

        let mut delivered = 0;
        let mut last_program: Option<&str> = None;
        for sub in subs {
            if !sub.kind.matches(&event.kind) {
                continue;
            }
            // Subscriptions are grouped by program at registration time, so a
            // same-program duplicate is always adjacent.
            if last_program == Some(sub.program.as_str()) {
                continue;
            }
            last_program = Some(sub.program.as_str());
            if let Some(queue) = self.queues.get_mut(&sub.program) {
                queue.push_back(event.clone());
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of events waiting for a program.
    pub fn pending(&self, program: &str) -> usize {
        self.queues.get(program).map(VecDeque::len).unwrap_or(0)
    }

    /// Take all queued events for a program, in enqueue order.
    pub fn drain(&mut self, program: &str) -> Vec<Event> {
        self.queues
            .get_mut(program)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Drop all queued events for a program without dispatch.
    pub fn clear(&mut self, program: &str) {
        if let Some(queue) = self.queues.get_mut(program) {
            queue.clear();
        }
    }

    /// Total queued events across all programs.
    pub fn total_pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn click(address: Address, duration: f64) -> Event {
        Event {
            address,
            kind: EventKind::ButtonClicked { duration },
        }
    }

    #[test]
    fn test_routing_respects_kind_and_address() {
        let mut router = EventRouter::new();
        router.subscribe("a", 17, EventFilterKind::ButtonClicked);
        router.subscribe("b", 17, EventFilterKind::Update);

        assert_eq!(router.route(&click(17, 0.2)), 1);
        assert_eq!(router.route(&click(18, 0.2)), 0);
        assert_eq!(
            router.route(&Event {
                address: 17,
                kind: EventKind::Update { value: 9 }
            }),
            1
        );

        assert_eq!(router.pending("a"), 1);
        assert_eq!(router.pending("b"), 1);
    }

    #[test]
    fn test_fifo_order_per_program() {
        let mut router = EventRouter::new();
        router.subscribe("a", 17, EventFilterKind::ButtonClicked);

        router.route(&click(17, 0.1));
        router.route(&click(17, 0.2));
        router.route(&click(17, 0.3));

        let drained = router.drain("a");
        let durations: Vec<f64> = drained
            .iter()
            .map(|e| match e.kind {
                EventKind::ButtonClicked { duration } => duration,
                _ => panic!("unexpected kind"),
            })
            .collect();
        assert_eq!(durations, vec![0.1, 0.2, 0.3]);
        assert_eq!(router.pending("a"), 0);
    }

    #[test]
    fn test_duplicate_subscription_enqueues_once() {
        let mut router = EventRouter::new();
        router.subscribe("a", 17, EventFilterKind::ButtonClicked);
        router.subscribe("a", 17, EventFilterKind::ButtonClicked);

        assert_eq!(router.route(&click(17, 0.5)), 1);
        assert_eq!(router.pending("a"), 1);
    }

    #[test]
    fn test_clear_discards_without_dispatch() {
        let mut router = EventRouter::new();
        router.subscribe("a", 17, EventFilterKind::ButtonClicked);
        router.route(&click(17, 0.5));

        router.clear("a");
        assert_eq!(router.pending("a"), 0);
        assert!(router.drain("a").is_empty());
    }

    #[test]
    fn test_legacy_change_kind_accepted() {
        let event: Event =
            serde_json::from_str(r#"{"address": 3, "kind": "change", "value": 77}"#).unwrap();
        assert_eq!(event.kind, EventKind::Update { value: 77 });

        // The canonical name round-trips; the legacy one is input-only.
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"update\""));
    }
}
