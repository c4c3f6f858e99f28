// src/events.rs
//
// Confirmed business events and the sink boundary they are handed to.
// Delivery is fire-and-forget: a failing sink is logged and never feeds
// back into counting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::types::{CounterAction, PersonId};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterEvent {
    Zone {
        camera_id: String,
        zone: String,
        person_id: PersonId,
        action: CounterAction,
        time: DateTime<Utc>,
    },
    Line {
        camera_id: String,
        line: String,
        person_id: PersonId,
        action: CounterAction,
        time: DateTime<Utc>,
    },
}

pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &CounterEvent) -> anyhow::Result<()>;
}

/// Default sink: structured log lines, one per confirmed transition.
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn deliver(&self, event: &CounterEvent) -> anyhow::Result<()> {
        match event {
            CounterEvent::Zone {
                camera_id,
                zone,
                person_id,
                action,
                ..
            } => info!(camera = %camera_id, zone = %zone, person = %person_id, "zone event: {}", action.as_str()),
            CounterEvent::Line {
                camera_id,
                line,
                person_id,
                action,
                ..
            } => info!(camera = %camera_id, line = %line, person = %person_id, "line event: {}", action.as_str()),
        }
        Ok(())
    }
}

/// Forward a batch to the sink, logging failures without propagating them.
pub fn forward_events(sink: &dyn EventSink, events: &[CounterEvent]) {
    for event in events {
        if let Err(err) = sink.deliver(event) {
            warn!("event delivery failed (counts unaffected): {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingSink {
        attempts: AtomicUsize,
    }

    impl EventSink for FailingSink {
        fn deliver(&self, _event: &CounterEvent) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("broker unreachable")
        }
    }

    #[test]
    fn sink_failure_is_swallowed_per_event() {
        let sink = FailingSink {
            attempts: AtomicUsize::new(0),
        };
        let events = vec![
            CounterEvent::Zone {
                camera_id: "camera1".into(),
                zone: "entrance".into(),
                person_id: PersonId::Num(1),
                action: CounterAction::Entered,
                time: Utc::now(),
            },
            CounterEvent::Line {
                camera_id: "camera1".into(),
                line: "doorway".into(),
                person_id: PersonId::Num(2),
                action: CounterAction::Out,
                time: Utc::now(),
            },
        ];
        forward_events(&sink, &events);
        // Every event was attempted despite the first failing.
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zone_event_serializes_with_kind_tag() {
        let event = CounterEvent::Zone {
            camera_id: "camera1".into(),
            zone: "entrance".into(),
            person_id: PersonId::Num(7),
            action: CounterAction::Entered,
            time: "2026-01-15T12:00:00Z".parse().unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "zone");
        assert_eq!(json["action"], "Entered");
        assert_eq!(json["person_id"], 7);
    }
}
