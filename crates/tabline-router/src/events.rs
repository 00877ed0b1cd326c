//! The per-session step event buffer and live broadcast hub (SPEC_FULL §4.5
//! `brain.step.stream`, §6 Events).
//!
//! Every `RuntimeEvent` the agent loop emits passes through here: it is
//! appended to a bounded per-session ring buffer (read back by
//! `brain.step.stream`) and, if anyone is listening, pushed onto that
//! session's broadcast channel for a live WebSocket subscriber.

use std::collections::VecDeque;

use dashmap::DashMap;
use tabline_core::{JsonValue, RuntimeEvent, SessionId};
use tokio::sync::broadcast;

const DEFAULT_MAX_EVENTS: usize = 240;
const DEFAULT_MAX_BYTES: usize = 256 * 1024;
const HARD_MAX_EVENTS: usize = 5_000;
const HARD_MAX_BYTES: usize = 4 * 1024 * 1024;

fn event_to_json(event: &RuntimeEvent) -> JsonValue {
    serde_json::json!({
        "name": event.name,
        "sessionId": event.session_id,
        "data": event.data,
    })
}

pub struct EventHub {
    buffers: DashMap<SessionId, VecDeque<JsonValue>>,
    broadcasters: DashMap<SessionId, broadcast::Sender<RuntimeEvent>>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            buffers: DashMap::new(),
            broadcasters: DashMap::new(),
        }
    }

    /// Record an event into its session's ring buffer and fan it out to any
    /// live subscriber. Events carrying no `session_id` (none currently do,
    /// but the field is optional) are dropped — there is nowhere to buffer
    /// them.
    pub fn publish(&self, event: RuntimeEvent) {
        let Some(session_id) = event.session_id.clone() else {
            return;
        };
        let key = SessionId::new(session_id);
        let value = event_to_json(&event);
        {
            let mut buf = self.buffers.entry(key.clone()).or_default();
            buf.push_back(value);
            while buf.len() > HARD_MAX_EVENTS {
                buf.pop_front();
            }
        }
        if let Some(tx) = self.broadcasters.get(&key) {
            let _ = tx.send(event);
        }
    }

    /// Replay the buffered events for a session, most-recent-first internally
    /// but returned oldest-first, clamped to `max_events`/`max_bytes` (each
    /// further clamped to the hard caps regardless of what the caller asks
    /// for).
    pub fn read_buffer(
        &self,
        session_id: &SessionId,
        max_events: Option<usize>,
        max_bytes: Option<usize>,
    ) -> Vec<JsonValue> {
        let max_events = max_events.unwrap_or(DEFAULT_MAX_EVENTS).clamp(1, HARD_MAX_EVENTS);
        let max_bytes = max_bytes.unwrap_or(DEFAULT_MAX_BYTES).clamp(1, HARD_MAX_BYTES);

        let Some(buf) = self.buffers.get(session_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut bytes = 0usize;
        for value in buf.iter().rev() {
            let len = value.to_string().len();
            if out.len() >= max_events || (bytes + len > max_bytes && !out.is_empty()) {
                break;
            }
            bytes += len;
            out.push(value.clone());
        }
        out.reverse();
        out
    }

    pub fn subscribe(&self, session_id: &SessionId) -> broadcast::Receiver<RuntimeEvent> {
        self.broadcasters
            .entry(session_id.clone())
            .or_insert_with(|| broadcast::channel(1024).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_read_roundtrips_in_order() {
        let hub = EventHub::new();
        let session_id = SessionId::new("s1");
        hub.publish(RuntimeEvent::new("loop_start", Some("s1".into()), serde_json::json!({})));
        hub.publish(RuntimeEvent::new("loop_done", Some("s1".into()), serde_json::json!({"status":"done"})));

        let events = hub.read_buffer(&session_id, None, None);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["name"], "loop_start");
        assert_eq!(events[1]["name"], "loop_done");
    }

    #[test]
    fn read_buffer_respects_max_events() {
        let hub = EventHub::new();
        let session_id = SessionId::new("s1");
        for i in 0..5 {
            hub.publish(RuntimeEvent::new(
                "step_finished",
                Some("s1".into()),
                serde_json::json!({ "i": i }),
            ));
        }
        let events = hub.read_buffer(&session_id, Some(2), None);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["data"]["i"], 3);
        assert_eq!(events[1]["data"]["i"], 4);
    }

    #[test]
    fn unknown_session_returns_empty() {
        let hub = EventHub::new();
        assert!(hub.read_buffer(&SessionId::new("missing"), None, None).is_empty());
    }
}
