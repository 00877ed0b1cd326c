//! No-progress detector (SPEC_FULL §4.4 step 5): a ring buffer of tool-call
//! signatures flags repeated or ping-pong (ABAB) tool-call patterns.

use std::collections::VecDeque;

const RING_CAPACITY: usize = 8;
const REPEAT_THRESHOLD: usize = 3;
const PING_PONG_THRESHOLD: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoProgressReason {
    Repeat,
    PingPong,
}

/// Canonicalize a tool call into a comparable signature: tool name plus its
/// JSON arguments serialized with sorted keys (so key order never causes a
/// false negative).
pub fn signature(tool_name: &str, args: &serde_json::Value) -> String {
    let canonical = canonicalize(args);
    format!("{tool_name}:{canonical}")
}

fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            let parts: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{k}:{}", canonicalize(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

pub struct NoProgressDetector {
    ring: VecDeque<String>,
    /// Whether a repair hint has already been pushed for the current
    /// streak; one more trigger after that stops the loop.
    repaired_once: bool,
}

impl Default for NoProgressDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl NoProgressDetector {
    pub fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(RING_CAPACITY),
            repaired_once: false,
        }
    }

    pub fn record(&mut self, signatures: &[String]) {
        for sig in signatures {
            if self.ring.len() == RING_CAPACITY {
                self.ring.pop_front();
            }
            self.ring.push_back(sig.clone());
        }
    }

    /// Returns `Some(reason)` the first time a pattern is detected since the
    /// last reset; on a second consecutive detection, callers should stop
    /// the loop with `progress_uncertain` instead of repairing again.
    pub fn check(&self) -> Option<NoProgressReason> {
        if self.repeated_run() {
            return Some(NoProgressReason::Repeat);
        }
        if self.ping_pong() {
            return Some(NoProgressReason::PingPong);
        }
        None
    }

    pub fn mark_repaired(&mut self) {
        self.repaired_once = true;
    }

    pub fn has_repaired_once(&self) -> bool {
        self.repaired_once
    }

    pub fn reset(&mut self) {
        self.ring.clear();
        self.repaired_once = false;
    }

    fn repeated_run(&self) -> bool {
        let len = self.ring.len();
        if len < REPEAT_THRESHOLD {
            return false;
        }
        let last = &self.ring[len - 1];
        (1..REPEAT_THRESHOLD).all(|i| &self.ring[len - 1 - i] == last)
    }

    /// ABAB pattern repeated `PING_PONG_THRESHOLD` times: the last
    /// `2 * 2 * PING_PONG_THRESHOLD` signatures alternate between exactly
    /// two distinct values.
    fn ping_pong(&self) -> bool {
        let window = PING_PONG_THRESHOLD * 4;
        let len = self.ring.len();
        if len < window {
            return false;
        }
        let slice: Vec<&String> = self.ring.iter().skip(len - window).collect();
        let a = slice[0];
        let b = slice[1];
        if a == b {
            return false;
        }
        slice.iter().enumerate().all(|(i, sig)| {
            if i % 2 == 0 {
                *sig == a
            } else {
                *sig == b
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_three_repeats() {
        let mut d = NoProgressDetector::new();
        d.record(&["click:x".to_string(); 3]);
        assert_eq!(d.check(), Some(NoProgressReason::Repeat));
    }

    #[test]
    fn does_not_trigger_on_two_repeats() {
        let mut d = NoProgressDetector::new();
        d.record(&["click:x".to_string(); 2]);
        assert_eq!(d.check(), None);
    }

    #[test]
    fn detects_ping_pong_abab() {
        let mut d = NoProgressDetector::new();
        d.record(&[
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
            "b".to_string(),
        ]);
        assert_eq!(d.check(), Some(NoProgressReason::PingPong));
    }

    #[test]
    fn signature_ignores_key_order() {
        let a = signature("click", &serde_json::json!({"x": 1, "y": 2}));
        let b = signature("click", &serde_json::json!({"y": 2, "x": 1}));
        assert_eq!(a, b);
    }
}
