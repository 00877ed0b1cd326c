//! Before-request/after-response hook points (SPEC_FULL §4.3 steps 2 and 5).
//!
//! Hooks operate on the raw JSON body, the one narrow boundary where
//! `serde_json::Value` is allowed to live (SPEC_FULL §9 design note) — they
//! may patch it, but the patch must still deserialize back into the typed
//! request/response shape.

use tabline_core::JsonValue;

pub enum HookOutcome {
    Allow(JsonValue),
    Block(String),
    InvalidPatch(String),
}

pub trait LlmHook: Send + Sync {
    fn before_request(&self, url: &str, body: JsonValue) -> HookOutcome {
        let _ = url;
        HookOutcome::Allow(body)
    }
    fn after_response(&self, body: JsonValue) -> HookOutcome {
        HookOutcome::Allow(body)
    }
}

/// Default hook: passes everything through unchanged.
pub struct NoopHook;
impl LlmHook for NoopHook {}
