//! Router-level hook points (SPEC_FULL §4.5 `runtime.route.before/after/error`),
//! grounded on the same before/after shape `tabline_llm::LlmHook` uses one
//! layer down. A hook may block a message outright or rewrite it before
//! dispatch; after dispatch it only observes.

use tabline_core::{InboundMessage, JsonValue, RuntimeError};

pub enum RouteHookOutcome {
    Allow(InboundMessage),
    Block(RuntimeError),
}

pub trait RouteHook: Send + Sync {
    fn before_route(&self, msg: InboundMessage) -> RouteHookOutcome {
        RouteHookOutcome::Allow(msg)
    }

    fn after_route(&self, _msg_type: &str, _result: &JsonValue) {}

    fn on_error(&self, _msg_type: &str, _error: &RuntimeError) {}
}

#[derive(Default)]
pub struct NoopRouteHook;

impl RouteHook for NoopRouteHook {}
