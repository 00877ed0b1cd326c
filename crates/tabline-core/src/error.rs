//! The error envelope shared by C1-C5.
//!
//! Every fallible boundary in this workspace returns `RuntimeError` instead of
//! a bespoke error type, so a failure can cross the bridge/LLM/CDP/router
//! boundaries and still carry `{code, message, details, retryable, status}`
//! unchanged, per the error-kind table this type is built from.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A carrier code from the error-kind table. Kept as a `String` newtype
/// rather than an enum because bridge/LLM peers may emit codes this crate
/// does not special-case (e.g. a bridge tool's own validation code) — those
/// still need to round-trip through the envelope unchanged.
pub type ErrorCode = String;

#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{message}")]
pub struct RuntimeError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl RuntimeError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable,
            status: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    // --- Transient transport (retryable) ---
    pub fn busy(message: impl Into<String>) -> Self {
        Self::new("E_BUSY", message, true)
    }
    pub fn bridge_disconnected(message: impl Into<String>) -> Self {
        Self::new("E_BRIDGE_DISCONNECTED", message, true)
    }
    pub fn bridge_aborted(message: impl Into<String>) -> Self {
        Self::new("E_BRIDGE_ABORTED", message, true)
    }
    pub fn bridge_interrupted(message: impl Into<String>) -> Self {
        Self::new("E_BRIDGE_INTERRUPTED", message, false)
    }

    // --- Client timeout (retryable) ---
    pub fn client_timeout(message: impl Into<String>) -> Self {
        Self::new("E_CLIENT_TIMEOUT", message, true)
    }
    pub fn cdp_timeout(message: impl Into<String>) -> Self {
        Self::new("E_CDP_TIMEOUT", message, true)
    }
    pub fn llm_timeout(message: impl Into<String>) -> Self {
        Self::new("E_LLM_TIMEOUT", message, true)
    }
    pub fn bridge_timeout(message: impl Into<String>) -> Self {
        Self::new("E_TIMEOUT", message, true)
    }

    // --- Resource missing (retryable / re-plan) ---
    pub fn no_tab(message: impl Into<String>) -> Self {
        Self::new("E_NO_TAB", message, true)
    }
    pub fn axtree_empty(message: impl Into<String>) -> Self {
        Self::new("E_CDP_AXTREE_EMPTY", message, true)
    }
    pub fn cdp_attach(message: impl Into<String>) -> Self {
        Self::new("E_CDP_ATTACH", message, true)
    }
    pub fn cdp_resolve_node(message: impl Into<String>) -> Self {
        Self::new("E_CDP_RESOLVE_NODE", message, true)
    }
    pub fn cdp_aborted(message: impl Into<String>) -> Self {
        Self::new("E_CDP_ABORTED", message, true)
    }

    // --- Verification (retryable / re-plan) ---
    pub fn verify_failed(message: impl Into<String>) -> Self {
        Self::new("E_VERIFY_FAILED", message, true)
    }

    // --- Validation / arguments (non-retryable) ---
    pub fn args(message: impl Into<String>) -> Self {
        Self::new("E_ARGS", message, false)
    }
    pub fn tool(message: impl Into<String>) -> Self {
        Self::new("E_TOOL", message, false)
    }
    pub fn tool_unsupported(message: impl Into<String>) -> Self {
        Self::new("E_TOOL_UNSUPPORTED", message, false)
    }

    // --- Policy (non-retryable) ---
    pub fn llm_hook_blocked(message: impl Into<String>) -> Self {
        Self::new("E_LLM_HOOK_BLOCKED", message, false)
    }
    pub fn llm_hook_invalid_patch(message: impl Into<String>) -> Self {
        Self::new("E_LLM_HOOK_INVALID_PATCH", message, false)
    }
    pub fn llm_retry_delay_exceeded(message: impl Into<String>) -> Self {
        Self::new("E_LLM_RETRY_DELAY_EXCEEDED", message, false)
    }

    // --- Fatal internal (non-retryable) ---
    pub fn infra_unsupported(message: impl Into<String>) -> Self {
        Self::new("E_INFRA_UNSUPPORTED", message, false)
    }
    pub fn tool_plan(message: impl Into<String>) -> Self {
        Self::new("E_TOOL_PLAN", message, false)
    }
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("E_INTERNAL", message, false)
    }
    pub fn method_not_found(method: &str) -> Self {
        Self::new("E_METHOD_NOT_FOUND", format!("method not found: {method}"), false)
    }
    pub fn session_not_found(id: &str) -> Self {
        Self::new("E_SESSION_NOT_FOUND", format!("session not found: {id}"), false)
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        Self::args(format!("invalid JSON: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// `{ok:true,data} | {ok:false,error,...}` envelope, serialized flat so it
/// matches the wire shape in SPEC_FULL §6 exactly.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Envelope<T: Serialize> {
    Ok { ok: bool, data: T },
    Err { ok: bool, error: RuntimeError },
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Envelope::Ok { ok: true, data }
    }
}

impl<T: Serialize> From<Result<T>> for Envelope<T> {
    fn from(r: Result<T>) -> Self {
        match r {
            Ok(data) => Envelope::Ok { ok: true, data },
            Err(error) => Envelope::Err { ok: false, error },
        }
    }
}
