//! Wire types for the two JSON boundaries this workspace crosses: the
//! inbound router message (SPEC_FULL §6 "Inbound router message shape") and
//! the bridge frame protocol (SPEC_FULL §6 "Bridge protocol").

use serde::{Deserialize, Serialize};

use crate::types::JsonValue;

/// `{type: <string>, sessionId?: <string>, ...}` — the router's single
/// inbound shape. Extra fields live in `params` via `#[serde(flatten)]` so
/// each component can deserialize its own params struct from the same frame.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub params: JsonValue,
}

/// Bridge request frame: `{id, type:"invoke", tool, args, sessionId,
/// parentSessionId, agentId}`.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeInvokeFrame {
    pub id: String,
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub tool: String,
    pub args: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl BridgeInvokeFrame {
    pub fn new(id: impl Into<String>, tool: impl Into<String>, args: JsonValue) -> Self {
        Self {
            id: id.into(),
            frame_type: "invoke",
            tool: tool.into(),
            args,
            session_id: None,
            parent_session_id: None,
            agent_id: None,
        }
    }
}

/// Bridge error detail: `{code, message, details}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

/// Bridge reply frame: either `{id, ok:true, ...}`, `{id, ok:false,
/// error}`, or an out-of-band `{type:"event", ...}` push.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BridgeReplyFrame {
    Invoke {
        id: String,
        ok: bool,
        #[serde(default)]
        error: Option<BridgeErrorDetail>,
        #[serde(flatten)]
        data: JsonValue,
    },
    Event {
        #[serde(rename = "type")]
        frame_type: String,
        #[serde(flatten)]
        payload: JsonValue,
    },
}

/// Known bridge tool names (SPEC_FULL §6). Not exhaustive — the bridge may
/// register others — but these four are normative.
pub mod bridge_tools {
    pub const BASH: &str = "bash";
    pub const READ: &str = "read";
    pub const WRITE: &str = "write";
    pub const EDIT: &str = "edit";
}

/// The runtime event stream (SPEC_FULL §6 Events). Carried both as a
/// `tracing` record and, where a session subscriber exists, as a published
/// `RuntimeEvent`.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeEvent {
    pub name: &'static str,
    pub session_id: Option<String>,
    pub data: JsonValue,
}

impl RuntimeEvent {
    pub fn new(name: &'static str, session_id: Option<String>, data: JsonValue) -> Self {
        Self {
            name,
            session_id,
            data,
        }
    }
}

pub mod event_names {
    pub const LOOP_START: &str = "loop_start";
    pub const LOOP_DONE: &str = "loop_done";
    pub const LOOP_ERROR: &str = "loop_error";
    pub const LOOP_NO_PROGRESS: &str = "loop_no_progress";
    pub const LOOP_RESTART: &str = "loop_restart";
    pub const LOOP_SKIP_STOPPED: &str = "loop_skip_stopped";

    pub const STEP_PLANNED: &str = "step_planned";
    pub const STEP_EXECUTE: &str = "step_execute";
    pub const STEP_EXECUTE_RESULT: &str = "step_execute_result";
    pub const STEP_FINISHED: &str = "step_finished";

    pub const LLM_REQUEST: &str = "llm.request";
    pub const LLM_STREAM_START: &str = "llm.stream.start";
    pub const LLM_STREAM_DELTA: &str = "llm.stream.delta";
    pub const LLM_STREAM_END: &str = "llm.stream.end";
    pub const LLM_RESPONSE_RAW: &str = "llm.response.raw";
    pub const LLM_RESPONSE_PARSED: &str = "llm.response.parsed";
    pub const LLM_ROUTE_SELECTED: &str = "llm.route.selected";
    pub const LLM_ROUTE_ESCALATED: &str = "llm.route.escalated";
    pub const LLM_ROUTE_BLOCKED: &str = "llm.route.blocked";
    pub const LLM_SKIPPED: &str = "llm.skipped";

    pub const AUTO_RETRY_START: &str = "auto_retry_start";
    pub const AUTO_RETRY_END: &str = "auto_retry_end";
    pub const RETRY_CIRCUIT_OPEN: &str = "retry_circuit_open";
    pub const RETRY_BUDGET_EXHAUSTED: &str = "retry_budget_exhausted";

    pub const INPUT_USER: &str = "input.user";
    pub const INPUT_STEER: &str = "input.steer";
    pub const INPUT_REGENERATE: &str = "input.regenerate";
    pub const INPUT_SHARED_TABS: &str = "input.shared_tabs";
    pub const INPUT_TAB_IDS_INFERRED: &str = "input.tab_ids_inferred";

    pub const MESSAGE_QUEUED: &str = "message.queued";
    pub const MESSAGE_DEQUEUED: &str = "message.dequeued";

    pub const BRIDGE_STATUS: &str = "bridge.status";
    pub const BRIDGE_EVENT: &str = "bridge.event";
}
