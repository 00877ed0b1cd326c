//! The agent loop controller (SPEC_FULL §4.4): one state machine per
//! session that drives LLM turns and tool dispatch to a terminal status,
//! then dequeues a follow-up prompt if one is waiting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use tabline_core::{
    event_names, CompactionReason, Config, Entry, EntryBody, JsonValue, LlmRoute, Result, Role,
    RuntimeError, RuntimeEvent, SessionId, SessionStore,
};
use tabline_compaction::{
    compact, history_summary_prompt, prepare_compaction, should_compact, turn_prefix_summary_prompt,
    ShouldCompactReason,
};
use tabline_llm::{request_llm_with_retry, LlmHook, LlmMessage, LlmProvider, LlmTool, ToolCall, ToolChoice};

use crate::progress::{signature, NoProgressDetector, NoProgressReason};
use crate::queue::PromptQueue;
use crate::retry::{
    auto_replay_delay, classify_tool_failure, CircuitOutcome, RetryAction, RetryBudget,
    AUTO_REPLAY_MAX_EXTRA_ATTEMPTS,
};
use crate::state::SessionRunState;
use crate::tools::{is_browser_tool, is_side_effecting, ToolDispatcher};

const PAUSE_POLL_MS: u64 = 120;
const MAX_CONSECUTIVE_NUDGES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalStatus {
    Done,
    MaxSteps,
    ProgressUncertain,
    Stopped,
    FailedExecute,
    FailedVerify,
}

impl FinalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalStatus::Done => "done",
            FinalStatus::MaxSteps => "max_steps",
            FinalStatus::ProgressUncertain => "progress_uncertain",
            FinalStatus::Stopped => "stopped",
            FinalStatus::FailedExecute => "failed_execute",
            FinalStatus::FailedVerify => "failed_verify",
        }
    }
}

pub struct LoopOutcome {
    pub status: FinalStatus,
    pub llm_steps: u32,
    pub tool_steps: u32,
}

/// The slice of per-session state a router handler (steer/pause/resume/stop)
/// mutates directly, kept separate from `SessionLoopState` so a control
/// message can take effect while a loop is mid-run rather than waiting for
/// it to finish (SPEC_FULL §5 "Cancellation"). Wrapped in a lock and shared
/// between the running loop task and whichever task handles the control
/// message; critical sections are brief field reads/writes, never an await
/// on network or LLM I/O, so contention is negligible.
pub struct SessionControl {
    pub run_state: SessionRunState,
    pub queue: PromptQueue,
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionControl {
    pub fn new() -> Self {
        Self {
            run_state: SessionRunState::new(),
            queue: PromptQueue::new(),
        }
    }
}

/// Per-session mutable loop state: a shared handle to the control flags plus
/// the run-local bookkeeping (`progress`, `retry_budget`, `route`) only the
/// running loop task touches. A fresh `SessionLoopState` is built for each
/// `brain.run.start`, but `control` is typically the same shared handle kept
/// alive across runs so queued prompts and a pending `stop` survive a run
/// boundary.
pub struct SessionLoopState {
    pub control: Arc<AsyncMutex<SessionControl>>,
    pub progress: NoProgressDetector,
    pub retry_budget: RetryBudget,
    pub route: LlmRoute,
    /// Whether this session's task requires at least one successful
    /// `snapshot`/`browser_action`/`browser_verify` call before the loop may
    /// end with no tool calls (SPEC_FULL §4.4 step 6).
    pub requires_browser_proof: bool,
    browser_proof_satisfied: bool,
    consecutive_nudges: u32,
}

impl SessionLoopState {
    pub fn new(route: LlmRoute, requires_browser_proof: bool) -> Self {
        Self::with_control(route, requires_browser_proof, Arc::new(AsyncMutex::new(SessionControl::new())))
    }

    pub fn with_control(
        route: LlmRoute,
        requires_browser_proof: bool,
        control: Arc<AsyncMutex<SessionControl>>,
    ) -> Self {
        Self {
            control,
            progress: NoProgressDetector::new(),
            retry_budget: RetryBudget::new(),
            route,
            requires_browser_proof,
            browser_proof_satisfied: false,
            consecutive_nudges: 0,
        }
    }

    pub fn control_handle(&self) -> Arc<AsyncMutex<SessionControl>> {
        self.control.clone()
    }
}

/// Read-only collaborators the loop needs for one run. Borrowed, not owned,
/// so a caller can share one `SessionStore`/`InfraHandler`/provider across
/// every session's loop.
pub struct LoopDeps<'a> {
    pub store: &'a dyn SessionStore,
    pub provider: &'a dyn LlmProvider,
    pub hook: &'a dyn LlmHook,
    pub dispatcher: &'a ToolDispatcher,
    pub emit: &'a (dyn Fn(RuntimeEvent) + Sync),
}

/// Run one full loop to completion (possibly many LLM turns), then, if a
/// `followUp` prompt is queued and the session was not stopped, recursively
/// continue with it (SPEC_FULL §4.4 termination).
pub fn run_loop<'a>(
    deps: &'a LoopDeps<'a>,
    session_id: &'a SessionId,
    state: &'a mut SessionLoopState,
    config: &'a Config,
    owner: &'a str,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<LoopOutcome>> + Send + 'a>> {
    Box::pin(async move {
        state.control.lock().await.run_state.set_running(true);
        deps.emit(RuntimeEvent::new(
            event_names::LOOP_START,
            Some(session_id.to_string()),
            serde_json::json!({}),
        ));

        let mut llm_steps = 0u32;
        let mut tool_steps = 0u32;
        let status = run_steps(deps, session_id, state, config, owner, &mut llm_steps, &mut tool_steps).await?;

        let (stopped, next) = {
            let mut control = state.control.lock().await;
            control.run_state.set_running(false);
            let stopped = control.run_state.is_stopped();
            let next = if stopped { None } else { control.queue.pop_follow_up() };
            (stopped, next)
        };
        deps.emit(RuntimeEvent::new(
            event_names::LOOP_DONE,
            Some(session_id.to_string()),
            serde_json::json!({
                "status": status.as_str(),
                "llmSteps": llm_steps,
                "toolSteps": tool_steps,
            }),
        ));

        if !stopped {
            if let Some(next) = next {
                deps.emit(RuntimeEvent::new(
                    event_names::MESSAGE_DEQUEUED,
                    Some(session_id.to_string()),
                    serde_json::json!({ "behavior": "follow_up" }),
                ));
                deps.store.append_entry(
                    session_id,
                    EntryBody::Message {
                        role: Role::User,
                        text: next,
                        tool_name: None,
                        tool_call_id: None,
                    },
                )?;
                state.progress.reset();
                state.consecutive_nudges = 0;
                state.browser_proof_satisfied = false;
                return run_loop(deps, session_id, state, config, owner).await;
            }
        }

        Ok(LoopOutcome { status, llm_steps, tool_steps })
    })
}

enum DispatchOutcome {
    Success,
    Recoverable,
    CircuitOpen(FinalStatus),
}

async fn run_steps(
    deps: &LoopDeps<'_>,
    session_id: &SessionId,
    state: &mut SessionLoopState,
    config: &Config,
    owner: &str,
    llm_steps: &mut u32,
    tool_steps: &mut u32,
) -> Result<FinalStatus> {
    loop {
        // 1. Stop/pause check.
        if state.control.lock().await.run_state.is_stopped() {
            deps.emit(RuntimeEvent::new(
                event_names::LOOP_SKIP_STOPPED,
                Some(session_id.to_string()),
                serde_json::json!({}),
            ));
            return Ok(FinalStatus::Stopped);
        }
        while state.control.lock().await.run_state.is_paused() {
            tokio::time::sleep(Duration::from_millis(PAUSE_POLL_MS)).await;
            if state.control.lock().await.run_state.is_stopped() {
                deps.emit(RuntimeEvent::new(
                    event_names::LOOP_SKIP_STOPPED,
                    Some(session_id.to_string()),
                    serde_json::json!({}),
                ));
                return Ok(FinalStatus::Stopped);
            }
        }

        // 11. Cap, checked before starting a fresh LLM turn.
        if *llm_steps >= config.max_steps {
            if state.requires_browser_proof && !state.browser_proof_satisfied {
                return Ok(FinalStatus::ProgressUncertain);
            }
            return Ok(FinalStatus::MaxSteps);
        }

        // 2. Steer drain.
        let steers = state.control.lock().await.queue.drain_steer();
        if !steers.is_empty() {
            for text in steers {
                deps.emit(RuntimeEvent::new(
                    event_names::MESSAGE_DEQUEUED,
                    Some(session_id.to_string()),
                    serde_json::json!({ "behavior": "steer" }),
                ));
                deps.store.append_entry(
                    session_id,
                    EntryBody::Message {
                        role: Role::User,
                        text,
                        tool_name: None,
                        tool_call_id: None,
                    },
                )?;
            }
            deps.dispatcher.abort_pending("steer prompt preempted in-flight tool calls");
        }

        // 3. Progress note.
        let retry = state.control.lock().await.run_state.inner().retry.clone();
        let progress_text = format!(
            "step {}/{} | tool_steps_done={} | retry active={} attempt={}/{} delay_ms={}",
            *llm_steps + 1,
            config.max_steps,
            tool_steps,
            retry.active,
            retry.attempt,
            retry.max_attempts,
            retry.delay_ms,
        );
        deps.store.append_entry(
            session_id,
            EntryBody::Message {
                role: Role::System,
                text: progress_text,
                tool_name: None,
                tool_call_id: None,
            },
        )?;

        // 3.5 Pre-turn compaction check (SPEC_FULL §4.2: C5 asks the
        // Compaction Engine whether to pre-compact before starting the
        // Loop).
        let branch = maybe_compact(deps, session_id, config, &state.route).await?;

        // 4. LLM turn.
        let messages = to_llm_messages(&branch, config.llm_system_prompt_custom.as_deref());
        let outcome = request_llm_with_retry(
            deps.provider,
            deps.hook,
            session_id.as_str(),
            &state.route,
            messages,
            Some(default_tools()),
            Some(ToolChoice::Auto),
            config.llm_retry_max_attempts,
            config.llm_max_retry_delay_ms as u64,
            config.llm_timeout_ms as u64,
            deps.emit,
        )
        .await;

        let outcome = match outcome {
            Ok(o) => o,
            Err(err) => {
                if err.retryable {
                    if state.route.escalate() {
                        deps.emit(RuntimeEvent::new(
                            event_names::LLM_ROUTE_ESCALATED,
                            Some(session_id.to_string()),
                            serde_json::json!({ "profile": state.route.profile }),
                        ));
                        continue;
                    }
                    deps.emit(RuntimeEvent::new(
                        event_names::LLM_SKIPPED,
                        Some(session_id.to_string()),
                        serde_json::json!({ "reason": "no further profile to escalate to" }),
                    ));
                }
                deps.emit(RuntimeEvent::new(
                    event_names::LOOP_ERROR,
                    Some(session_id.to_string()),
                    serde_json::json!({ "code": err.code, "message": err.message }),
                ));
                return Err(err);
            }
        };
        *llm_steps += 1;

        // 6. Assistant write, when the model returned no tool calls.
        if outcome.tool_calls.is_empty() {
            if state.requires_browser_proof && !state.browser_proof_satisfied {
                state.consecutive_nudges += 1;
                if state.consecutive_nudges > MAX_CONSECUTIVE_NUDGES {
                    return Ok(FinalStatus::ProgressUncertain);
                }
                deps.store.append_entry(
                    session_id,
                    EntryBody::Message {
                        role: Role::Assistant,
                        text: outcome.text.clone(),
                        tool_name: None,
                        tool_call_id: None,
                    },
                )?;
                deps.store.append_entry(
                    session_id,
                    EntryBody::Message {
                        role: Role::System,
                        text: "This task requires verifying your work in the browser \
                               (snapshot, browser_action, or browser_verify) before you \
                               can finish."
                            .to_string(),
                        tool_name: None,
                        tool_call_id: None,
                    },
                )?;
                continue;
            }

            deps.store.append_entry(
                session_id,
                EntryBody::Message {
                    role: Role::Assistant,
                    text: outcome.text,
                    tool_name: None,
                    tool_call_id: None,
                },
            )?;
            return Ok(FinalStatus::Done);
        }
        state.consecutive_nudges = 0;

        // 5. No-progress detector.
        let sigs: Vec<String> = outcome
            .tool_calls
            .iter()
            .map(|tc| {
                let args: serde_json::Value =
                    serde_json::from_str(&tc.function.arguments).unwrap_or(serde_json::Value::Null);
                signature(&tc.function.name, &args)
            })
            .collect();
        state.progress.record(&sigs);
        if let Some(reason) = state.progress.check() {
            if state.progress.has_repaired_once() {
                deps.emit(RuntimeEvent::new(
                    event_names::LOOP_NO_PROGRESS,
                    Some(session_id.to_string()),
                    serde_json::json!({ "final": true }),
                ));
                return Ok(FinalStatus::ProgressUncertain);
            }
            state.progress.mark_repaired();
            let hint = match reason {
                NoProgressReason::Repeat => {
                    "You appear to be repeating the same tool call without making progress. \
                     Try a materially different approach."
                }
                NoProgressReason::PingPong => {
                    "You appear to be alternating between two actions without making \
                     progress. Try a materially different approach."
                }
            };
            deps.store.append_entry(
                session_id,
                EntryBody::Message {
                    role: Role::System,
                    text: hint.to_string(),
                    tool_name: None,
                    tool_call_id: None,
                },
            )?;
            deps.emit(RuntimeEvent::new(
                event_names::LOOP_NO_PROGRESS,
                Some(session_id.to_string()),
                serde_json::json!({ "final": false }),
            ));
            continue;
        }

        // Persist the assistant's tool-call turn so later reconstructions
        // of the message list can replay it verbatim.
        deps.store.append_entry(
            session_id,
            EntryBody::Custom {
                data: serde_json::json!({
                    "kind": "assistant_tool_calls",
                    "text": outcome.text,
                    "toolCalls": outcome.tool_calls,
                }),
            },
        )?;

        // 7-10. Tool dispatch, retry classification, and steer preemption.
        for tc in &outcome.tool_calls {
            if state.control.lock().await.queue.has_steer() {
                break;
            }
            let args: JsonValue = serde_json::from_str(&tc.function.arguments).unwrap_or(serde_json::json!({}));

            deps.emit(RuntimeEvent::new(
                event_names::STEP_PLANNED,
                Some(session_id.to_string()),
                serde_json::json!({ "tool": tc.function.name, "toolCallId": tc.id }),
            ));

            match dispatch_one(deps, session_id, state, owner, tc, &args).await? {
                DispatchOutcome::Success => {
                    *tool_steps += 1;
                    if is_browser_tool(&tc.function.name) {
                        state.browser_proof_satisfied = true;
                    }
                }
                DispatchOutcome::Recoverable => {
                    *tool_steps += 1;
                }
                DispatchOutcome::CircuitOpen(status) => {
                    deps.emit(RuntimeEvent::new(
                        event_names::RETRY_CIRCUIT_OPEN,
                        Some(session_id.to_string()),
                        serde_json::json!({ "tool": tc.function.name }),
                    ));
                    deps.emit(RuntimeEvent::new(
                        event_names::RETRY_BUDGET_EXHAUSTED,
                        Some(session_id.to_string()),
                        serde_json::json!({ "tool": tc.function.name }),
                    ));
                    return Ok(status);
                }
            }

            deps.emit(RuntimeEvent::new(
                event_names::STEP_FINISHED,
                Some(session_id.to_string()),
                serde_json::json!({ "tool": tc.function.name }),
            ));
        }
        // Back to step 1.
    }
}

/// Ask the compaction engine (C2) whether this branch is due for
/// pre-compaction, and if so, summarize the cut via the LLM and splice a
/// `compaction` entry in before returning the branch this turn's messages
/// should be built from. A no-op (returns the branch unchanged) when
/// compaction isn't due or there isn't enough history to cut.
///
/// `keep_recent_tokens` is derived from `config.compaction_max_tokens` the
/// same way this workspace's context manager derives its retention target
/// from a single configured ceiling: keep the most recent 75% of the budget
/// verbatim, summarize the rest.
async fn maybe_compact(
    deps: &LoopDeps<'_>,
    session_id: &SessionId,
    config: &Config,
    route: &LlmRoute,
) -> Result<Vec<Entry>> {
    let branch = deps.store.branch(session_id)?;
    let previous_summary = branch.iter().rev().find_map(|e| match &e.body {
        EntryBody::Compaction { summary, .. } => Some(summary.clone()),
        _ => None,
    });

    let threshold_tokens = config.compaction_max_tokens as u64;
    let decision = should_compact(false, &branch, previous_summary.as_deref(), threshold_tokens);
    if !decision.should_compact {
        return Ok(branch);
    }

    let keep_recent_tokens = (threshold_tokens as f64 * 0.75) as u64;
    let Some(prepared) = prepare_compaction(&branch, keep_recent_tokens, true) else {
        return Ok(branch);
    };

    let history_prompt =
        history_summary_prompt(&prepared.messages_to_summarize, previous_summary.as_deref(), None);
    let history_summary = summarize(deps, session_id, route, config, history_prompt).await?;

    let turn_prefix_summary = if prepared.is_split_turn {
        let prompt = turn_prefix_summary_prompt(&prepared.turn_prefix_messages);
        Some(summarize(deps, session_id, route, config, prompt).await?)
    } else {
        None
    };

    let reason = match decision.reason {
        Some(ShouldCompactReason::Overflow) => CompactionReason::Overflow,
        _ => CompactionReason::Threshold,
    };
    let outcome = compact(
        &prepared,
        previous_summary.as_deref(),
        &history_summary,
        turn_prefix_summary.as_deref(),
        reason,
    );
    deps.store.append_entry(session_id, outcome.body)?;

    deps.store.branch(session_id)
}

/// A minimal, tool-free LLM round trip used to generate a compaction
/// summary (no streaming progress events beyond what
/// `request_llm_with_retry` already emits — this is still "an LLM turn" as
/// far as SPEC_FULL §4.3 is concerned, just not one of the loop's own
/// numbered steps).
async fn summarize(
    deps: &LoopDeps<'_>,
    session_id: &SessionId,
    route: &LlmRoute,
    config: &Config,
    prompt: String,
) -> Result<String> {
    let outcome = request_llm_with_retry(
        deps.provider,
        deps.hook,
        session_id.as_str(),
        route,
        vec![LlmMessage::user(prompt)],
        None,
        None,
        config.llm_retry_max_attempts,
        config.llm_max_retry_delay_ms as u64,
        config.llm_timeout_ms as u64,
        deps.emit,
    )
    .await?;
    Ok(outcome.text)
}

async fn dispatch_one(
    deps: &LoopDeps<'_>,
    session_id: &SessionId,
    state: &mut SessionLoopState,
    owner: &str,
    tc: &ToolCall,
    args: &JsonValue,
) -> Result<DispatchOutcome> {
    let side_effecting = is_side_effecting(&tc.function.name);
    let target_key = signature(&tc.function.name, args);
    let mut attempt = 0u32;

    loop {
        deps.emit(RuntimeEvent::new(
            event_names::STEP_EXECUTE,
            Some(session_id.to_string()),
            serde_json::json!({ "tool": tc.function.name, "toolCallId": tc.id }),
        ));

        match deps
            .dispatcher
            .dispatch(&tc.function.name, args.clone(), session_id.as_str(), owner)
            .await
        {
            Ok(value) => {
                deps.emit(RuntimeEvent::new(
                    event_names::STEP_EXECUTE_RESULT,
                    Some(session_id.to_string()),
                    serde_json::json!({ "ok": true }),
                ));
                let text = render_tool_result(&tc.function.name, args, &value);
                deps.store.append_entry(
                    session_id,
                    EntryBody::Message {
                        role: Role::Tool,
                        text,
                        tool_name: Some(tc.function.name.clone()),
                        tool_call_id: Some(tc.id.clone()),
                    },
                )?;
                return Ok(DispatchOutcome::Success);
            }
            Err(err) => {
                deps.emit(RuntimeEvent::new(
                    event_names::STEP_EXECUTE_RESULT,
                    Some(session_id.to_string()),
                    serde_json::json!({ "ok": false, "code": err.code }),
                ));
                let failure_signature = format!("{}:{}:{}", tc.function.name, err.code, target_key);

                // Every failure counts against the run's retry budget,
                // whether it ends up auto-replayed, handed back to the
                // model, or propagated. The budget caps total retryable
                // failures, not just one classification (SPEC_FULL §4.4
                // step 9).
                if state.retry_budget.record_failure(&failure_signature) == CircuitOutcome::Open {
                    let status = if err.code == "E_VERIFY_FAILED" {
                        FinalStatus::FailedVerify
                    } else {
                        FinalStatus::FailedExecute
                    };
                    return Ok(DispatchOutcome::CircuitOpen(status));
                }

                match classify_tool_failure(&err.code, side_effecting) {
                    RetryAction::AutoReplay => {
                        if attempt >= AUTO_REPLAY_MAX_EXTRA_ATTEMPTS {
                            append_tool_failure(deps, session_id, tc, &err)?;
                            return Ok(DispatchOutcome::Recoverable);
                        }
                        tokio::time::sleep(auto_replay_delay(attempt)).await;
                        attempt += 1;
                    }
                    RetryAction::LlmReplan => {
                        append_tool_failure(deps, session_id, tc, &err)?;
                        return Ok(DispatchOutcome::Recoverable);
                    }
                    RetryAction::FailFast => return Err(err),
                }
            }
        }
    }
}

fn append_tool_failure(
    deps: &LoopDeps<'_>,
    session_id: &SessionId,
    tc: &ToolCall,
    err: &RuntimeError,
) -> Result<()> {
    deps.store.append_entry(
        session_id,
        EntryBody::Message {
            role: Role::Tool,
            text: format!("error {}: {}", err.code, err.message),
            tool_name: Some(tc.function.name.clone()),
            tool_call_id: Some(tc.id.clone()),
        },
    )?;
    Ok(())
}

/// `read_file`/`write_file`/`edit_file` results carry the resolved path as
/// their first line so the compaction engine's file-section extraction
/// (`tabline_compaction::prepare_compaction`) can find it.
fn render_tool_result(tool_name: &str, args: &JsonValue, value: &JsonValue) -> String {
    match tool_name {
        "read_file" | "write_file" | "edit_file" => {
            let path = args.get("path").and_then(JsonValue::as_str).unwrap_or("");
            let body = value
                .get("content")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            format!("{path}\n{body}")
        }
        _ => value.to_string(),
    }
}

/// Reconstruct the OpenAI-shaped message list from a session's entry
/// branch. `assistant_tool_calls` custom entries round-trip the tool calls
/// a prior turn issued; `tool` messages carry their result keyed by
/// `tool_call_id`.
fn to_llm_messages(branch: &[Entry], system_prompt_custom: Option<&str>) -> Vec<LlmMessage> {
    let mut messages = Vec::new();
    if let Some(custom) = system_prompt_custom {
        messages.push(LlmMessage::system(custom));
    }

    for entry in branch {
        match &entry.body {
            EntryBody::Message { role, text, tool_call_id, .. } => match role {
                Role::System => messages.push(LlmMessage::system(text.clone())),
                Role::User => messages.push(LlmMessage::user(text.clone())),
                Role::Assistant => messages.push(LlmMessage::assistant(text.clone())),
                Role::Tool => {
                    if let Some(id) = tool_call_id {
                        messages.push(LlmMessage::tool_result(id.clone(), text.clone()));
                    }
                }
            },
            EntryBody::Compaction { summary, .. } => {
                messages.push(LlmMessage::system(format!(
                    "Summary of earlier conversation:\n{summary}"
                )));
            }
            EntryBody::Custom { data } => {
                if data.get("kind").and_then(JsonValue::as_str) == Some("assistant_tool_calls") {
                    let tool_calls: Vec<ToolCall> = data
                        .get("toolCalls")
                        .cloned()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default();
                    let content = data
                        .get("text")
                        .and_then(JsonValue::as_str)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string);
                    messages.push(LlmMessage {
                        role: "assistant".to_string(),
                        content,
                        tool_calls: Some(tool_calls),
                        tool_call_id: None,
                    });
                }
            }
            EntryBody::Label { .. } | EntryBody::BranchSummary { .. } | EntryBody::CustomMessage { .. } => {}
        }
    }

    messages
}

/// Tool schemas offered to the model, one per SPEC_FULL §4.4 step 7 bucket.
fn default_tools() -> Vec<LlmTool> {
    vec![
        LlmTool::new(
            "bash",
            "Run a shell command on the host via the bridge.",
            serde_json::json!({
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"]
            }),
        ),
        LlmTool::new(
            "read_file",
            "Read a file's contents via the bridge.",
            serde_json::json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        ),
        LlmTool::new(
            "write_file",
            "Write a file's contents via the bridge.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
        ),
        LlmTool::new(
            "edit_file",
            "Apply a targeted edit to a file via the bridge.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old_text": { "type": "string" },
                    "new_text": { "type": "string" }
                },
                "required": ["path", "old_text", "new_text"]
            }),
        ),
        LlmTool::new(
            "list_tabs",
            "List open browser tabs.",
            serde_json::json!({ "type": "object", "properties": {} }),
        ),
        LlmTool::new(
            "open_tab",
            "Open a new browser tab at a URL.",
            serde_json::json!({
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }),
        ),
        LlmTool::new(
            "snapshot",
            "Capture an interactive/textual snapshot of a browser tab.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "tabId": { "type": "string" },
                    "mode": { "type": "string" },
                    "filter": { "type": "string" }
                },
                "required": ["tabId"]
            }),
        ),
        LlmTool::new(
            "browser_action",
            "Perform an action (click, type, fill, select, hover, navigate, press, read) on a browser tab.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "tabId": { "type": "string" },
                    "kind": { "type": "string" },
                    "ref": { "type": "string" },
                    "value": { "type": "string" }
                },
                "required": ["tabId", "kind"]
            }),
        ),
        LlmTool::new(
            "browser_verify",
            "Verify a browser tab's state against explicit expectations or a before/after diff.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "tabId": { "type": "string" },
                    "expectations": { "type": "array" }
                },
                "required": ["tabId"]
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::Arc;
    use tabline_core::{EscalationPolicy, InMemoryStore};
    use tabline_infra::InfraHandler;
    use tabline_llm::provider::{LlmResult, LlmStream};
    use tabline_llm::{LlmRequest, NoopHook, StreamDelta};
    use tokio_util::sync::CancellationToken;

    struct ScriptedProvider {
        turns: std::sync::Mutex<std::collections::VecDeque<Vec<StreamDelta>>>,
    }

    impl ScriptedProvider {
        fn new(turns: Vec<Vec<StreamDelta>>) -> Self {
            Self {
                turns: std::sync::Mutex::new(turns.into()),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn complete_stream(
            &self,
            _request: LlmRequest,
            _cancel: CancellationToken,
        ) -> LlmResult<LlmStream> {
            let deltas = self.turns.lock().unwrap().pop_front().unwrap_or_default();
            let items: Vec<LlmResult<StreamDelta>> = deltas.into_iter().map(Ok).collect();
            Ok(Box::pin(stream::iter(items)))
        }
    }

    fn test_route() -> LlmRoute {
        LlmRoute {
            profile: "default".into(),
            provider: "openai-compatible".into(),
            llm_model: "gpt-test".into(),
            role: "main".into(),
            llm_timeout_ms: 5_000,
            llm_retry_max_attempts: 0,
            llm_max_retry_delay_ms: 4_000,
            ordered_profiles: vec!["default".into()],
            escalation_policy: EscalationPolicy::Disabled,
            profile_index: 0,
        }
    }

    fn done_turn(text: &str) -> Vec<StreamDelta> {
        vec![
            StreamDelta::Text(text.to_string()),
            StreamDelta::Done {
                finish_reason: Some("stop".into()),
                usage: None,
            },
        ]
    }

    #[tokio::test]
    async fn ends_done_when_no_tool_calls_and_no_proof_required() {
        let store = InMemoryStore::new();
        let session = store.create(None);
        store
            .append_entry(
                &session.id,
                EntryBody::Message {
                    role: Role::User,
                    text: "say hi".into(),
                    tool_name: None,
                    tool_call_id: None,
                },
            )
            .unwrap();

        let provider = ScriptedProvider::new(vec![done_turn("hello there")]);
        let infra = Arc::new(InfraHandler::new(Config::default()));
        let dispatcher = ToolDispatcher::new(infra);
        let hook = NoopHook;
        let emit = |_e: RuntimeEvent| {};
        let deps = LoopDeps {
            store: &store,
            provider: &provider,
            hook: &hook,
            dispatcher: &dispatcher,
            emit: &emit,
        };

        let mut state = SessionLoopState::new(test_route(), false);
        let config = Config::default();
        let outcome = run_loop(&deps, &session.id, &mut state, &config, "owner-1").await.unwrap();

        assert_eq!(outcome.status, FinalStatus::Done);
        assert_eq!(outcome.llm_steps, 1);
        assert_eq!(outcome.tool_steps, 0);
    }

    #[tokio::test]
    async fn nudges_then_reports_progress_uncertain_when_browser_proof_missing() {
        let store = InMemoryStore::new();
        let session = store.create(None);
        store
            .append_entry(
                &session.id,
                EntryBody::Message {
                    role: Role::User,
                    text: "click the button".into(),
                    tool_name: None,
                    tool_call_id: None,
                },
            )
            .unwrap();

        let provider = ScriptedProvider::new(vec![
            done_turn("ok"),
            done_turn("ok"),
            done_turn("ok"),
            done_turn("ok"),
        ]);
        let infra = Arc::new(InfraHandler::new(Config::default()));
        let dispatcher = ToolDispatcher::new(infra);
        let hook = NoopHook;
        let emit = |_e: RuntimeEvent| {};
        let deps = LoopDeps {
            store: &store,
            provider: &provider,
            hook: &hook,
            dispatcher: &dispatcher,
            emit: &emit,
        };

        let mut state = SessionLoopState::new(test_route(), true);
        let config = Config::default();
        let outcome = run_loop(&deps, &session.id, &mut state, &config, "owner-1").await.unwrap();

        assert_eq!(outcome.status, FinalStatus::ProgressUncertain);
    }

    #[tokio::test]
    async fn disconnected_bridge_tool_opens_circuit_after_auto_replay_budget() {
        let store = InMemoryStore::new();
        let session = store.create(None);
        store
            .append_entry(
                &session.id,
                EntryBody::Message {
                    role: Role::User,
                    text: "run a command".into(),
                    tool_name: None,
                    tool_call_id: None,
                },
            )
            .unwrap();

        let bash_call = vec![
            StreamDelta::ToolCallStart {
                index: 0,
                id: "call_1".into(),
                name: "bash".into(),
            },
            StreamDelta::ToolCallDelta {
                index: 0,
                arguments: "{\"command\":\"echo hi\"}".into(),
            },
            StreamDelta::Done {
                finish_reason: Some("tool_calls".into()),
                usage: None,
            },
        ];
        // Each run_steps iteration re-requests the model; the tool call
        // repeats until the retry budget for this (tool, code, target)
        // signature opens the circuit (auto-replay budget is 2 extra
        // attempts beyond the first).
        let provider = ScriptedProvider::new(vec![
            bash_call.clone(),
            bash_call.clone(),
            bash_call.clone(),
        ]);
        let infra = Arc::new(InfraHandler::new(Config::default()));
        let dispatcher = ToolDispatcher::new(infra);
        let hook = NoopHook;
        let emit = |_e: RuntimeEvent| {};
        let deps = LoopDeps {
            store: &store,
            provider: &provider,
            hook: &hook,
            dispatcher: &dispatcher,
            emit: &emit,
        };

        let mut state = SessionLoopState::new(test_route(), false);
        let config = Config::default();
        let outcome = run_loop(&deps, &session.id, &mut state, &config, "owner-1").await.unwrap();

        assert_eq!(outcome.status, FinalStatus::FailedExecute);
    }

    #[test]
    fn render_tool_result_prefixes_path_for_file_tools() {
        let args = serde_json::json!({ "path": "/tmp/x.txt" });
        let value = serde_json::json!({ "content": "hello" });
        let text = render_tool_result("read_file", &args, &value);
        assert_eq!(text, "/tmp/x.txt\nhello");
    }

    #[test]
    fn to_llm_messages_roundtrips_tool_calls() {
        let entries = vec![
            Entry::new(
                None,
                EntryBody::Message {
                    role: Role::User,
                    text: "hi".into(),
                    tool_name: None,
                    tool_call_id: None,
                },
            ),
            Entry::new(
                None,
                EntryBody::Custom {
                    data: serde_json::json!({
                        "kind": "assistant_tool_calls",
                        "text": "",
                        "toolCalls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": { "name": "bash", "arguments": "{}" }
                        }]
                    }),
                },
            ),
            Entry::new(
                None,
                EntryBody::Message {
                    role: Role::Tool,
                    text: "ok".into(),
                    tool_name: Some("bash".into()),
                    tool_call_id: Some("call_1".into()),
                },
            ),
        ];
        let messages = to_llm_messages(&entries, None);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].tool_calls.as_ref().unwrap()[0].id, "call_1");
        assert_eq!(messages[2].role, "tool");
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_1"));
    }
}
