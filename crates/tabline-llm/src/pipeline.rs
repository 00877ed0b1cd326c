//! `requestLlmWithRetry` (SPEC_FULL §4.3): hook gating, provider dispatch,
//! SSE decode, and the retry/backoff loop around it.

use std::collections::BTreeMap;
use std::time::Duration;

use tabline_core::{event_names, LlmRoute, RuntimeError, RuntimeEvent};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::hooks::{HookOutcome, LlmHook};
use crate::provider::{LlmError, LlmProvider, LlmResult};
use crate::retry::resolve_delay;
use crate::types::{
    AccumulatedToolCall, LlmMessage, LlmRequest, LlmTool, StreamDelta, ToolCall, ToolChoice, Usage,
};

pub struct PipelineOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

#[allow(clippy::too_many_arguments)]
pub async fn request_llm_with_retry(
    provider: &dyn LlmProvider,
    hook: &dyn LlmHook,
    session_id: &str,
    route: &LlmRoute,
    messages: Vec<LlmMessage>,
    tools: Option<Vec<LlmTool>>,
    tool_choice: Option<ToolChoice>,
    max_retry_attempts: u32,
    max_retry_delay_ms: u64,
    timeout_ms: u64,
    emit: &(dyn Fn(RuntimeEvent) + Sync),
) -> Result<PipelineOutcome, RuntimeError> {
    let request = LlmRequest {
        model: route.llm_model.clone(),
        messages,
        tools,
        tool_choice,
        temperature: None,
        stream: true,
    };

    let request = match apply_before_hook(hook, &route.provider, request) {
        Ok(request) => request,
        Err(err) => {
            if err.code == "E_LLM_HOOK_BLOCKED" {
                emit(RuntimeEvent::new(
                    event_names::LLM_ROUTE_BLOCKED,
                    Some(session_id.to_string()),
                    serde_json::json!({ "profile": route.profile, "reason": err.message }),
                ));
            }
            return Err(err);
        }
    };

    emit(RuntimeEvent::new(
        event_names::LLM_ROUTE_SELECTED,
        Some(session_id.to_string()),
        serde_json::json!({ "profile": route.profile, "model": route.llm_model }),
    ));
    emit(RuntimeEvent::new(
        event_names::LLM_REQUEST,
        Some(session_id.to_string()),
        serde_json::json!({ "model": request.model, "profile": route.profile }),
    ));

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let cancel = CancellationToken::new();
        let attempt_result = run_one_attempt(provider, &request, timeout_ms, &cancel, session_id, emit).await;

        match attempt_result {
            Ok(outcome) => {
                apply_after_hook(hook, &outcome)?;
                return Ok(outcome);
            }
            Err(err) => {
                let retryable = err.is_retryable();
                if !retryable || attempt > max_retry_attempts {
                    return Err(translate_error(err));
                }

                let hint = retry_hint_from_error(&err);
                let delay = resolve_delay(attempt, hint);
                if delay.as_millis() as u64 > max_retry_delay_ms {
                    return Err(RuntimeError::llm_retry_delay_exceeded(format!(
                        "retry delay {}ms exceeds configured max {}ms",
                        delay.as_millis(),
                        max_retry_delay_ms
                    )));
                }

                warn!(attempt, delay_ms = delay.as_millis() as u64, "llm retry");
                emit(RuntimeEvent::new(
                    event_names::AUTO_RETRY_START,
                    Some(session_id.to_string()),
                    serde_json::json!({ "attempt": attempt, "delayMs": delay.as_millis() as u64 }),
                ));
                tokio::time::sleep(delay).await;
                emit(RuntimeEvent::new(
                    event_names::AUTO_RETRY_END,
                    Some(session_id.to_string()),
                    serde_json::json!({ "attempt": attempt }),
                ));
            }
        }
    }
}

async fn run_one_attempt(
    provider: &dyn LlmProvider,
    request: &LlmRequest,
    timeout_ms: u64,
    cancel: &CancellationToken,
    session_id: &str,
    emit: &(dyn Fn(RuntimeEvent) + Sync),
) -> LlmResult<PipelineOutcome> {
    let call = provider.complete_stream(request.clone(), cancel.clone());
    let stream_result = tokio::time::timeout(Duration::from_millis(timeout_ms), call).await;
    let mut stream = match stream_result {
        Ok(r) => r?,
        Err(_) => return Err(LlmError::RequestFailed("llm request timed out".into())),
    };

    emit(RuntimeEvent::new(
        event_names::LLM_STREAM_START,
        Some(session_id.to_string()),
        serde_json::json!({}),
    ));

    use futures::StreamExt;
    let mut text = String::new();
    let mut tool_calls: BTreeMap<u32, AccumulatedToolCall> = BTreeMap::new();
    let mut usage = None;
    let mut finish_reason = None;

    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let next = tokio::time::timeout_at(deadline, stream.next()).await;
        let Ok(item) = next else {
            return Err(LlmError::RequestFailed("llm stream timed out".into()));
        };
        let Some(delta) = item else { break };
        let delta = delta?;

        emit(RuntimeEvent::new(
            event_names::LLM_STREAM_DELTA,
            Some(session_id.to_string()),
            serde_json::json!({}),
        ));

        match delta {
            StreamDelta::Text(t) => text.push_str(&t),
            StreamDelta::ToolCallStart { index, id, name } => {
                let entry = tool_calls.entry(index).or_default();
                if !id.is_empty() {
                    entry.id = id;
                }
                if !name.is_empty() {
                    entry.name = name;
                }
            }
            StreamDelta::ToolCallDelta { index, arguments } => {
                tool_calls.entry(index).or_default().arguments.push_str(&arguments);
            }
            StreamDelta::Done {
                finish_reason: fr,
                usage: u,
            } => {
                finish_reason = fr;
                if u.is_some() {
                    usage = u;
                }
            }
            StreamDelta::Error(msg) => return Err(LlmError::StreamError(msg)),
        }
    }

    emit(RuntimeEvent::new(
        event_names::LLM_STREAM_END,
        Some(session_id.to_string()),
        serde_json::json!({}),
    ));
    emit(RuntimeEvent::new(
        event_names::LLM_RESPONSE_RAW,
        Some(session_id.to_string()),
        serde_json::json!({ "text": text, "finishReason": finish_reason }),
    ));

    let tool_calls: Vec<ToolCall> = tool_calls.into_values().map(|a| a.into_tool_call()).collect();

    emit(RuntimeEvent::new(
        event_names::LLM_RESPONSE_PARSED,
        Some(session_id.to_string()),
        serde_json::json!({ "toolCallCount": tool_calls.len() }),
    ));

    Ok(PipelineOutcome {
        text,
        tool_calls,
        usage,
        finish_reason,
    })
}

fn apply_before_hook(
    hook: &dyn LlmHook,
    url: &str,
    request: LlmRequest,
) -> Result<LlmRequest, RuntimeError> {
    let body = serde_json::to_value(&request)
        .map_err(|e| RuntimeError::internal(format!("failed to serialize llm request: {e}")))?;
    match hook.before_request(url, body) {
        HookOutcome::Allow(patched) => serde_json::from_value(patched)
            .map_err(|e| RuntimeError::llm_hook_invalid_patch(e.to_string())),
        HookOutcome::Block(reason) => Err(RuntimeError::llm_hook_blocked(reason)),
        HookOutcome::InvalidPatch(reason) => Err(RuntimeError::llm_hook_invalid_patch(reason)),
    }
}

fn apply_after_hook(hook: &dyn LlmHook, outcome: &PipelineOutcome) -> Result<(), RuntimeError> {
    let body = serde_json::json!({
        "text": outcome.text,
        "finishReason": outcome.finish_reason,
    });
    match hook.after_response(body) {
        HookOutcome::Allow(_) => Ok(()),
        HookOutcome::Block(reason) => Err(RuntimeError::llm_hook_blocked(reason)),
        HookOutcome::InvalidPatch(reason) => Err(RuntimeError::llm_hook_invalid_patch(reason)),
    }
}

fn retry_hint_from_error(err: &LlmError) -> Option<Duration> {
    match err {
        LlmError::RateLimited { retry_after_ms } => Some(Duration::from_millis(*retry_after_ms)),
        _ => None,
    }
}

fn translate_error(err: LlmError) -> RuntimeError {
    match err {
        LlmError::RequestFailed(msg) if msg.contains("timed out") => RuntimeError::llm_timeout(msg),
        LlmError::RequestFailed(msg) => RuntimeError::new("E_LLM_REQUEST_FAILED", msg, false),
        LlmError::AuthFailed(msg) => RuntimeError::new("E_LLM_AUTH", msg, false).with_status(401),
        LlmError::RateLimited { retry_after_ms } => RuntimeError::new(
            "E_LLM_RATE_LIMITED",
            format!("rate limited, retry after {retry_after_ms}ms"),
            true,
        )
        .with_status(429),
        LlmError::InvalidResponse(msg) => RuntimeError::new("E_LLM_INVALID_RESPONSE", msg, false),
        LlmError::StreamError(msg) => RuntimeError::new("E_LLM_STREAM", msg, true),
        LlmError::Cancelled => RuntimeError::bridge_interrupted("llm request cancelled"),
        LlmError::NetworkError(e) => RuntimeError::new("E_LLM_NETWORK", e.to_string(), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoopHook;
    use crate::provider::LlmStream;
    use futures::stream;
    use tabline_core::EscalationPolicy;

    struct FakeProvider {
        deltas: Vec<StreamDelta>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }
        async fn complete_stream(
            &self,
            _request: LlmRequest,
            _cancel: CancellationToken,
        ) -> LlmResult<LlmStream> {
            let items: Vec<LlmResult<StreamDelta>> =
                self.deltas.clone().into_iter().map(Ok).collect();
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
            escalation_policy: EscalationPolicy::UpgradeOnly,
            profile_index: 0,
        }
    }

    #[tokio::test]
    async fn accumulates_text_and_tool_calls() {
        let provider = FakeProvider {
            deltas: vec![
                StreamDelta::Text("hel".into()),
                StreamDelta::Text("lo".into()),
                StreamDelta::ToolCallStart {
                    index: 0,
                    id: "call_1".into(),
                    name: "read_file".into(),
                },
                StreamDelta::ToolCallDelta {
                    index: 0,
                    arguments: "{\"path\":".into(),
                },
                StreamDelta::ToolCallDelta {
                    index: 0,
                    arguments: "\"/tmp/x\"}".into(),
                },
                StreamDelta::Done {
                    finish_reason: Some("tool_calls".into()),
                    usage: None,
                },
            ],
        };
        let route = test_route();
        let outcome = request_llm_with_retry(
            &provider,
            &NoopHook,
            "s1",
            &route,
            vec![LlmMessage::user("read /tmp/x")],
            None,
            None,
            0,
            4_000,
            5_000,
            &|_e| {},
        )
        .await
        .unwrap();

        assert_eq!(outcome.text, "hello");
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].function.name, "read_file");
        assert_eq!(outcome.tool_calls[0].function.arguments, "{\"path\":\"/tmp/x\"}");
        assert_eq!(outcome.finish_reason, Some("tool_calls".into()));
    }

    struct BlockingHook;
    impl LlmHook for BlockingHook {
        fn before_request(&self, _url: &str, _body: tabline_core::JsonValue) -> HookOutcome {
            HookOutcome::Block("policy blocked this request".into())
        }
    }

    #[tokio::test]
    async fn before_hook_block_is_non_retryable() {
        let provider = FakeProvider { deltas: vec![] };
        let route = test_route();
        let err = request_llm_with_retry(
            &provider,
            &BlockingHook,
            "s1",
            &route,
            vec![LlmMessage::user("hi")],
            None,
            None,
            3,
            4_000,
            5_000,
            &|_e| {},
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, "E_LLM_HOOK_BLOCKED");
        assert!(!err.retryable);
    }
}
