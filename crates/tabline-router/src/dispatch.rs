//! Message classification and dispatch (SPEC_FULL §4.5): one entry point,
//! `route_message`, that inspects an `InboundMessage`'s `type` prefix and
//! forwards it to the right collaborator, always returning an `Envelope`
//! rather than letting an error cross the boundary unwrapped.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tabline_agent::{run_loop, LoopDeps, SessionLoopState};
use tabline_core::{
    event_names, Config, EntryBody, Envelope, EscalationPolicy, JsonValue, LlmRoute, Result, Role,
    RuntimeError, RuntimeEvent, SessionId, SessionStore,
};
use tabline_infra::{ActionRequest, SnapshotQuery, VerifyRequest};

use crate::app::AppState;
use crate::hooks::RouteHookOutcome;

/// `{ok:true,data}|{ok:false,error}`, already flattened to a bare
/// `JsonValue` so callers (the WS loop, tests) don't need to know the
/// envelope's generic parameter.
pub async fn route_message(state: &Arc<AppState>, raw: tabline_core::InboundMessage) -> JsonValue {
    let msg_type = raw.msg_type.clone();
    let msg = match state.route_hook.before_route(raw) {
        RouteHookOutcome::Allow(msg) => msg,
        RouteHookOutcome::Block(error) => {
            state.route_hook.on_error(&msg_type, &error);
            return envelope_json(Envelope::<JsonValue>::Err { ok: false, error });
        }
    };

    let result = dispatch_inner(state, &msg).await;
    match &result {
        Ok(data) => state.route_hook.after_route(&msg_type, data),
        Err(error) => state.route_hook.on_error(&msg_type, error),
    }
    envelope_json(Envelope::from(result))
}

fn envelope_json<T: serde::Serialize>(envelope: Envelope<T>) -> JsonValue {
    serde_json::to_value(envelope).unwrap_or_else(|e| {
        json!({ "ok": false, "error": { "code": "E_INTERNAL", "message": e.to_string(), "retryable": false } })
    })
}

async fn dispatch_inner(state: &Arc<AppState>, msg: &tabline_core::InboundMessage) -> Result<JsonValue> {
    match msg.msg_type.as_str() {
        "ping" => Ok(json!({ "pong": true })),

        t if t.starts_with("config.") => dispatch_config(state, t, &msg.params).await,
        t if t.starts_with("bridge.") => dispatch_bridge(state, t, &msg.params).await,
        t if t.starts_with("lease.") => dispatch_lease(state, t, &msg.params),
        t if t.starts_with("cdp.") => dispatch_cdp(state, t, &msg.params).await,

        t if t.starts_with("brain.run.") => {
            dispatch_run(state, &t["brain.run.".len()..], msg.session_id.as_deref(), &msg.params).await
        }
        t if t.starts_with("brain.session.") => {
            dispatch_session(state, &t["brain.session.".len()..], msg.session_id.as_deref(), &msg.params)
        }
        t if t.starts_with("brain.step.") => {
            dispatch_step(state, &t["brain.step.".len()..], msg.session_id.as_deref(), &msg.params).await
        }
        t if t.starts_with("brain.storage.")
            || t.starts_with("brain.skill.")
            || t.starts_with("brain.debug.")
            || t == "brain.agent.run"
            || t == "brain.agent.end" =>
        {
            Err(RuntimeError::infra_unsupported(format!(
                "{t} is not implemented by this runtime"
            )))
        }

        other => Err(RuntimeError::method_not_found(other)),
    }
}

// --- config.* / bridge.* / lease.* / cdp.* : forwarded verbatim to C1 ---

async fn dispatch_config(state: &Arc<AppState>, t: &str, params: &JsonValue) -> Result<JsonValue> {
    match t {
        "config.get" => Ok(serde_json::to_value(state.infra.config_get().await)?),
        "config.save" => Ok(serde_json::to_value(state.infra.config_save(params).await?)?),
        other => Err(RuntimeError::method_not_found(other)),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct BridgeInvokeParams {
    tool: String,
    #[serde(default)]
    args: JsonValue,
    #[serde(default)]
    parent_session_id: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u32>,
}

async fn dispatch_bridge(state: &Arc<AppState>, t: &str, params: &JsonValue) -> Result<JsonValue> {
    let session_id = params.get("sessionId").and_then(JsonValue::as_str).map(str::to_string);
    match t {
        "bridge.connect" => {
            let force = params.get("force").and_then(JsonValue::as_bool).unwrap_or(false);
            state.infra.bridge_connect(force).await?;
            state.events.publish(RuntimeEvent::new(
                event_names::BRIDGE_STATUS,
                session_id,
                json!({ "connected": true }),
            ));
            Ok(json!({ "connected": true }))
        }
        "bridge.invoke" => {
            let p: BridgeInvokeParams = serde_json::from_value(params.clone())?;
            let result = state
                .infra
                .bridge_invoke(
                    &p.tool,
                    p.args,
                    session_id.clone(),
                    p.parent_session_id,
                    p.agent_id,
                    p.timeout_ms,
                )
                .await;
            state.events.publish(RuntimeEvent::new(
                event_names::BRIDGE_EVENT,
                session_id,
                json!({ "tool": p.tool, "ok": result.is_ok() }),
            ));
            result
        }
        "bridge.abort_pending" => {
            let reason = params.get("reason").and_then(JsonValue::as_str).unwrap_or("aborted");
            state.infra.bridge_abort_pending(reason);
            state.events.publish(RuntimeEvent::new(
                event_names::BRIDGE_STATUS,
                session_id,
                json!({ "aborted": true, "reason": reason }),
            ));
            Ok(json!({ "aborted": true }))
        }
        other => Err(RuntimeError::method_not_found(other)),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseParams {
    tab_id: String,
    owner: String,
    #[serde(default = "default_ttl")]
    ttl_ms: i64,
}

fn default_ttl() -> i64 {
    30_000
}

fn dispatch_lease(state: &Arc<AppState>, t: &str, params: &JsonValue) -> Result<JsonValue> {
    match t {
        "lease.acquire" => {
            let p: LeaseParams = serde_json::from_value(params.clone())?;
            Ok(serde_json::to_value(state.infra.lease_acquire(&p.tab_id, &p.owner, p.ttl_ms)?)?)
        }
        "lease.heartbeat" => {
            let p: LeaseParams = serde_json::from_value(params.clone())?;
            Ok(serde_json::to_value(state.infra.lease_heartbeat(&p.tab_id, &p.owner, p.ttl_ms)?)?)
        }
        "lease.release" => {
            let tab_id = params.get("tabId").and_then(JsonValue::as_str).unwrap_or_default();
            let owner = params.get("owner").and_then(JsonValue::as_str).unwrap_or_default();
            let (released, reason) = state.infra.lease_release(tab_id, owner);
            Ok(json!({ "released": released, "reason": reason }))
        }
        "lease.status" => {
            let tab_id = params.get("tabId").and_then(JsonValue::as_str).unwrap_or_default();
            Ok(serde_json::to_value(state.infra.lease_status(tab_id))?)
        }
        other => Err(RuntimeError::method_not_found(other)),
    }
}

async fn dispatch_cdp(state: &Arc<AppState>, t: &str, params: &JsonValue) -> Result<JsonValue> {
    let tab_id = params
        .get("tabId")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| RuntimeError::args("cdp.* requires tabId"))?
        .to_string();
    match t {
        "cdp.observe" => state.infra.cdp_observe(&tab_id).await,
        "cdp.snapshot" => {
            let query: SnapshotQuery = serde_json::from_value(params.clone())?;
            Ok(serde_json::to_value(state.infra.cdp_snapshot(&tab_id, query).await?)?)
        }
        "cdp.action" => {
            let req: ActionRequest = serde_json::from_value(params.clone())?;
            Ok(serde_json::to_value(state.infra.cdp_action(&tab_id, req).await?)?)
        }
        "cdp.execute" => {
            let owner = params.get("owner").and_then(JsonValue::as_str).unwrap_or_default();
            let script = params
                .get("script")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| RuntimeError::args("cdp.execute requires script"))?;
            state.infra.cdp_execute(&tab_id, owner, script).await
        }
        "cdp.verify" => {
            let req: VerifyRequest = serde_json::from_value(params.clone())?;
            Ok(serde_json::to_value(state.infra.cdp_verify(&tab_id, req).await?)?)
        }
        "cdp.detach" => {
            state.infra.cdp_detach(&tab_id).await;
            Ok(json!({ "detached": true }))
        }
        other => Err(RuntimeError::method_not_found(other)),
    }
}

// --- brain.run.* : C4 entry points ---

fn route_from_config(config: &Config, profile_override: Option<String>) -> LlmRoute {
    let profile = profile_override.unwrap_or_else(|| config.llm_default_profile.clone());
    let ordered_profiles = config
        .llm_profile_chains
        .get(&profile)
        .cloned()
        .unwrap_or_else(|| vec![profile.clone()]);
    let escalation_policy = if config.llm_escalation_policy == "disabled" {
        EscalationPolicy::Disabled
    } else {
        EscalationPolicy::UpgradeOnly
    };
    LlmRoute {
        profile,
        provider: "openai-compatible".to_string(),
        llm_model: config.llm_model.clone(),
        role: "primary".to_string(),
        llm_timeout_ms: config.llm_timeout_ms as u64,
        llm_retry_max_attempts: config.llm_retry_max_attempts,
        llm_max_retry_delay_ms: config.llm_max_retry_delay_ms as u64,
        ordered_profiles,
        escalation_policy,
        profile_index: 0,
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RunStartParams {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    requires_browser_proof: bool,
    #[serde(default)]
    profile: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    shared_tabs: Option<Vec<String>>,
}

async fn dispatch_run(
    state: &Arc<AppState>,
    op: &str,
    session_id: Option<&str>,
    params: &JsonValue,
) -> Result<JsonValue> {
    match op {
        "start" => run_start(state, session_id, params).await,
        "steer" => queue_prompt(state, session_id, params, tabline_agent::StreamingBehavior::Steer, true).await,
        "follow_up" => {
            queue_prompt(state, session_id, params, tabline_agent::StreamingBehavior::FollowUp, false).await
        }
        "pause" => control_op(state, session_id, |control| control.run_state.pause()).await,
        "resume" => control_op(state, session_id, |control| control.run_state.resume()).await,
        "stop" => {
            let result = control_op(state, session_id, |control| control.run_state.stop()).await;
            if result.is_ok() {
                state.dispatcher.abort_pending("session stopped");
            }
            result
        }
        "regenerate" => rewind_and_restart(state, session_id, params, false).await,
        "edit_rerun" => rewind_and_restart(state, session_id, params, true).await,
        "queue.promote" => Err(RuntimeError::infra_unsupported(
            "queue.promote has no reordering primitive in this runtime's prompt queue",
        )),
        other => Err(RuntimeError::method_not_found(&format!("brain.run.{other}"))),
    }
}

async fn run_start(state: &Arc<AppState>, session_id: Option<&str>, params: &JsonValue) -> Result<JsonValue> {
    let p: RunStartParams = serde_json::from_value(params.clone())?;
    let prompt = p.prompt.ok_or_else(|| RuntimeError::args("brain.run.start requires prompt"))?;
    let owner = p.owner.unwrap_or_else(|| "router".to_string());
    let requires_browser_proof = p.requires_browser_proof;
    let profile = p.profile;

    let session = match session_id {
        Some(id) => state.store.get(&SessionId::new(id))?,
        None => state.store.create(None),
    };

    let run_lock = state.registry.run_lock_for(&session.id);
    let guard = run_lock
        .try_lock_owned()
        .map_err(|_| RuntimeError::busy("a run is already active for this session"))?;

    state.store.append_entry(
        &session.id,
        EntryBody::Message {
            role: Role::User,
            text: prompt,
            tool_name: None,
            tool_call_id: None,
        },
    )?;
    state.events.publish(RuntimeEvent::new(
        event_names::INPUT_USER,
        Some(session.id.to_string()),
        json!({}),
    ));

    if let Some(tab_ids) = p.shared_tabs.filter(|t| !t.is_empty()) {
        let (_, inferred) = state.store.set_shared_tabs(&session.id, tab_ids.clone())?;
        state.events.publish(RuntimeEvent::new(
            event_names::INPUT_SHARED_TABS,
            Some(session.id.to_string()),
            json!({ "tabIds": tab_ids }),
        ));
        if inferred {
            state.events.publish(RuntimeEvent::new(
                event_names::INPUT_TAB_IDS_INFERRED,
                Some(session.id.to_string()),
                json!({}),
            ));
        }
    }

    let control = state.registry.control_for(&session.id);
    control.lock().await.run_state.restart();

    let config = state.infra.config_get().await;
    let route = route_from_config(&config, profile);

    let store = state.store.clone();
    let provider = state.provider.clone();
    let hook = state.llm_hook.clone();
    let dispatcher = state.dispatcher.clone();
    let events = state.events.clone();
    let session_id_owned = session.id.clone();

    tokio::spawn(async move {
        let _guard = guard;
        let emit = {
            let events = events.clone();
            move |event: RuntimeEvent| events.publish(event)
        };
        let deps = LoopDeps {
            store: store.as_ref(),
            provider: provider.as_ref(),
            hook: hook.as_ref(),
            dispatcher: dispatcher.as_ref(),
            emit: &emit,
        };
        let mut state = SessionLoopState::with_control(route, requires_browser_proof, control);
        if let Err(error) = run_loop(&deps, &session_id_owned, &mut state, &config, &owner).await {
            emit(RuntimeEvent::new(
                tabline_core::event_names::LOOP_ERROR,
                Some(session_id_owned.to_string()),
                json!({ "code": error.code, "message": error.message }),
            ));
        }
    });

    Ok(json!({ "sessionId": session.id.as_str(), "accepted": true }))
}

async fn queue_prompt(
    state: &Arc<AppState>,
    session_id: Option<&str>,
    params: &JsonValue,
    behavior: tabline_agent::StreamingBehavior,
    preempt: bool,
) -> Result<JsonValue> {
    let session_id = session_id.ok_or_else(|| RuntimeError::args("sessionId is required"))?;
    let prompt = params
        .get("prompt")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| RuntimeError::args("prompt is required"))?
        .to_string();
    let control = state.registry.control_for(&SessionId::new(session_id));
    let queue_state = {
        let mut guard = control.lock().await;
        if guard.run_state.is_stopped() {
            return Err(RuntimeError::new(
                "E_SESSION_STOPPED",
                "session is stopped; call brain.run.start to restart it",
                false,
            ));
        }
        guard.queue.push(behavior, prompt);
        guard.queue.state()
    };
    if matches!(behavior, tabline_agent::StreamingBehavior::Steer) {
        state.events.publish(RuntimeEvent::new(
            event_names::INPUT_STEER,
            Some(session_id.to_string()),
            json!({}),
        ));
    }
    state.events.publish(RuntimeEvent::new(
        event_names::MESSAGE_QUEUED,
        Some(session_id.to_string()),
        serde_json::to_value(&queue_state).unwrap_or(JsonValue::Null),
    ));
    if preempt {
        state.dispatcher.abort_pending("steer preemption");
    }
    Ok(serde_json::to_value(queue_state)?)
}

async fn control_op(
    state: &Arc<AppState>,
    session_id: Option<&str>,
    f: impl FnOnce(&mut tabline_agent::SessionControl),
) -> Result<JsonValue> {
    let session_id = session_id.ok_or_else(|| RuntimeError::args("sessionId is required"))?;
    let control = state.registry.control_for(&SessionId::new(session_id));
    let status = {
        let mut guard = control.lock().await;
        f(&mut guard);
        guard.run_state.status()
    };
    Ok(json!({ "status": format!("{status:?}").to_lowercase() }))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RewindParams {
    #[serde(default)]
    leaf: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

/// `regenerate`/`edit_rerun` both rewind the session's leaf past its last
/// user turn, then re-run through `run_start` to pick up a fresh branch
/// (SPEC_FULL §4.5). `regenerate` replays the dropped turn's own text;
/// `edit_rerun` replaces it with caller-supplied `text`. An explicit `leaf`
/// overrides which entry to treat as "the turn to redo".
async fn rewind_and_restart(
    state: &Arc<AppState>,
    session_id: Option<&str>,
    params: &JsonValue,
    needs_text: bool,
) -> Result<JsonValue> {
    let session_id = session_id.ok_or_else(|| RuntimeError::args("sessionId is required"))?;
    let typed_id = SessionId::new(session_id);
    let p: RewindParams = serde_json::from_value(params.clone())?;

    let branch = state.store.branch(&typed_id)?;
    let target = match &p.leaf {
        Some(leaf) => branch
            .iter()
            .find(|e| e.id.as_str() == leaf.as_str())
            .cloned()
            .ok_or_else(|| RuntimeError::args(format!("unknown entry id: {leaf}")))?,
        None => branch
            .iter()
            .rev()
            .find(|e| matches!(e.body, EntryBody::Message { role: Role::User, .. }))
            .cloned()
            .ok_or_else(|| RuntimeError::args("nothing to regenerate from"))?,
    };
    let replay_text = match &target.body {
        EntryBody::Message { text, .. } => text.clone(),
        _ => return Err(RuntimeError::args("target entry is not a user message")),
    };

    state.store.rewind(&typed_id, target.parent_id.clone())?;

    let prompt = if needs_text {
        p.text.ok_or_else(|| RuntimeError::args("edit_rerun requires text"))?
    } else {
        replay_text
    };

    state.events.publish(RuntimeEvent::new(
        event_names::INPUT_REGENERATE,
        Some(session_id.to_string()),
        json!({ "editRerun": needs_text, "fromLeaf": target.id.to_string() }),
    ));
    state.events.publish(RuntimeEvent::new(
        event_names::LOOP_RESTART,
        Some(session_id.to_string()),
        json!({}),
    ));

    run_start(state, Some(session_id), &json!({ "prompt": prompt })).await
}

// --- brain.session.* : storage collaborator ---

fn dispatch_session(
    state: &Arc<AppState>,
    op: &str,
    session_id: Option<&str>,
    params: &JsonValue,
) -> Result<JsonValue> {
    match op {
        "list" => Ok(json!(state
            .store
            .list()
            .iter()
            .map(SessionId::to_string)
            .collect::<Vec<_>>())),
        "get" => {
            let id = require_session_id(session_id)?;
            Ok(serde_json::to_value(state.store.get(&id)?)?)
        }
        "view" => {
            let id = require_session_id(session_id)?;
            Ok(serde_json::to_value(state.store.branch(&id)?)?)
        }
        "fork" => {
            let id = require_session_id(session_id)?;
            let leaf = params.get("leaf").and_then(JsonValue::as_str).map(tabline_core::EntryId::new);
            Ok(serde_json::to_value(state.store.fork(&id, leaf)?)?)
        }
        "title.refresh" => {
            let id = require_session_id(session_id)?;
            if let Some(title) = params.get("title").and_then(JsonValue::as_str) {
                return Ok(serde_json::to_value(state.store.set_title(&id, title.to_string(), "user".into())?)?);
            }
            let branch = state.store.branch(&id)?;
            let title = branch
                .iter()
                .find_map(|e| match &e.body {
                    EntryBody::Message { role: Role::User, text, .. } => Some(truncate_title(text)),
                    _ => None,
                })
                .unwrap_or_else(|| "Untitled session".to_string());
            Ok(serde_json::to_value(state.store.set_title(&id, title, "auto".into())?)?)
        }
        "delete" => {
            let id = require_session_id(session_id)?;
            state.registry.forget(&id);
            state.store.delete(&id)?;
            Ok(json!({ "deleted": true }))
        }
        other => Err(RuntimeError::method_not_found(&format!("brain.session.{other}"))),
    }
}

fn truncate_title(text: &str) -> String {
    const MAX: usize = 60;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        format!("{}…", text.chars().take(MAX).collect::<String>())
    }
}

fn require_session_id(session_id: Option<&str>) -> Result<SessionId> {
    session_id
        .map(SessionId::new)
        .ok_or_else(|| RuntimeError::args("sessionId is required"))
}

// --- brain.step.* : event buffer / direct tool dispatch ---

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct StepStreamParams {
    #[serde(default)]
    max_events: Option<usize>,
    #[serde(default)]
    max_bytes: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepExecuteParams {
    tool: String,
    #[serde(default)]
    args: JsonValue,
    #[serde(default)]
    owner: Option<String>,
}

async fn dispatch_step(
    state: &Arc<AppState>,
    op: &str,
    session_id: Option<&str>,
    params: &JsonValue,
) -> Result<JsonValue> {
    let id = require_session_id(session_id)?;
    match op {
        "stream" => {
            let p: StepStreamParams = serde_json::from_value(params.clone())?;
            Ok(json!(state.events.read_buffer(&id, p.max_events, p.max_bytes)))
        }
        "execute" => {
            let p: StepExecuteParams = serde_json::from_value(params.clone())?;
            let owner = p.owner.unwrap_or_else(|| "router".to_string());
            state.dispatcher.dispatch(&p.tool, p.args, id.as_str(), &owner).await
        }
        other => Err(RuntimeError::method_not_found(&format!("brain.step.{other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabline_core::InboundMessage;
    use tabline_infra::InfraHandler;

    fn test_state() -> Arc<AppState> {
        let infra = Arc::new(InfraHandler::new(Config::default()));
        Arc::new(AppState::new(infra, "http://localhost".into(), "test-key".into()))
    }

    fn msg(msg_type: &str, session_id: Option<&str>, params: JsonValue) -> InboundMessage {
        InboundMessage {
            msg_type: msg_type.to_string(),
            session_id: session_id.map(str::to_string),
            params,
        }
    }

    #[tokio::test]
    async fn ping_is_answered_directly() {
        let state = test_state();
        let response = route_message(&state, msg("ping", None, json!({}))).await;
        assert_eq!(response["ok"], true);
        assert_eq!(response["data"]["pong"], true);
    }

    #[tokio::test]
    async fn config_get_returns_the_current_config() {
        let state = test_state();
        let response = route_message(&state, msg("config.get", None, json!({}))).await;
        assert_eq!(response["ok"], true);
        assert!(response["data"].is_object());
    }

    #[tokio::test]
    async fn unknown_message_type_is_reported_as_an_error_envelope() {
        let state = test_state();
        let response = route_message(&state, msg("brain.nonsense", None, json!({}))).await;
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"]["code"], "E_METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn session_list_starts_empty_and_grows_after_a_run_start() {
        let state = test_state();

        let listed = route_message(&state, msg("brain.session.list", None, json!({}))).await;
        assert_eq!(listed["data"].as_array().unwrap().len(), 0);

        let started = route_message(
            &state,
            msg("brain.run.start", None, json!({ "prompt": "hello" })),
        )
        .await;
        assert_eq!(started["ok"], true);
        assert_eq!(started["data"]["accepted"], true);

        let listed = route_message(&state, msg("brain.session.list", None, json!({}))).await;
        assert_eq!(listed["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn a_second_concurrent_run_start_for_the_same_session_is_busy() {
        let state = test_state();
        let started = route_message(
            &state,
            msg("brain.run.start", None, json!({ "prompt": "hello" })),
        )
        .await;
        let session_id = started["data"]["sessionId"].as_str().unwrap().to_string();

        let second = route_message(
            &state,
            msg("brain.run.start", Some(&session_id), json!({ "prompt": "again" })),
        )
        .await;
        assert_eq!(second["ok"], false);
        assert_eq!(second["error"]["code"], "E_BUSY");
    }

    #[tokio::test]
    async fn queue_promote_is_unsupported() {
        let state = test_state();
        let started = route_message(
            &state,
            msg("brain.run.start", None, json!({ "prompt": "hello" })),
        )
        .await;
        let session_id = started["data"]["sessionId"].as_str().unwrap().to_string();

        let response = route_message(
            &state,
            msg("brain.run.queue.promote", Some(&session_id), json!({})),
        )
        .await;
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"]["code"], "E_INFRA_UNSUPPORTED");
    }
}
