//! Action execution: target resolution + click/type/fill/select/hover/read
//! (SPEC_FULL §4.1 "Action algorithm").

use serde::{Deserialize, Serialize};
use tabline_core::{JsonValue, Result, RuntimeError};
use tokio::time::{sleep, Duration, Instant};

use crate::cdp::CdpRegistry;
use crate::lease::LeaseTable;
use crate::snapshot::SnapshotStore;

const ELEMENT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const ELEMENT_WAIT_POLL: Duration = Duration::from_millis(80);

#[derive(Clone, Debug, Deserialize)]
pub struct ActionRequest {
    pub kind: ActionKind,
    #[serde(default)]
    pub backend_node_id: Option<i64>,
    #[serde(default)]
    pub r#ref: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    /// Free-text description of the target, consulted only when
    /// `backendNodeId`/`ref`/`selector` all miss (SPEC_FULL §4.1 "Action
    /// algorithm" 4th priority tier).
    #[serde(default)]
    pub hint: Option<String>,
    pub owner: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Click,
    Type,
    Fill,
    Select,
    Hover,
    Read,
    Navigate,
    Press,
}

impl ActionKind {
    fn is_mutating(self) -> bool {
        !matches!(self, ActionKind::Read)
    }

    fn is_selector_free(self) -> bool {
        matches!(self, ActionKind::Navigate | ActionKind::Press)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ActionResult {
    pub ok: bool,
    pub kind: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub used_fallback: bool,
}

pub async fn execute_action(
    cdp: &CdpRegistry,
    leases: &LeaseTable,
    snapshots: &SnapshotStore,
    tab_id: &str,
    req: ActionRequest,
    now: i64,
) -> Result<ActionResult> {
    if req.kind.is_mutating() && !leases.is_held_by(tab_id, &req.owner, now) {
        return Err(RuntimeError::busy("action requires a live lease for this owner")
            .with_details(serde_json::json!({ "reason": "lease_required" })));
    }

    match req.kind {
        ActionKind::Navigate => {
            let url = req
                .url
                .ok_or_else(|| RuntimeError::args("navigate requires url"))?;
            cdp.navigate(tab_id, &url).await?;
            return Ok(ActionResult {
                ok: true,
                kind: req.kind,
                text: None,
                used_fallback: false,
            });
        }
        ActionKind::Press => {
            let key = req
                .key
                .ok_or_else(|| RuntimeError::args("press requires key"))?;
            let script = format!(
                "document.activeElement && document.activeElement.dispatchEvent(new KeyboardEvent('keydown', {{key: {key:?}, bubbles: true}}))"
            );
            cdp.evaluate(tab_id, &script).await?;
            return Ok(ActionResult {
                ok: true,
                kind: req.kind,
                text: None,
                used_fallback: false,
            });
        }
        _ => {}
    }

    if !req.kind.is_selector_free() {
        let target = resolve_target(snapshots, tab_id, &req)?;

        if let Some(backend_node_id) = target.backend_node_id {
            match run_via_backend_node(cdp, tab_id, backend_node_id, req.kind, req.value.as_deref()).await {
                Ok(text) => {
                    return Ok(ActionResult {
                        ok: true,
                        kind: req.kind,
                        text,
                        used_fallback: false,
                    });
                }
                Err(_) => {
                    // fall through to selector-based execution below
                }
            }
        }

        let selector = target
            .selector
            .ok_or_else(|| RuntimeError::args("unable to resolve a selector for this action"))?;
        let text = run_via_selector(cdp, tab_id, &selector, req.kind, req.value.as_deref()).await?;
        return Ok(ActionResult {
            ok: true,
            kind: req.kind,
            text,
            used_fallback: true,
        });
    }

    Err(RuntimeError::args("action requires a target"))
}

struct ResolvedTarget {
    backend_node_id: Option<i64>,
    selector: Option<String>,
}

/// Priority: explicit backendNodeId → ref lookup → selector → hint-matched
/// typable candidate (SPEC_FULL §4.1 "Action algorithm").
fn resolve_target(
    snapshots: &SnapshotStore,
    tab_id: &str,
    req: &ActionRequest,
) -> Result<ResolvedTarget> {
    if let Some(id) = req.backend_node_id {
        return Ok(ResolvedTarget {
            backend_node_id: Some(id),
            selector: None,
        });
    }
    if let Some(node_ref) = &req.r#ref {
        if let Some(node) = snapshots.resolve_ref(tab_id, node_ref) {
            return Ok(ResolvedTarget {
                backend_node_id: node.backend_node_id,
                selector: node.selector,
            });
        }
        return Err(RuntimeError::args(format!("unknown ref: {node_ref}")));
    }
    if let Some(selector) = &req.selector {
        return Ok(ResolvedTarget {
            backend_node_id: None,
            selector: Some(selector.clone()),
        });
    }
    if let Some(hint) = &req.hint {
        if let Some(node) = snapshots.find_by_hint(tab_id, hint) {
            return Ok(ResolvedTarget {
                backend_node_id: node.backend_node_id,
                selector: node.selector,
            });
        }
        return Err(RuntimeError::args(format!(
            "no typable element matched hint: {hint}"
        )));
    }
    Err(RuntimeError::args(
        "action requires one of backendNodeId, ref, selector, hint",
    ))
}

async fn run_via_backend_node(
    cdp: &CdpRegistry,
    tab_id: &str,
    backend_node_id: i64,
    kind: ActionKind,
    value: Option<&str>,
) -> Result<Option<String>> {
    let object_id = cdp.resolve_node(tab_id, backend_node_id).await?;
    let result = run_function(cdp, tab_id, &object_id, kind, value).await;
    cdp.release_object(tab_id, object_id).await;
    result
}

async fn run_via_selector(
    cdp: &CdpRegistry,
    tab_id: &str,
    selector: &str,
    kind: ActionKind,
    value: Option<&str>,
) -> Result<Option<String>> {
    let deadline = Instant::now() + ELEMENT_WAIT_TIMEOUT;
    loop {
        let found = cdp
            .evaluate(tab_id, &format!("!!document.querySelector({selector:?})"))
            .await?;
        if found.as_bool().unwrap_or(false) {
            break;
        }
        if Instant::now() >= deadline {
            return Err(RuntimeError::cdp_resolve_node(format!(
                "selector not found within {}ms: {selector}",
                ELEMENT_WAIT_TIMEOUT.as_millis()
            )));
        }
        sleep(ELEMENT_WAIT_POLL).await;
    }

    let script = action_script(kind, "document.querySelector(__SELECTOR__)", value);
    let script = script.replace("__SELECTOR__", &serde_json::to_string(selector).unwrap());
    let result = cdp.evaluate(tab_id, &script).await?;
    Ok(result.as_str().map(String::from))
}

async fn run_function(
    cdp: &CdpRegistry,
    tab_id: &str,
    object_id: &chromiumoxide::cdp::browser_protocol::runtime::RemoteObjectId,
    kind: ActionKind,
    value: Option<&str>,
) -> Result<Option<String>> {
    let function_declaration = action_function(kind);
    let args = match value {
        Some(v) => vec![JsonValue::String(v.to_string())],
        None => vec![],
    };
    let result = cdp
        .call_function_on(tab_id, object_id, &function_declaration, args)
        .await?;
    Ok(result.as_str().map(String::from))
}

/// Function body applied via `Runtime.callFunctionOn`, `this` bound to the
/// resolved element.
fn action_function(kind: ActionKind) -> String {
    match kind {
        ActionKind::Click => "function() { this.click(); return null; }".to_string(),
        ActionKind::Hover => {
            "function() { this.dispatchEvent(new MouseEvent('mouseover', {bubbles:true})); return null; }"
                .to_string()
        }
        ActionKind::Read => "function() { return (this.innerText || this.value || '').slice(0, 4000); }".to_string(),
        ActionKind::Type | ActionKind::Fill => type_or_fill_function(kind == ActionKind::Fill),
        ActionKind::Select => {
            "function(value) { this.value = value; this.dispatchEvent(new Event('change', {bubbles:true})); return null; }"
                .to_string()
        }
        ActionKind::Navigate | ActionKind::Press => unreachable!("selector-free action"),
    }
}

/// Selector-path equivalent of `action_function`, operating on
/// `document.querySelector(...)` instead of a bound `this`.
fn action_script(kind: ActionKind, target_expr: &str, value: Option<&str>) -> String {
    let value_json = value.map(|v| serde_json::to_string(v).unwrap()).unwrap_or_else(|| "null".to_string());
    match kind {
        ActionKind::Click => format!("(() => {{ const el = {target_expr}; el.click(); return null; }})()"),
        ActionKind::Hover => format!(
            "(() => {{ const el = {target_expr}; el.dispatchEvent(new MouseEvent('mouseover', {{bubbles:true}})); return null; }})()"
        ),
        ActionKind::Read => format!(
            "(() => {{ const el = {target_expr}; return (el.innerText || el.value || '').slice(0, 4000); }})()"
        ),
        ActionKind::Type | ActionKind::Fill => format!(
            "(() => {{ const el = {target_expr}; const value = {value_json}; {body} return null; }})()",
            body = type_or_fill_body(kind == ActionKind::Fill)
        ),
        ActionKind::Select => format!(
            "(() => {{ const el = {target_expr}; el.value = {value_json}; el.dispatchEvent(new Event('change', {{bubbles:true}})); return null; }})()"
        ),
        ActionKind::Navigate | ActionKind::Press => unreachable!("selector-free action"),
    }
}

fn type_or_fill_function(is_fill: bool) -> String {
    format!("function(value) {{ const el = this; {body} return null; }}", body = type_or_fill_body(is_fill))
}

/// Monaco editor model set, else native value-setter (bypassing
/// framework-shadowed setters), else `execCommand('insertText')` for
/// contenteditable. Dispatches beforeinput, input, (change for fill), keyup
/// in that order (SPEC_FULL §4.1 "Action algorithm").
fn type_or_fill_body(is_fill: bool) -> String {
    let change_event = if is_fill {
        "el.dispatchEvent(new Event('change', {bubbles:true}));"
    } else {
        ""
    };
    format!(
        r#"
        el.dispatchEvent(new InputEvent('beforeinput', {{bubbles:true}}));
        const monacoRoot = el.closest('.monaco-editor');
        if (monacoRoot && window.monaco && window.monaco.editor) {{
            const models = window.monaco.editor.getModels();
            if (models.length > 0) {{
                models[0].setValue(value);
            }}
        }} else if (el.isContentEditable) {{
            el.focus();
            document.execCommand('insertText', false, value);
        }} else {{
            const proto = Object.getPrototypeOf(el);
            const setter = Object.getOwnPropertyDescriptor(proto, 'value')?.set;
            if (setter) {{
                setter.call(el, value);
            }} else {{
                el.value = value;
            }}
        }}
        el.dispatchEvent(new InputEvent('input', {{bubbles:true}}));
        {change_event}
        el.dispatchEvent(new KeyboardEvent('keyup', {{bubbles:true}}));
        "#,
        change_event = change_event
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutating_kinds_require_lease() {
        assert!(ActionKind::Click.is_mutating());
        assert!(ActionKind::Type.is_mutating());
        assert!(!ActionKind::Read.is_mutating());
    }

    #[test]
    fn navigate_and_press_are_selector_free() {
        assert!(ActionKind::Navigate.is_selector_free());
        assert!(ActionKind::Press.is_selector_free());
        assert!(!ActionKind::Click.is_selector_free());
    }

    #[test]
    fn fill_script_includes_change_event() {
        let script = action_script(ActionKind::Fill, "document.querySelector('x')", Some("hello"));
        assert!(script.contains("change"));
        let type_script = action_script(ActionKind::Type, "document.querySelector('x')", Some("hello"));
        assert!(!type_script.contains("new Event('change'"));
    }
}
