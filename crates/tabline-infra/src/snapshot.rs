//! Interactive snapshots and stable ref resolution (SPEC_FULL §3, §4.1
//! "Snapshot algorithm").

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tabline_core::{JsonValue, Result, RuntimeError};

use crate::cdp::CdpRegistry;

const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "textbox",
    "combobox",
    "checkbox",
    "radio",
    "menuitem",
    "tab",
    "switch",
    "slider",
];

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotQuery {
    #[serde(default)]
    pub mode: String, // "interactive" | "full" | "text"
    #[serde(default)]
    pub filter: String, // "auto" | "all" | "interactive"
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub depth: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u32,
}

fn default_max_tokens() -> u32 {
    4_000
}
fn default_max_nodes() -> u32 {
    200
}

impl SnapshotQuery {
    fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.mode,
            self.filter,
            self.selector.as_deref().unwrap_or(""),
            self.depth,
            self.max_tokens,
            self.max_nodes
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub r#ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_node_id: Option<i64>,
    pub role: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aria_label: Option<String>,
    pub disabled: bool,
    pub focused: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct Snapshot {
    pub key: String,
    pub nodes: Vec<NodeDescriptor>,
    pub compact: String,
    pub stats: SnapshotStats,
}

#[derive(Clone, Debug, Serialize)]
pub struct SnapshotStats {
    pub node_count: usize,
    pub truncated: bool,
    pub source: &'static str, // "ax" | "dom"
}

struct TabSnapshots {
    by_key: HashMap<String, Snapshot>,
    ref_map: HashMap<String, NodeDescriptor>,
}

pub struct SnapshotStore {
    tabs: DashMap<String, TabSnapshots>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            tabs: DashMap::new(),
        }
    }

    /// Build a fresh snapshot, preferring the accessibility-tree path and
    /// falling back to a DOM-evaluate query when it yields zero nodes or
    /// errors (SPEC_FULL §4.1 "Snapshot algorithm").
    pub async fn capture(
        &self,
        cdp: &CdpRegistry,
        tab_id: &str,
        query: SnapshotQuery,
    ) -> Result<(Snapshot, bool)> {
        let nodes = match self.capture_ax_tree(cdp, tab_id, &query).await {
            Ok(nodes) if !nodes.is_empty() => (nodes, "ax"),
            _ => (self.capture_dom(cdp, tab_id, &query).await?, "dom"),
        };
        let (mut nodes, source) = nodes;

        let truncated = nodes.len() > query.max_nodes as usize;
        nodes.truncate(query.max_nodes as usize);
        dedupe_refs(&mut nodes);

        let compact = render_compact(&nodes);
        let key = query.key();
        let has_previous = self
            .tabs
            .get(tab_id)
            .map(|t| t.by_key.contains_key(&key))
            .unwrap_or(false);

        let snapshot = Snapshot {
            key: key.clone(),
            nodes: nodes.clone(),
            compact,
            stats: SnapshotStats {
                node_count: nodes.len(),
                truncated,
                source,
            },
        };

        let mut entry = self.tabs.entry(tab_id.to_string()).or_insert_with(|| TabSnapshots {
            by_key: HashMap::new(),
            ref_map: HashMap::new(),
        });
        for node in &nodes {
            entry.ref_map.insert(node.r#ref.clone(), node.clone());
        }
        entry.by_key.insert(key, snapshot.clone());

        Ok((snapshot, has_previous))
    }

    pub fn resolve_ref(&self, tab_id: &str, r#ref: &str) -> Option<NodeDescriptor> {
        self.tabs.get(tab_id).and_then(|t| t.ref_map.get(r#ref).cloned())
    }

    /// Hint-matched typable candidate: the last resolve tier in
    /// `action.rs`'s target priority. Scans every node this tab has ever
    /// surfaced in a snapshot for a non-disabled, typable-role node whose
    /// name/placeholder/ariaLabel contains `hint` (case-insensitive).
    pub fn find_by_hint(&self, tab_id: &str, hint: &str) -> Option<NodeDescriptor> {
        let hint_lower = hint.to_lowercase();
        let tab = self.tabs.get(tab_id)?;
        tab.ref_map
            .values()
            .filter(|n| !n.disabled && is_typable_role(&n.role))
            .find(|n| {
                [n.name.as_str(), n.placeholder.as_deref().unwrap_or(""), n.aria_label.as_deref().unwrap_or("")]
                    .iter()
                    .any(|s| s.to_lowercase().contains(&hint_lower))
            })
            .cloned()
    }

    pub fn clear(&self, tab_id: &str) {
        self.tabs.remove(tab_id);
    }

    async fn capture_ax_tree(
        &self,
        cdp: &CdpRegistry,
        tab_id: &str,
        query: &SnapshotQuery,
    ) -> Result<Vec<NodeDescriptor>> {
        let tree = cdp.full_ax_tree(tab_id).await?;
        let raw_nodes = tree.as_array().cloned().unwrap_or_default();
        let mut out = Vec::new();

        for raw in raw_nodes {
            if raw.get("ignored").and_then(JsonValue::as_bool).unwrap_or(false) {
                continue;
            }
            let Some(backend_node_id) = raw
                .get("backendDOMNodeId")
                .and_then(JsonValue::as_i64)
            else {
                continue;
            };
            let role = raw
                .pointer("/role/value")
                .and_then(JsonValue::as_str)
                .unwrap_or("generic")
                .to_string();
            let focusable = raw
                .get("properties")
                .and_then(JsonValue::as_array)
                .map(|props| {
                    props.iter().any(|p| {
                        p.get("name").and_then(JsonValue::as_str) == Some("focusable")
                            && p.pointer("/value/value").and_then(JsonValue::as_bool) == Some(true)
                    })
                })
                .unwrap_or(false);

            let is_interactive = INTERACTIVE_ROLES.contains(&role.as_str()) || focusable;
            if query.filter != "all" && query.mode != "full" && !is_interactive {
                continue;
            }

            let name = raw
                .pointer("/name/value")
                .and_then(JsonValue::as_str)
                .unwrap_or("")
                .chars()
                .take(180)
                .collect::<String>();

            let Ok(object_id) = cdp.resolve_node(tab_id, backend_node_id).await else {
                continue;
            };
            let live = describe_live_node(cdp, tab_id, &object_id, query.selector.as_deref()).await;
            cdp.release_object(tab_id, object_id).await;
            let Some(live) = live else {
                continue;
            };
            if query.selector.is_some() && !live.in_scope {
                continue;
            }

            out.push(NodeDescriptor {
                r#ref: format!("bn-{backend_node_id}"),
                backend_node_id: Some(backend_node_id),
                role,
                name,
                selector: live.selector,
                placeholder: live.placeholder,
                aria_label: live.aria_label,
                disabled: live.disabled,
                focused: live.focused,
            });
        }
        Ok(out)
    }

    async fn capture_dom(
        &self,
        cdp: &CdpRegistry,
        tab_id: &str,
        query: &SnapshotQuery,
    ) -> Result<Vec<NodeDescriptor>> {
        let scope = query.selector.clone().unwrap_or_else(|| "body".to_string());
        let css = if query.filter == "interactive" {
            "a,button,input,select,textarea,[role],[tabindex]"
        } else {
            "*"
        };
        let script = format!(
            r#"(() => {{
                const scope = document.querySelector({scope:?}) || document.body;
                const els = Array.from(scope.querySelectorAll({css:?})).slice(0, {max});
                return els.map((el, i) => ({{
                    selector: el.tagName.toLowerCase() + ':nth-of-type(' + (i+1) + ')',
                    role: el.getAttribute('role') || el.tagName.toLowerCase(),
                    name: (el.innerText || el.value || '').slice(0, 180),
                    placeholder: el.getAttribute('placeholder'),
                    ariaLabel: el.getAttribute('aria-label'),
                    disabled: !!el.disabled,
                    focused: document.activeElement === el,
                }}));
            }})()"#,
            scope = scope,
            css = css,
            max = query.max_nodes,
        );

        let value = cdp.evaluate(tab_id, &script).await?;
        let items = value
            .as_array()
            .cloned()
            .ok_or_else(|| RuntimeError::internal("dom snapshot script returned non-array"))?;

        Ok(items
            .into_iter()
            .map(|item| {
                let selector = item.get("selector").and_then(JsonValue::as_str).map(String::from);
                let role = item
                    .get("role")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("generic")
                    .to_string();
                let name = item.get("name").and_then(JsonValue::as_str).unwrap_or("").to_string();
                let placeholder = item.get("placeholder").and_then(JsonValue::as_str).map(String::from);
                let aria_label = item.get("ariaLabel").and_then(JsonValue::as_str).map(String::from);
                let disabled = item.get("disabled").and_then(JsonValue::as_bool).unwrap_or(false);
                let focused = item.get("focused").and_then(JsonValue::as_bool).unwrap_or(false);

                NodeDescriptor {
                    r#ref: fingerprint_ref(&selector, &role, &name, &placeholder, &aria_label),
                    backend_node_id: None,
                    role,
                    name,
                    selector,
                    placeholder,
                    aria_label,
                    disabled,
                    focused,
                }
            })
            .collect())
    }
}

struct LiveNode {
    in_scope: bool,
    selector: Option<String>,
    placeholder: Option<String>,
    aria_label: Option<String>,
    disabled: bool,
    focused: bool,
}

/// Derive `selector`/`placeholder`/`ariaLabel`/`disabled`/`focused` from the
/// live DOM node a resolved AX node's `RemoteObjectId` points at, via
/// `Runtime.callFunctionOn` bound to the element (the same pattern
/// `action.rs`'s `run_via_backend_node` uses). `scope_selector`, when set,
/// is checked with `Element.closest` so the AX path can honor
/// `query.selector` scoping the same way the DOM fallback does.
async fn describe_live_node(
    cdp: &CdpRegistry,
    tab_id: &str,
    object_id: &chromiumoxide::cdp::browser_protocol::runtime::RemoteObjectId,
    scope_selector: Option<&str>,
) -> Option<LiveNode> {
    let scope_json = serde_json::to_string(&scope_selector).unwrap_or_else(|_| "null".to_string());
    let function_declaration = format!(
        r#"function() {{
            const scope = {scope_json};
            const inScope = scope ? !!this.closest(scope) : true;
            let selector;
            if (this.id) {{
                selector = '#' + CSS.escape(this.id);
            }} else if (typeof this.className === 'string' && this.className.trim()) {{
                selector = this.tagName.toLowerCase() + '.' + this.className.trim().split(/\s+/).join('.');
            }} else {{
                selector = this.tagName.toLowerCase();
            }}
            return {{
                inScope,
                selector,
                placeholder: this.getAttribute('placeholder'),
                ariaLabel: this.getAttribute('aria-label'),
                disabled: !!this.disabled,
                focused: document.activeElement === this,
            }};
        }}"#
    );

    let result = cdp.call_function_on(tab_id, object_id, &function_declaration, vec![]).await.ok()?;
    Some(LiveNode {
        in_scope: result.get("inScope").and_then(JsonValue::as_bool).unwrap_or(true),
        selector: result.get("selector").and_then(JsonValue::as_str).map(String::from),
        placeholder: result.get("placeholder").and_then(JsonValue::as_str).map(String::from),
        aria_label: result.get("ariaLabel").and_then(JsonValue::as_str).map(String::from),
        disabled: result.get("disabled").and_then(JsonValue::as_bool).unwrap_or(false),
        focused: result.get("focused").and_then(JsonValue::as_bool).unwrap_or(false),
    })
}

fn is_typable_role(role: &str) -> bool {
    matches!(role, "textbox" | "combobox" | "searchbox" | "input" | "textarea")
}

fn fingerprint_ref(
    selector: &Option<String>,
    role: &str,
    name: &str,
    placeholder: &Option<String>,
    aria_label: &Option<String>,
) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    selector.hash(&mut hasher);
    role.hash(&mut hasher);
    name.hash(&mut hasher);
    placeholder.hash(&mut hasher);
    aria_label.hash(&mut hasher);
    format!("fp-{:x}", hasher.finish())
}

fn dedupe_refs(nodes: &mut [NodeDescriptor]) {
    let mut seen: HashMap<String, u32> = HashMap::new();
    for node in nodes.iter_mut() {
        let count = seen.entry(node.r#ref.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            node.r#ref = format!("{}-{}", node.r#ref, count);
        }
    }
}

fn render_compact(nodes: &[NodeDescriptor]) -> String {
    nodes
        .iter()
        .map(|n| {
            let mut flags = Vec::new();
            if n.disabled {
                flags.push("disabled");
            }
            if n.focused {
                flags.push("focused");
            }
            let flag_str = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(","))
            };
            format!("[{}] {} \"{}\"{}", n.r#ref, n.role, n.name, flag_str)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_refs_suffixes_duplicates() {
        let mut nodes = vec![
            NodeDescriptor {
                r#ref: "fp-1".into(),
                backend_node_id: None,
                role: "button".into(),
                name: "Go".into(),
                selector: None,
                placeholder: None,
                aria_label: None,
                disabled: false,
                focused: false,
            },
            NodeDescriptor {
                r#ref: "fp-1".into(),
                backend_node_id: None,
                role: "button".into(),
                name: "Go".into(),
                selector: None,
                placeholder: None,
                aria_label: None,
                disabled: false,
                focused: false,
            },
        ];
        dedupe_refs(&mut nodes);
        assert_eq!(nodes[0].r#ref, "fp-1");
        assert_eq!(nodes[1].r#ref, "fp-1-2");
    }

    #[test]
    fn compact_render_includes_flags() {
        let nodes = vec![NodeDescriptor {
            r#ref: "bn-1".into(),
            backend_node_id: Some(1),
            role: "textbox".into(),
            name: "Search".into(),
            selector: None,
            placeholder: None,
            aria_label: None,
            disabled: true,
            focused: true,
        }];
        let compact = render_compact(&nodes);
        assert!(compact.contains("disabled"));
        assert!(compact.contains("focused"));
    }
}
