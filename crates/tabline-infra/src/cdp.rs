//! CDP transport and per-tab attach/detach bookkeeping (SPEC_FULL §4.1A).
//!
//! Speaks CDP through `chromiumoxide`'s typed command structs rather than
//! hand-rolled JSON, per this workspace's "tagged variants everywhere" rule.
//! One `chromiumoxide::Browser` handle is owned per runtime instance; each
//! attached tab gets an inactivity-based auto-detach timer.

use std::collections::HashMap;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::accessibility::GetFullAxTreeParams;
use chromiumoxide::cdp::browser_protocol::dom::ResolveNodeParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::runtime::{
    CallFunctionOnParams, EvaluateParams, RemoteObjectId, ReleaseObjectParams,
};
use chromiumoxide::{Browser, Page};
use tabline_core::{JsonValue, Result, RuntimeError};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

const AUTO_DETACH_IDLE: Duration = Duration::from_secs(30);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

struct AttachedTab {
    page: Page,
    last_active: Instant,
}

/// Owns the browser handle and the set of currently attached tabs.
pub struct CdpRegistry {
    browser: Mutex<Option<Browser>>,
    tabs: RwLock<HashMap<String, AttachedTab>>,
}

impl Default for CdpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CdpRegistry {
    pub fn new() -> Self {
        Self {
            browser: Mutex::new(None),
            tabs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_browser(&self, browser: Browser) {
        *self.browser.lock().await = Some(browser);
    }

    /// Attach the debugger to `tab_id` if not already attached, enabling
    /// `{Network, Runtime, DOM, Page, Log, Accessibility}` (Accessibility is
    /// best-effort: a refusal is swallowed, not surfaced).
    pub async fn attach(&self, tab_id: &str) -> Result<()> {
        if self.tabs.read().await.contains_key(tab_id) {
            self.touch(tab_id).await;
            return Ok(());
        }

        let browser = self.browser.lock().await;
        let browser = browser
            .as_ref()
            .ok_or_else(|| RuntimeError::cdp_attach("no browser handle configured"))?;

        let page = browser
            .pages()
            .await
            .map_err(|e| RuntimeError::cdp_attach(e.to_string()))?
            .into_iter()
            .find(|p| p.target_id().inner() == tab_id)
            .ok_or_else(|| RuntimeError::no_tab(format!("no such tab: {tab_id}")))?;

        if let Err(e) = page.enable_accessibility().await {
            warn!(tab_id, error = %e, "accessibility domain refused, continuing without it");
        }

        self.tabs.write().await.insert(
            tab_id.to_string(),
            AttachedTab {
                page,
                last_active: Instant::now(),
            },
        );
        Ok(())
    }

    pub async fn detach(&self, tab_id: &str) {
        self.tabs.write().await.remove(tab_id);
    }

    async fn touch(&self, tab_id: &str) {
        if let Some(tab) = self.tabs.write().await.get_mut(tab_id) {
            tab.last_active = Instant::now();
        }
    }

    /// Sweep tabs idle for more than 30s. Callers run this on a periodic
    /// tick (SPEC_FULL §4.1: "a background auto-detach timer (30s of
    /// inactivity) will detach the debugger").
    pub async fn sweep_idle(&self) {
        let mut tabs = self.tabs.write().await;
        let now = Instant::now();
        tabs.retain(|tab_id, tab| {
            let alive = now.duration_since(tab.last_active) < AUTO_DETACH_IDLE;
            if !alive {
                debug!(tab_id, "auto-detaching idle tab");
            }
            alive
        });
    }

    async fn page(&self, tab_id: &str) -> Result<Page> {
        self.touch(tab_id).await;
        self.tabs
            .read()
            .await
            .get(tab_id)
            .map(|t| t.page.clone())
            .ok_or_else(|| RuntimeError::no_tab(format!("tab not attached: {tab_id}")))
    }

    pub async fn navigate(&self, tab_id: &str, url: &str) -> Result<()> {
        let page = self.page(tab_id).await?;
        exec_with_timeout(page.execute(NavigateParams::new(url)), RuntimeError::cdp_aborted).await?;
        Ok(())
    }

    pub async fn evaluate(&self, tab_id: &str, expression: &str) -> Result<JsonValue> {
        let page = self.page(tab_id).await?;
        let params = EvaluateParams::builder()
            .expression(expression)
            .return_by_value(true)
            .build()
            .map_err(RuntimeError::internal)?;
        let result = exec_with_timeout(page.execute(params), RuntimeError::cdp_timeout).await?;
        Ok(result.result.value.clone().unwrap_or(JsonValue::Null))
    }

    pub async fn resolve_node(&self, tab_id: &str, backend_node_id: i64) -> Result<RemoteObjectId> {
        let page = self.page(tab_id).await?;
        let params = ResolveNodeParams::builder()
            .backend_node_id(backend_node_id)
            .build();
        let result = exec_with_timeout(page.execute(params), RuntimeError::cdp_resolve_node).await?;
        result
            .object
            .object_id
            .clone()
            .ok_or_else(|| RuntimeError::cdp_resolve_node("resolved node has no remote object id"))
    }

    pub async fn call_function_on(
        &self,
        tab_id: &str,
        object_id: &RemoteObjectId,
        function_declaration: &str,
        arguments: Vec<JsonValue>,
    ) -> Result<JsonValue> {
        let page = self.page(tab_id).await?;
        let args = arguments
            .into_iter()
            .map(|v| chromiumoxide::cdp::browser_protocol::runtime::CallArgument::builder().value(v).build())
            .collect::<Vec<_>>();
        let params = CallFunctionOnParams::builder()
            .function_declaration(function_declaration)
            .object_id(object_id.clone())
            .arguments(args)
            .return_by_value(true)
            .build()
            .map_err(RuntimeError::internal)?;
        let result = exec_with_timeout(page.execute(params), RuntimeError::cdp_timeout).await?;
        Ok(result.result.value.clone().unwrap_or(JsonValue::Null))
    }

    pub async fn release_object(&self, tab_id: &str, object_id: RemoteObjectId) {
        if let Ok(page) = self.page(tab_id).await {
            let params = ReleaseObjectParams::new(object_id);
            let _ = page.execute(params).await;
        }
    }

    pub async fn full_ax_tree(&self, tab_id: &str) -> Result<JsonValue> {
        let page = self.page(tab_id).await?;
        let result = exec_with_timeout(page.execute(GetFullAxTreeParams::default()), RuntimeError::axtree_empty).await?;
        serde_json::to_value(&result.nodes).map_err(|e| RuntimeError::internal(e.to_string()))
    }
}

/// Every CDP command carries a per-call timeout (SPEC_FULL §4.1); `on_err`
/// builds the right `RuntimeError` kind for the caller's situation (attach,
/// resolve, generic timeout, ...) whether the command itself errored or the
/// timeout elapsed first.
async fn exec_with_timeout<F, T, E>(fut: F, on_err: impl FnOnce(String) -> RuntimeError) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(DEFAULT_COMMAND_TIMEOUT, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(on_err(e.to_string())),
        Err(_) => Err(on_err("cdp command timed out".to_string())),
    }
}
