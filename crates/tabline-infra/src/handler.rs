//! The Infra Handler (C1): the single typed entry point over
//! config/bridge/lease/cdp, returning the `{ok:true,data}|{ok:false,error}`
//! envelope (SPEC_FULL §4.1).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chromiumoxide::Browser;
use serde::Serialize;
use tabline_core::{Config, JsonValue, Lease, Result, RuntimeError};
use tokio::sync::RwLock;

use crate::action::{execute_action, ActionRequest, ActionResult};
use crate::bridge::{resolve_invoke_timeout_ms, BridgeClient};
use crate::cdp::CdpRegistry;
use crate::lease::LeaseTable;
use crate::snapshot::{Snapshot, SnapshotQuery, SnapshotStore};
use crate::verify::{verify, VerifyRequest, VerifyResult};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Serialize)]
pub struct SnapshotResponse {
    pub snapshot: Snapshot,
    #[serde(flatten)]
    pub diff: SnapshotDiff,
}

#[derive(Serialize)]
pub struct SnapshotDiff {
    pub has_previous: bool,
}

/// Owns every C1 subsystem for one runtime instance: config, the bridge WS
/// client, the CDP registry, the lease table, and per-tab snapshot state.
pub struct InfraHandler {
    config: RwLock<Config>,
    bridge: Arc<BridgeClient>,
    cdp: CdpRegistry,
    leases: LeaseTable,
    snapshots: SnapshotStore,
}

impl InfraHandler {
    pub fn new(config: Config) -> Self {
        let bridge = BridgeClient::new(config.bridge_url.clone(), config.bridge_token.clone());
        Self {
            config: RwLock::new(config),
            bridge,
            cdp: CdpRegistry::new(),
            leases: LeaseTable::new(),
            snapshots: SnapshotStore::new(),
        }
    }

    pub async fn set_browser(&self, browser: Browser) {
        self.cdp.set_browser(browser).await;
    }

    /// Background tick: detach debugger sessions idle past the auto-detach
    /// window. Callers run this on an interval (SPEC_FULL §4.1).
    pub async fn sweep_idle(&self) {
        self.cdp.sweep_idle().await;
    }

    pub async fn config_get(&self) -> Config {
        self.config.read().await.clone()
    }

    pub async fn config_save(&self, patch: &JsonValue) -> Result<Config> {
        let mut config = self.config.write().await;
        config
            .apply_patch(patch)
            .map_err(RuntimeError::args)?;
        Ok(config.clone())
    }

    pub async fn bridge_connect(&self, force: bool) -> Result<()> {
        self.bridge.connect(force).await
    }

    /// Reject every pending bridge invoke with `E_BRIDGE_INTERRUPTED`, used
    /// when a steer prompt preempts in-flight tool calls (SPEC_FULL §4.4
    /// step 2). The pending-invoke table is not session-scoped, so this
    /// aborts invokes for every session sharing the one bridge connection.
    pub fn bridge_abort_pending(&self, reason: &str) {
        self.bridge.abort_all(reason);
    }

    pub async fn bridge_invoke(
        &self,
        tool: &str,
        args: JsonValue,
        session_id: Option<String>,
        parent_session_id: Option<String>,
        agent_id: Option<String>,
        hint_timeout_ms: Option<u32>,
    ) -> Result<JsonValue> {
        let configured_ms = self.config.read().await.bridge_invoke_timeout_ms;
        let timeout_ms = resolve_invoke_timeout_ms(configured_ms, hint_timeout_ms);
        self.bridge
            .invoke(tool, args, session_id, parent_session_id, agent_id, timeout_ms)
            .await
    }

    pub fn lease_acquire(&self, tab_id: &str, owner: &str, ttl_ms: i64) -> Result<Lease> {
        self.leases.acquire(tab_id, owner, ttl_ms, now_ms())
    }

    pub fn lease_heartbeat(&self, tab_id: &str, owner: &str, ttl_ms: i64) -> Result<Lease> {
        self.leases.heartbeat(tab_id, owner, ttl_ms, now_ms())
    }

    pub fn lease_release(&self, tab_id: &str, owner: &str) -> (bool, Option<&'static str>) {
        self.leases.release(tab_id, owner, now_ms())
    }

    pub fn lease_status(&self, tab_id: &str) -> Option<Lease> {
        self.leases.status(tab_id, now_ms())
    }

    /// Attach the debugger (idempotent) and observe the page without
    /// capturing an interactive snapshot — a cheap url/title/text probe
    /// (SPEC_FULL §4.1 `cdp.observe`).
    pub async fn cdp_observe(&self, tab_id: &str) -> Result<JsonValue> {
        self.cdp.attach(tab_id).await?;
        self.cdp
            .evaluate(
                tab_id,
                "(() => ({url: location.href, title: document.title}))()",
            )
            .await
    }

    pub async fn cdp_snapshot(&self, tab_id: &str, query: SnapshotQuery) -> Result<SnapshotResponse> {
        self.cdp.attach(tab_id).await?;
        let (snapshot, has_previous) = self.snapshots.capture(&self.cdp, tab_id, query).await?;
        Ok(SnapshotResponse {
            snapshot,
            diff: SnapshotDiff { has_previous },
        })
    }

    pub async fn cdp_action(&self, tab_id: &str, req: ActionRequest) -> Result<ActionResult> {
        self.cdp.attach(tab_id).await?;
        execute_action(&self.cdp, &self.leases, &self.snapshots, tab_id, req, now_ms()).await
    }

    /// `cdp.execute` is a raw-script escape hatch: evaluate arbitrary JS in
    /// the tab's main-world context under the owner's lease, for actions the
    /// typed `cdp.action` vocabulary doesn't cover.
    pub async fn cdp_execute(&self, tab_id: &str, owner: &str, script: &str) -> Result<JsonValue> {
        if !self.leases.is_held_by(tab_id, owner, now_ms()) {
            return Err(RuntimeError::busy("cdp.execute requires a live lease for this owner"));
        }
        self.cdp.attach(tab_id).await?;
        self.cdp.evaluate(tab_id, script).await
    }

    pub async fn cdp_verify(&self, tab_id: &str, req: VerifyRequest) -> Result<VerifyResult> {
        self.cdp.attach(tab_id).await?;
        verify(&self.cdp, tab_id, req).await
    }

    /// Detach the debugger and clear lease/snapshot state for the tab
    /// (SPEC_FULL §4.1 failure semantics: tab close/detach clears both).
    pub async fn cdp_detach(&self, tab_id: &str) {
        self.cdp.detach(tab_id).await;
        self.snapshots.clear(tab_id);
        self.leases.clear(tab_id);
    }
}
