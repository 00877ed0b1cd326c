//! Outbound bridge WebSocket client (SPEC_FULL §4.1 `bridge.*`).
//!
//! Reader/writer split-task pattern grounded on this workspace's TUI-over-WS
//! client: one task drains the socket into an event channel, one task
//! forwards outbound frames, and this type owns the pending-invoke table the
//! two tasks correlate against.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tabline_core::protocol::{BridgeErrorDetail, BridgeInvokeFrame, BridgeReplyFrame};
use tabline_core::{JsonValue, Result, RuntimeError};
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use uuid::Uuid;

struct PendingInvoke {
    tx: oneshot::Sender<std::result::Result<JsonValue, RuntimeError>>,
}

pub struct BridgeClient {
    url_base: String,
    token: Option<String>,
    connected: AtomicBool,
    connecting: Mutex<()>,
    pending: DashMap<String, PendingInvoke>,
    outbound: Mutex<Option<tokio::sync::mpsc::UnboundedSender<WsMessage>>>,
}

impl BridgeClient {
    pub fn new(url_base: impl Into<String>, token: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            url_base: url_base.into(),
            token,
            connected: AtomicBool::new(false),
            connecting: Mutex::new(()),
            pending: DashMap::new(),
            outbound: Mutex::new(None),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Single-flight: concurrent callers share the same in-flight connect
    /// attempt via the `connecting` mutex; `force` tears down any existing
    /// connection first.
    pub async fn connect(self: &Arc<Self>, force: bool) -> Result<()> {
        let _guard = self.connecting.lock().await;
        if self.is_connected() && !force {
            return Ok(());
        }

        let url = match &self.token {
            Some(t) => format!("{}?token={}", self.url_base, t),
            None => self.url_base.clone(),
        };

        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|e| RuntimeError::bridge_disconnected(format!("connect failed: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<WsMessage>();
        *self.outbound.lock().await = Some(out_tx);
        self.connected.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => this.handle_frame(&text),
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            this.on_disconnect();
        });

        Ok(())
    }

    fn handle_frame(&self, text: &str) {
        let Ok(frame) = serde_json::from_str::<BridgeReplyFrame>(text) else {
            warn!("bridge: malformed frame: {text}");
            return;
        };
        match frame {
            BridgeReplyFrame::Invoke { id, ok, error, data } => {
                if let Some((_, pending)) = self.pending.remove(&id) {
                    let result = if ok {
                        Ok(data)
                    } else {
                        Err(bridge_error_to_runtime(error))
                    };
                    let _ = pending.tx.send(result);
                }
            }
            BridgeReplyFrame::Event { frame_type, payload } => {
                debug!(frame_type, ?payload, "bridge event");
            }
        }
    }

    fn on_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for entry in self.pending.iter() {
            debug!(id = %entry.key(), "rejecting pending invoke on disconnect");
        }
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending
                    .tx
                    .send(Err(RuntimeError::bridge_disconnected("bridge connection closed")));
            }
        }
    }

    /// Correlate by frame id, send the invoke frame, and wait for the
    /// matching reply or a client-side timeout (SPEC_FULL §4.1
    /// `bridge.invoke`).
    pub async fn invoke(
        &self,
        tool: &str,
        args: JsonValue,
        session_id: Option<String>,
        parent_session_id: Option<String>,
        agent_id: Option<String>,
        timeout_ms: u64,
    ) -> Result<JsonValue> {
        if !self.is_connected() {
            return Err(RuntimeError::bridge_disconnected("bridge not connected"));
        }

        let id = Uuid::new_v4().to_string();
        let mut frame = BridgeInvokeFrame::new(&id, tool, args);
        frame.session_id = session_id;
        frame.parent_session_id = parent_session_id;
        frame.agent_id = agent_id;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), PendingInvoke { tx });

        let text = serde_json::to_string(&frame)
            .map_err(|e| RuntimeError::internal(format!("failed to encode invoke frame: {e}")))?;
        {
            let guard = self.outbound.lock().await;
            let Some(sender) = guard.as_ref() else {
                self.pending.remove(&id);
                return Err(RuntimeError::bridge_disconnected("bridge not connected"));
            };
            if sender.send(WsMessage::Text(text)).is_err() {
                self.pending.remove(&id);
                return Err(RuntimeError::bridge_disconnected("bridge writer task gone"));
            }
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RuntimeError::bridge_disconnected("invoke channel dropped")),
            Err(_) => {
                self.pending.remove(&id);
                Err(RuntimeError::client_timeout(format!(
                    "bridge invoke {id} timed out after {timeout_ms}ms"
                )))
            }
        }
    }

    /// Reject every pending invoke with a caller-supplied non-retryable code,
    /// used when a steer interrupts all in-flight tool calls for a session
    /// (SPEC_FULL §4.4 step 2).
    pub fn abort_all(&self, reason: &str) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(RuntimeError::bridge_interrupted(reason)));
            }
        }
    }
}

fn bridge_error_to_runtime(error: Option<BridgeErrorDetail>) -> RuntimeError {
    let Some(error) = error else {
        return RuntimeError::internal("bridge invoke failed with no error detail");
    };
    let retryable = matches!(
        error.code.as_str(),
        "E_BUSY" | "E_TIMEOUT" | "E_CLIENT_TIMEOUT" | "E_BRIDGE_DISCONNECTED"
    );
    let mut err = RuntimeError::new(error.code, error.message, retryable);
    if let Some(details) = error.details {
        err = err.with_details(details);
    }
    err
}

/// Clamp the client-side invoke timeout to `(configured, hintTimeout+2s)`,
/// bounded by a hard ceiling (SPEC_FULL §4.1 `bridge.invoke`).
pub fn resolve_invoke_timeout_ms(configured_ms: u32, hint_timeout_ms: Option<u32>) -> u64 {
    const HARD_MAX_MS: u64 = 600_000;
    let floor = configured_ms as u64;
    let with_hint = hint_timeout_ms
        .map(|h| (h as u64).saturating_add(2_000))
        .unwrap_or(floor);
    floor.max(with_hint).min(HARD_MAX_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_timeout_respects_hint_and_hard_cap() {
        assert_eq!(resolve_invoke_timeout_ms(120_000, None), 120_000);
        assert_eq!(resolve_invoke_timeout_ms(120_000, Some(5_000)), 120_000);
        assert_eq!(resolve_invoke_timeout_ms(10_000, Some(500_000)), 502_000);
        assert_eq!(resolve_invoke_timeout_ms(10_000, Some(10_000_000)), 600_000);
    }
}
