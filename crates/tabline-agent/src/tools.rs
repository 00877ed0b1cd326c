//! Tool-call dispatch (SPEC_FULL §4.4 step 7): resolve each LLM tool call to
//! bridge-shelled processes, bridge-mediated filesystem ops, platform tab
//! ops, or C1 browser actions, and return a structured success/failure.

use std::sync::Arc;

use tabline_core::{JsonValue, Result, RuntimeError};
use tabline_infra::{ActionRequest, InfraHandler, SnapshotQuery, VerifyRequest};

/// One resolved tool-call target (SPEC_FULL §4.4 step 7's four buckets).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolTarget {
    BridgeShell,
    BridgeFile,
    PlatformTab,
    Browser,
}

pub fn resolve_target(tool_name: &str) -> Result<ToolTarget> {
    match tool_name {
        "bash" => Ok(ToolTarget::BridgeShell),
        "read_file" | "write_file" | "edit_file" => Ok(ToolTarget::BridgeFile),
        "list_tabs" | "open_tab" => Ok(ToolTarget::PlatformTab),
        "snapshot" | "browser_action" | "browser_verify" => Ok(ToolTarget::Browser),
        other => Err(RuntimeError::tool_unsupported(format!(
            "unknown tool: {other}"
        ))),
    }
}

/// Whether a tool mutates shared state, used to classify `E_CLIENT_TIMEOUT`
/// failures (SPEC_FULL §4.4 step 8).
pub fn is_side_effecting(tool_name: &str) -> bool {
    !matches!(tool_name, "read_file" | "list_tabs" | "snapshot")
}

pub struct ToolDispatcher {
    infra: Arc<InfraHandler>,
}

impl ToolDispatcher {
    pub fn new(infra: Arc<InfraHandler>) -> Self {
        Self { infra }
    }

    /// Reject in-flight bridge invokes, used when a steer prompt preempts a
    /// running tool batch (SPEC_FULL §4.4 step 2).
    pub fn abort_pending(&self, reason: &str) {
        self.infra.bridge_abort_pending(reason);
    }

    pub async fn dispatch(
        &self,
        tool_name: &str,
        args: JsonValue,
        session_id: &str,
        owner: &str,
    ) -> Result<JsonValue> {
        match resolve_target(tool_name)? {
            ToolTarget::BridgeShell | ToolTarget::BridgeFile | ToolTarget::PlatformTab => {
                self.infra
                    .bridge_invoke(
                        tool_name,
                        args,
                        Some(session_id.to_string()),
                        None,
                        Some(owner.to_string()),
                        None,
                    )
                    .await
            }
            ToolTarget::Browser => self.dispatch_browser(tool_name, args, owner).await,
        }
    }

    async fn dispatch_browser(
        &self,
        tool_name: &str,
        args: JsonValue,
        owner: &str,
    ) -> Result<JsonValue> {
        let tab_id = args
            .get("tabId")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| RuntimeError::args("browser tool requires tabId"))?
            .to_string();

        match tool_name {
            "snapshot" => {
                let query: SnapshotQuery = serde_json::from_value(args.clone())
                    .map_err(|e| RuntimeError::args(format!("invalid snapshot args: {e}")))?;
                let result = self.infra.cdp_snapshot(&tab_id, query).await?;
                serde_json::to_value(&result).map_err(|e| RuntimeError::internal(e.to_string()))
            }
            "browser_action" => {
                let mut req: ActionRequest = serde_json::from_value(args.clone())
                    .map_err(|e| RuntimeError::args(format!("invalid action args: {e}")))?;
                if req.owner.is_empty() {
                    req.owner = owner.to_string();
                }
                let result = self.infra.cdp_action(&tab_id, req).await?;
                serde_json::to_value(&result).map_err(|e| RuntimeError::internal(e.to_string()))
            }
            "browser_verify" => {
                let req: VerifyRequest = serde_json::from_value(args.clone())
                    .map_err(|e| RuntimeError::args(format!("invalid verify args: {e}")))?;
                let result = self.infra.cdp_verify(&tab_id, req).await?;
                serde_json::to_value(&result).map_err(|e| RuntimeError::internal(e.to_string()))
            }
            _ => Err(RuntimeError::tool_unsupported(format!(
                "unhandled browser tool: {tool_name}"
            ))),
        }
    }
}

/// Whether the tool call set requires *browser proof* before an assistant
/// can end the loop with no tool calls (SPEC_FULL §4.4 step 6): at least one
/// of `snapshot`/`browser_action`/`browser_verify` must have succeeded this
/// run.
pub fn is_browser_tool(tool_name: &str) -> bool {
    matches!(tool_name, "snapshot" | "browser_action" | "browser_verify")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_buckets() {
        assert_eq!(resolve_target("bash").unwrap(), ToolTarget::BridgeShell);
        assert_eq!(resolve_target("read_file").unwrap(), ToolTarget::BridgeFile);
        assert_eq!(resolve_target("open_tab").unwrap(), ToolTarget::PlatformTab);
        assert_eq!(resolve_target("snapshot").unwrap(), ToolTarget::Browser);
        assert!(resolve_target("unknown_tool").is_err());
    }

    #[test]
    fn browser_tools_require_proof() {
        assert!(is_browser_tool("browser_action"));
        assert!(!is_browser_tool("bash"));
    }
}
