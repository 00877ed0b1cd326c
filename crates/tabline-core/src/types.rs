//! The data model shared by every component: sessions, the entry DAG,
//! leases, pending invokes, run state, and LLM routes (SPEC_FULL §3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Cheaply-cloneable interned session id.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Arc<str>);

impl EntryId {
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Reason a compaction entry was produced.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompactionReason {
    Overflow,
    Threshold,
    Manual,
}

/// One append-only node in a session's DAG (SPEC_FULL §3 Entry).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EntryBody {
    Message {
        role: Role,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
    },
    Compaction {
        reason: CompactionReason,
        summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_summary: Option<String>,
        first_kept_entry_id: EntryId,
        tokens_before: u64,
        tokens_after: u64,
    },
    Custom {
        data: serde_json::Value,
    },
    Label {
        name: String,
    },
    BranchSummary {
        summary: String,
    },
    CustomMessage {
        role: Role,
        text: String,
    },
}

impl EntryBody {
    /// Whether this variant is a valid cut point for compaction (SPEC_FULL
    /// §4.2): anything except `tool` messages, `branch_summary`, and
    /// `custom_message`.
    pub fn is_valid_cut_point(&self) -> bool {
        match self {
            EntryBody::Message { role, .. } => !matches!(role, Role::Tool),
            EntryBody::BranchSummary { .. } | EntryBody::CustomMessage { .. } => false,
            _ => true,
        }
    }

    /// Whether this entry starts a new conversational turn.
    pub fn is_turn_boundary(&self) -> bool {
        matches!(
            self,
            EntryBody::Message {
                role: Role::User | Role::System,
                ..
            }
        )
    }

    /// Best-effort text used for token estimation and summarization input.
    pub fn text(&self) -> &str {
        match self {
            EntryBody::Message { text, .. } => text,
            EntryBody::Compaction { summary, .. } => summary,
            EntryBody::Label { name } => name,
            EntryBody::BranchSummary { summary } => summary,
            EntryBody::CustomMessage { text, .. } => text,
            EntryBody::Custom { .. } => "",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<EntryId>,
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: EntryBody,
}

impl Entry {
    pub fn new(parent_id: Option<EntryId>, body: EntryBody) -> Self {
        Self {
            id: EntryId::generate(),
            parent_id,
            timestamp: now_ms(),
            body,
        }
    }
}

/// Metadata bag carried on a session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub shared_tabs: Vec<String>,
    #[serde(default)]
    pub primary_tab_id: Option<String>,
    #[serde(default)]
    pub llm_profile: Option<String>,
    #[serde(default)]
    pub llm_role: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub title_source: Option<String>,
    #[serde(default)]
    pub forked_from: Option<SessionId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    #[serde(default)]
    pub parent: Option<SessionId>,
    pub created_at: i64,
    #[serde(default)]
    pub leaf: Option<EntryId>,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            parent: None,
            created_at: now_ms(),
            leaf: None,
            metadata: SessionMetadata::default(),
        }
    }
}

/// `{tabId, owner, leaseId, createdAt, heartbeatAt, expiresAt}` (SPEC_FULL §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lease {
    pub tab_id: String,
    pub owner: String,
    pub lease_id: String,
    pub created_at: i64,
    pub heartbeat_at: i64,
    pub expires_at: i64,
}

impl Lease {
    pub fn is_live_at(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

/// `{running, paused, stopped, retry{...}, queue{...}}` (SPEC_FULL §3).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetryState {
    pub active: bool,
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueState {
    pub steer: u32,
    pub follow_up: u32,
    pub total: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunState {
    pub running: bool,
    pub paused: bool,
    pub stopped: bool,
    pub retry: RetryState,
    pub queue: QueueState,
}

impl RunState {
    /// Invariant: `Stopped ⇒ ¬Running` is enforced by construction, not just
    /// by convention — every mutator that sets `stopped` also clears
    /// `running` in the same call (see `tabline-agent::state`).
    pub fn assert_invariant(&self) {
        debug_assert!(!(self.stopped && self.running));
    }
}

/// Escalation policy for LLM profile chains (SPEC_FULL §4.3/§9).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPolicy {
    UpgradeOnly,
    Disabled,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        EscalationPolicy::UpgradeOnly
    }
}

/// Resolved LLM route for a run (SPEC_FULL §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmRoute {
    pub profile: String,
    pub provider: String,
    pub llm_model: String,
    pub role: String,
    pub llm_timeout_ms: u64,
    pub llm_retry_max_attempts: u32,
    pub llm_max_retry_delay_ms: u64,
    pub ordered_profiles: Vec<String>,
    pub escalation_policy: EscalationPolicy,
    /// Index into `ordered_profiles` for the currently active profile.
    #[serde(default)]
    pub profile_index: usize,
}

impl LlmRoute {
    /// Advance to the next profile in the chain, if one exists and policy
    /// allows it. Returns `true` if the route was escalated. Profile
    /// escalation is monotone (SPEC_FULL §8): this never decreases
    /// `profile_index`.
    pub fn escalate(&mut self) -> bool {
        if self.escalation_policy == EscalationPolicy::Disabled {
            return false;
        }
        if self.profile_index + 1 < self.ordered_profiles.len() {
            self.profile_index += 1;
            self.profile = self.ordered_profiles[self.profile_index].clone();
            true
        } else {
            false
        }
    }
}

pub type JsonValue = serde_json::Value;
pub type JsonMap = HashMap<String, JsonValue>;
