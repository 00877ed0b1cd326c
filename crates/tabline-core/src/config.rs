//! Runtime configuration (SPEC_FULL §6 Configuration table).
//!
//! `config.get`/`config.save` in C1 read and write this struct. Numeric
//! fields are clamped to their documented ranges on every write; profile
//! data round-trips as opaque JSON since its shape is caller-defined.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::JsonValue;

fn clamp_u32(v: u32, lo: u32, hi: u32) -> u32 {
    v.clamp(lo, hi)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub bridge_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_token: Option<String>,
    pub llm_api_base: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_default_profile: String,
    pub llm_profiles: Vec<JsonValue>,
    pub llm_profile_chains: HashMap<String, Vec<String>>,
    pub llm_escalation_policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_system_prompt_custom: Option<String>,
    pub max_steps: u32,
    pub auto_title_interval: u32,
    pub bridge_invoke_timeout_ms: u32,
    pub llm_timeout_ms: u32,
    pub llm_retry_max_attempts: u32,
    pub llm_max_retry_delay_ms: u32,
    /// Token ceiling the compaction engine (C2) sizes its threshold and
    /// keep-recent-tail budgets from (SPEC_FULL §4.2).
    pub compaction_max_tokens: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge_url: "ws://127.0.0.1:8787/ws".to_string(),
            bridge_token: None,
            llm_api_base: String::new(),
            llm_api_key: None,
            llm_model: String::new(),
            llm_default_profile: "default".to_string(),
            llm_profiles: Vec::new(),
            llm_profile_chains: HashMap::new(),
            llm_escalation_policy: "upgrade_only".to_string(),
            llm_system_prompt_custom: None,
            max_steps: 100,
            auto_title_interval: 10,
            bridge_invoke_timeout_ms: 120_000,
            llm_timeout_ms: 120_000,
            llm_retry_max_attempts: 2,
            llm_max_retry_delay_ms: 60_000,
            compaction_max_tokens: 128_000,
        }
    }
}

impl Config {
    /// Clamp every ranged numeric field to the bounds in SPEC_FULL §6.
    /// `llmSystemPromptCustom` is truncated to 12000 chars rather than
    /// rejected, matching the "numeric ranges are clamped" rule extended to
    /// the one length-bounded string field.
    pub fn clamp(&mut self) {
        self.max_steps = clamp_u32(self.max_steps, 1, 500);
        self.auto_title_interval = clamp_u32(self.auto_title_interval, 0, 100);
        self.bridge_invoke_timeout_ms = clamp_u32(self.bridge_invoke_timeout_ms, 1_000, 300_000);
        self.llm_timeout_ms = clamp_u32(self.llm_timeout_ms, 1_000, 300_000);
        self.llm_retry_max_attempts = clamp_u32(self.llm_retry_max_attempts, 0, 6);
        self.llm_max_retry_delay_ms = clamp_u32(self.llm_max_retry_delay_ms, 0, 300_000);
        self.compaction_max_tokens = clamp_u32(self.compaction_max_tokens, 8_000, 2_000_000);
        if let Some(prompt) = &mut self.llm_system_prompt_custom {
            if prompt.len() > 12_000 {
                prompt.truncate(12_000);
            }
        }
    }

    /// Merge a partial JSON patch (as sent by `config.save`) into this
    /// config, then clamp. Unknown keys are ignored rather than rejected —
    /// `config.save` is forward-compatible with new profile fields.
    pub fn apply_patch(&mut self, patch: &JsonValue) -> Result<(), String> {
        let current = serde_json::to_value(&*self).map_err(|e| e.to_string())?;
        let merged = merge_json(current, patch.clone());
        *self = serde_json::from_value(merged).map_err(|e| e.to_string())?;
        self.clamp();
        Ok(())
    }
}

fn merge_json(mut base: JsonValue, patch: JsonValue) -> JsonValue {
    if let (JsonValue::Object(base_map), JsonValue::Object(patch_map)) = (&mut base, patch) {
        for (k, v) in patch_map {
            base_map.insert(k, v);
        }
        base
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let c = Config::default();
        assert_eq!(c.bridge_url, "ws://127.0.0.1:8787/ws");
        assert_eq!(c.max_steps, 100);
        assert_eq!(c.auto_title_interval, 10);
        assert_eq!(c.bridge_invoke_timeout_ms, 120_000);
        assert_eq!(c.llm_retry_max_attempts, 2);
        assert_eq!(c.llm_max_retry_delay_ms, 60_000);
        assert_eq!(c.compaction_max_tokens, 128_000);
    }

    #[test]
    fn clamp_enforces_ranges() {
        let mut c = Config {
            max_steps: 10_000,
            auto_title_interval: 999,
            llm_retry_max_attempts: 99,
            ..Config::default()
        };
        c.clamp();
        assert_eq!(c.max_steps, 500);
        assert_eq!(c.auto_title_interval, 100);
        assert_eq!(c.llm_retry_max_attempts, 6);
    }

    #[test]
    fn apply_patch_merges_and_clamps() {
        let mut c = Config::default();
        c.apply_patch(&serde_json::json!({"maxSteps": 0, "llmModel": "gpt-x"}))
            .unwrap();
        assert_eq!(c.max_steps, 1); // clamped from 0 to the [1,500] floor
        assert_eq!(c.llm_model, "gpt-x");
        assert_eq!(c.bridge_url, "ws://127.0.0.1:8787/ws"); // untouched fields survive the merge
    }
}
