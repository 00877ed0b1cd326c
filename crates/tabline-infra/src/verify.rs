//! Post-action verification: before/after observation diff or explicit
//! expectations, polled until satisfied or timed out (SPEC_FULL §4.1
//! "Verify").

use serde::{Deserialize, Serialize};
use tabline_core::{JsonValue, Result};
use tokio::time::{sleep, Duration, Instant};

use crate::cdp::CdpRegistry;

const DEFAULT_POLL_MS: u64 = 120;
const MIN_POLL_MS: u64 = 50;
const MAX_POLL_MS: u64 = 1_000;

#[derive(Clone, Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub expectations: Vec<Expectation>,
    #[serde(default)]
    pub previous_observation: Option<Observation>,
    #[serde(default = "default_wait_for_ms")]
    pub wait_for_ms: u64,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

fn default_wait_for_ms() -> u64 {
    3_000
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Expectation {
    UrlContains { value: String },
    TitleContains { value: String },
    TextIncludes { value: String },
    SelectorExists { selector: String },
    UrlChanged { previous_url: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub url: String,
    pub title: String,
    pub text_length: usize,
    pub node_count: usize,
    #[serde(skip)]
    pub text: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct CheckResult {
    pub label: String,
    pub ok: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct VerifyResult {
    pub ok: bool,
    pub checks: Vec<CheckResult>,
    pub observation: Observation,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

pub async fn verify(cdp: &CdpRegistry, tab_id: &str, req: VerifyRequest) -> Result<VerifyResult> {
    let poll_interval = Duration::from_millis(
        req.poll_interval_ms
            .unwrap_or(DEFAULT_POLL_MS)
            .clamp(MIN_POLL_MS, MAX_POLL_MS),
    );
    let deadline = Instant::now() + Duration::from_millis(req.wait_for_ms);
    let start = Instant::now();

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let observation = observe(cdp, tab_id).await?;
        let checks = run_checks(cdp, tab_id, &req, &observation).await?;
        let all_ok = checks.iter().all(|c| c.ok);

        if all_ok || Instant::now() >= deadline {
            return Ok(VerifyResult {
                ok: all_ok,
                checks,
                observation,
                attempts,
                elapsed_ms: start.elapsed().as_millis() as u64,
            });
        }
        sleep(poll_interval).await;
    }
}

async fn run_checks(
    cdp: &CdpRegistry,
    tab_id: &str,
    req: &VerifyRequest,
    observation: &Observation,
) -> Result<Vec<CheckResult>> {
    if !req.expectations.is_empty() {
        let mut checks = Vec::with_capacity(req.expectations.len());
        for exp in &req.expectations {
            checks.push(check_expectation(cdp, tab_id, exp, observation).await?);
        }
        return Ok(checks);
    }

    let Some(previous) = &req.previous_observation else {
        return Ok(vec![]);
    };

    Ok(vec![
        CheckResult {
            label: "urlChanged".to_string(),
            ok: previous.url != observation.url,
        },
        CheckResult {
            label: "titleChanged".to_string(),
            ok: previous.title != observation.title,
        },
        CheckResult {
            label: "textLengthChanged".to_string(),
            ok: previous.text_length != observation.text_length,
        },
        CheckResult {
            label: "nodeCountChanged".to_string(),
            ok: previous.node_count != observation.node_count,
        },
    ])
}

async fn check_expectation(
    cdp: &CdpRegistry,
    tab_id: &str,
    exp: &Expectation,
    observation: &Observation,
) -> Result<CheckResult> {
    Ok(match exp {
        Expectation::UrlContains { value } => CheckResult {
            label: format!("urlContains:{value}"),
            ok: observation.url.contains(value.as_str()),
        },
        Expectation::TitleContains { value } => CheckResult {
            label: format!("titleContains:{value}"),
            ok: observation.title.contains(value.as_str()),
        },
        Expectation::TextIncludes { value } => CheckResult {
            label: format!("textIncludes:{value}"),
            ok: observation.text.contains(value.as_str()),
        },
        Expectation::SelectorExists { selector } => {
            let script = format!("!!document.querySelector({selector:?})");
            let found = cdp.evaluate(tab_id, &script).await?;
            CheckResult {
                label: format!("selectorExists:{selector}"),
                ok: found.as_bool().unwrap_or(false),
            }
        }
        Expectation::UrlChanged { previous_url } => CheckResult {
            label: "urlChanged".to_string(),
            ok: &observation.url != previous_url,
        },
    })
}

async fn observe(cdp: &CdpRegistry, tab_id: &str) -> Result<Observation> {
    let script = r#"(() => ({
        url: location.href,
        title: document.title,
        text: (document.body ? document.body.innerText : ''),
        nodeCount: document.querySelectorAll('*').length,
    }))()"#;
    let value = cdp.evaluate(tab_id, script).await?;
    let text = value.get("text").and_then(JsonValue::as_str).unwrap_or("").to_string();
    Ok(Observation {
        url: value.get("url").and_then(JsonValue::as_str).unwrap_or("").to_string(),
        title: value.get("title").and_then(JsonValue::as_str).unwrap_or("").to_string(),
        text_length: text.chars().count(),
        node_count: value.get("nodeCount").and_then(JsonValue::as_u64).unwrap_or(0) as usize,
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(url: &str, title: &str, text_len: usize, node_count: usize) -> Observation {
        Observation {
            url: url.to_string(),
            title: title.to_string(),
            text_length: text_len,
            node_count,
            text: String::new(),
        }
    }

    #[tokio::test]
    async fn diff_mode_detects_url_change() {
        let cdp = CdpRegistry::new();
        let req = VerifyRequest {
            expectations: vec![],
            previous_observation: Some(obs("https://a", "A", 10, 5)),
            wait_for_ms: 100,
            poll_interval_ms: None,
        };
        let checks = run_checks(&cdp, "tab1", &req, &obs("https://b", "A", 10, 5))
            .await
            .unwrap();
        let url_check = checks.iter().find(|c| c.label == "urlChanged").unwrap();
        assert!(url_check.ok);
        let title_check = checks.iter().find(|c| c.label == "titleChanged").unwrap();
        assert!(!title_check.ok);
    }

    #[tokio::test]
    async fn explicit_expectations_checked_independently() {
        let cdp = CdpRegistry::new();
        let req = VerifyRequest {
            expectations: vec![Expectation::UrlContains {
                value: "example".to_string(),
            }],
            previous_observation: None,
            wait_for_ms: 100,
            poll_interval_ms: None,
        };
        let checks = run_checks(&cdp, "tab1", &req, &obs("https://example.com", "T", 1, 1))
            .await
            .unwrap();
        assert!(checks[0].ok);
    }
}
