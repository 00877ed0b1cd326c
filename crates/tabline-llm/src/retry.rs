//! Backoff and retry-hint parsing (SPEC_FULL §4.3 step 6).

use std::time::Duration;

/// Exponential backoff `500ms * 2^(n-1)`, capped at 4s. `attempt` is 1-based.
pub fn backoff_delay(attempt: u32) -> Duration {
    let ms = 500u64.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    Duration::from_millis(ms.min(4_000))
}

/// Parse a retry-delay hint from an HTTP `Retry-After` header value (either
/// seconds or an HTTP-date — only the seconds form is handled here, matching
/// what rate-limited OpenAI-compatible providers actually send), or from
/// common JSON error-body phrasing like `"retryDelay":"12s"`.
pub fn parse_retry_after_header(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs))
}

pub fn parse_rate_limit_reset_header(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Scrape `"retryDelay":"Xs"`-shaped hints out of a JSON error body.
pub fn parse_retry_delay_phrase(body: &str) -> Option<Duration> {
    let idx = body.find("retryDelay")?;
    let tail = &body[idx..];
    let quote_start = tail.find(':')? + 1;
    let rest = tail[quote_start..].trim_start();
    let rest = rest.strip_prefix('"')?;
    let end = rest.find(|c: char| !c.is_ascii_digit())?;
    let digits = &rest[..end];
    let secs: u64 = digits.parse().ok()?;
    Some(Duration::from_secs(secs))
}

/// Resolve the delay before the next attempt: the larger of exponential
/// backoff and any parsed hint, as SPEC_FULL §4.3 step 6 requires.
pub fn resolve_delay(attempt: u32, hint: Option<Duration>) -> Duration {
    let backoff = backoff_delay(attempt);
    match hint {
        Some(h) => h.max(backoff),
        None => backoff,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(4), Duration::from_millis(4000));
        assert_eq!(backoff_delay(10), Duration::from_millis(4000));
    }

    #[test]
    fn retry_delay_phrase_parses_seconds() {
        let body = r#"{"error":{"message":"rate limited","retryDelay":"12s"}}"#;
        assert_eq!(parse_retry_delay_phrase(body), Some(Duration::from_secs(12)));
    }

    #[test]
    fn resolve_delay_prefers_larger_hint() {
        let hint = Duration::from_secs(10);
        assert_eq!(resolve_delay(1, Some(hint)), hint);
        assert_eq!(resolve_delay(5, Some(Duration::from_millis(1))), backoff_delay(5));
    }
}
