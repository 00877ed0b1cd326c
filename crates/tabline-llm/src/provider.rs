//! Provider-agnostic LLM trait (SPEC_FULL §4.3A).

use crate::types::{LlmRequest, StreamDelta};
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

pub type LlmResult<T> = Result<T, LlmError>;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl LlmError {
    /// HTTP 408/409/429/500/502/503/504 or a timeout/network/rate-limit
    /// heuristic on the error message (SPEC_FULL §4.3 step 6).
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::RequestFailed(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("timeout")
                    || lower.contains("timed out")
                    || lower.contains("rate limit")
                    || ["408", "409", "429", "500", "502", "503", "504"]
                        .iter()
                        .any(|code| msg.contains(code))
            }
            LlmError::NetworkError(e) => e.is_timeout() || e.is_connect(),
            LlmError::AuthFailed(_) | LlmError::InvalidResponse(_) | LlmError::Cancelled => false,
            LlmError::StreamError(_) => true,
        }
    }
}

pub type LlmStream = Pin<Box<dyn Stream<Item = LlmResult<StreamDelta>> + Send>>;

#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Stream a completion response. If `cancel` fires, the underlying HTTP
    /// connection is dropped and the stream yields `LlmError::Cancelled`.
    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: CancellationToken,
    ) -> LlmResult<LlmStream>;
}
