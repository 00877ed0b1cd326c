//! OpenAI-compatible chat-completions provider with SSE streaming
//! (SPEC_FULL §4.3A).

use crate::provider::{LlmError, LlmProvider, LlmResult, LlmStream};
use crate::retry::{parse_rate_limit_reset_header, parse_retry_after_header, parse_retry_delay_phrase};
use crate::types::{AccumulatedToolCall, LlmRequest, StreamDelta, ToolCallAccumulator, Usage};
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub struct OpenAiCompatibleProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        let api_base = api_base.into();
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: format!("{}/chat/completions", api_base.trim_end_matches('/')),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: CancellationToken,
    ) -> LlmResult<LlmStream> {
        debug!(model = %request.model, "llm request");

        let response = tokio::select! {
            res = self.client
                .post(&self.base_url)
                .bearer_auth(&self.api_key)
                .header("content-type", "application/json")
                .json(&request)
                .send() => res?,
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            let header_delay = header_retry_delay(&response);
            let body = response.text().await.unwrap_or_default();
            error!(%status, %body, "llm provider error");
            if status.as_u16() == 401 {
                return Err(LlmError::AuthFailed(body));
            }
            if status.as_u16() == 429 {
                let delay = header_delay.or_else(|| parse_retry_delay_phrase(&body));
                let retry_after_ms = delay.map(|d| d.as_millis() as u64).unwrap_or(0);
                return Err(LlmError::RateLimited { retry_after_ms });
            }
            return Err(LlmError::RequestFailed(format!("{status}: {body}")));
        }

        let stream = parse_sse_stream(response.bytes_stream(), cancel);
        Ok(Box::pin(stream))
    }
}

/// `Retry-After`, else `x-ratelimit-reset-requests`/`x-ratelimit-reset`
/// (the headers OpenAI-compatible providers actually send on a 429),
/// checked in that order.
fn header_retry_delay(response: &Response) -> Option<std::time::Duration> {
    let headers = response.headers();
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after_header)
        .or_else(|| {
            headers
                .get("x-ratelimit-reset-requests")
                .or_else(|| headers.get("x-ratelimit-reset"))
                .and_then(|v| v.to_str().ok())
                .and_then(parse_rate_limit_reset_header)
        })
}

fn parse_sse_stream(
    bytes_stream: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    cancel: CancellationToken,
) -> impl futures::Stream<Item = LlmResult<StreamDelta>> + Send {
    async_stream::stream! {
        let mut buffer = String::new();
        let mut tool_calls: ToolCallAccumulator = BTreeMap::new();
        let mut usage: Option<Usage> = None;

        tokio::pin!(bytes_stream);

        loop {
            let chunk = tokio::select! {
                chunk = bytes_stream.next() => chunk,
                _ = cancel.cancelled() => {
                    yield Err(LlmError::Cancelled);
                    break;
                }
            };
            let Some(chunk_result) = chunk else { break };
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(LlmError::StreamError(e.to_string()));
                    continue;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim_end_matches('\r').to_string();
                buffer = buffer[line_end + 1..].to_string();

                let Some(data) = line.strip_prefix("data: ") else { continue };
                if data == "[DONE]" {
                    yield Ok(StreamDelta::Done { finish_reason: None, usage: usage.clone() });
                    return;
                }

                let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(LlmError::StreamError(format!("malformed chunk: {e}")));
                        continue;
                    }
                };

                if let Some(u) = chunk.usage {
                    usage = Some(u);
                }

                let Some(choice) = chunk.choices.into_iter().next() else { continue };

                if let Some(text) = choice.delta.content {
                    yield Ok(StreamDelta::Text(text));
                }

                if let Some(deltas) = choice.delta.tool_calls {
                    for d in deltas {
                        let is_new = !tool_calls.contains_key(&d.index);
                        let entry = tool_calls.entry(d.index).or_insert_with(AccumulatedToolCall::default);
                        if let Some(id) = d.id {
                            entry.id = id;
                        }
                        let mut name_for_start = None;
                        if let Some(f) = d.function {
                            if let Some(name) = f.name {
                                entry.name = name.clone();
                                name_for_start = Some(name);
                            }
                            if let Some(args) = f.arguments {
                                entry.arguments.push_str(&args);
                                yield Ok(StreamDelta::ToolCallDelta {
                                    index: d.index,
                                    arguments: args,
                                });
                            }
                        }
                        if is_new {
                            yield Ok(StreamDelta::ToolCallStart {
                                index: d.index,
                                id: entry.id.clone(),
                                name: name_for_start.unwrap_or_default(),
                            });
                        }
                    }
                }

                if let Some(reason) = choice.finish_reason {
                    yield Ok(StreamDelta::Done { finish_reason: Some(reason), usage: usage.clone() });
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ToolCallFunctionDelta>,
}

#[derive(Deserialize)]
struct ToolCallFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
