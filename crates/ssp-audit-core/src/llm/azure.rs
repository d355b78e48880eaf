use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{ChunkStream, LlmSettings, ReasoningClient};

const DEFAULT_DEPLOYMENT: &str = "gpt-5-mini";
const DEFAULT_API_VERSION: &str = "2024-12-01-preview";

const SYSTEM_PROMPT: &str = "You are an expert security compliance assessor. Evaluate whether the \
provided policy evidence implements the specified security control, cite the relevant policy \
names, and state the implementation status using only the allowed labels. Always respond with a \
single JSON object and no text outside it.";

/// Azure OpenAI chat-completions client serving streamed responses.
///
/// One instance owns one logical conversation with the service.
#[derive(Debug, Clone)]
pub struct AzureReasoningClient {
    http: Client,
    url: String,
    api_key: String,
    max_retries: u32,
}

impl AzureReasoningClient {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        if settings.api_key.trim().is_empty() {
            bail!("Azure OpenAI API key must be provided via SSP_AUDIT_API_KEY");
        }
        let endpoint = settings
            .endpoint
            .clone()
            .ok_or_else(|| anyhow!("SSP_AUDIT_ENDPOINT must be set for reasoning-backed assessment"))?;
        let deployment = settings
            .deployment
            .clone()
            .unwrap_or_else(|| DEFAULT_DEPLOYMENT.to_string());
        let api_version = settings
            .api_version
            .clone()
            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string());

        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            endpoint.trim_end_matches('/'),
            deployment,
            api_version
        );

        let http = Client::builder()
            .user_agent("ssp-audit/0.1")
            .timeout(Duration::from_secs(settings.timeout_secs.unwrap_or(120)))
            .build()
            .context("failed to build Azure OpenAI HTTP client")?;

        Ok(Self {
            http,
            url,
            api_key: settings.api_key.clone(),
            max_retries: settings.max_retries,
        })
    }
}

#[async_trait]
impl ReasoningClient for AzureReasoningClient {
    async fn complete(&self, prompt: &str, cancel: &CancellationToken) -> Result<ChunkStream> {
        let payload = ChatCompletionRequest {
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: SYSTEM_PROMPT.into(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: prompt.to_string(),
                },
            ],
            temperature: 1.0,
            stream: true,
        };

        let mut attempt = 0u32;
        let mut backoff = Duration::from_millis(200);
        loop {
            let request = self
                .http
                .post(&self.url)
                .header("api-key", &self.api_key)
                .json(&payload)
                .send();
            let response = tokio::select! {
                _ = cancel.cancelled() => bail!("reasoning call cancelled"),
                response = request => response,
            };

            let response = match response {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt >= self.max_retries {
                        return Err(err)
                            .context("failed to call Azure OpenAI chat completions API");
                    }
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                    attempt += 1;
                    continue;
                }
            };

            if !response.status().is_success() {
                if attempt >= self.max_retries {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    bail!("Azure OpenAI API error ({}): {}", status, body);
                }
                sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
                attempt += 1;
                continue;
            }

            return Ok(sse_chunk_stream(response, cancel.clone()));
        }
    }

    async fn close(&self) -> Result<()> {
        // stateless HTTP session; nothing to release beyond dropping the client
        trace!("azure reasoning session closed");
        Ok(())
    }
}

struct SseState {
    inner: Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>,
    buffer: String,
    pending: VecDeque<String>,
    done: bool,
    cancel: CancellationToken,
}

/// Surface an SSE chat-completions response as a finite chunk sequence.
fn sse_chunk_stream(response: reqwest::Response, cancel: CancellationToken) -> ChunkStream {
    let inner: Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>> = Box::pin(
        response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|err| anyhow!(err).context("error while streaming reasoning response"))
        }),
    );
    let state = SseState {
        inner,
        buffer: String::new(),
        pending: VecDeque::new(),
        done: false,
        cancel,
    };

    Box::pin(futures::stream::try_unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                return Ok(Some((chunk, st)));
            }
            if st.done {
                return Ok(None);
            }
            let next = tokio::select! {
                _ = st.cancel.cancelled() => bail!("reasoning call cancelled"),
                next = st.inner.next() => next,
            };
            match next {
                None => {
                    st.done = true;
                    let remainder = std::mem::take(&mut st.buffer);
                    process_sse_line(&remainder, &mut st.pending, &mut st.done);
                }
                Some(Ok(bytes)) => {
                    st.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(idx) = st.buffer.find('\n') {
                        let line: String = st.buffer.drain(..=idx).collect();
                        process_sse_line(&line, &mut st.pending, &mut st.done);
                    }
                }
                Some(Err(err)) => return Err(err),
            }
        }
    }))
}

/// Handle one SSE line: queue delta content, flag the terminator, ignore
/// everything else (comments, event names, malformed data).
fn process_sse_line(line: &str, pending: &mut VecDeque<String>, done: &mut bool) {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return;
    };
    let data = data.trim();
    if data == "[DONE]" {
        *done = true;
        return;
    }
    match delta_content(data) {
        Some(content) if !content.is_empty() => pending.push_back(content),
        _ => trace!(payload = data, "skipping SSE payload without delta content"),
    }
}

fn delta_content(data: &str) -> Option<String> {
    let chunk: StreamChunk = serde_json::from_str(data).ok()?;
    let content: String = chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .collect();
    Some(content)
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    messages: Vec<ChatMessage>,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}
