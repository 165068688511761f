//! Streaming client for OpenAI-compatible `/v1/completions` servers.
//!
//! Shared by the remote backend and the subprocess backend, which differ only in who owns
//! the server. All deadlines are request scoped and raced against the caller's
//! cancellation token.

use super::{BackendError, FinalResult, InferParams, InferenceSession, TokenSink};
use crate::client::{HttpClient, read_body};
use crate::sse::{SseLine, SseLineStream, parse_line};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const ERROR_BODY_LIMIT: usize = 4096;

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f32>,
    stream: bool,
}

/// Where and how to reach a completion server.
#[derive(Debug, Clone)]
pub(crate) struct CompletionEndpoint {
    pub client: Arc<dyn HttpClient>,
    pub base_url: String,
    pub api_key: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

impl CompletionEndpoint {
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: hyper::Method, path: &str, body: Bytes) -> Result<hyper::Request<Full<Bytes>>, BackendError> {
        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(self.url(path))
            .header(hyper::header::ACCEPT, "text/event-stream, application/json");
        if !body.is_empty() {
            builder = builder.header(hyper::header::CONTENT_TYPE, "application/json");
        }
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.header(hyper::header::AUTHORIZATION, format!("Bearer {key}"));
        }
        builder
            .body(Full::new(body))
            .map_err(|e| BackendError::Request(format!("failed to build request: {e}")))
    }

    /// GET `path` and report whether it answered 2xx within `timeout`.
    pub async fn check_health(&self, path: &str, timeout: Duration) -> Result<bool, String> {
        let request = self
            .request(hyper::Method::GET, path, Bytes::new())
            .map_err(|e| e.to_string())?;

        match tokio::time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response.status().is_success()),
            Ok(Err(e)) => Err(format!("Request failed: {}", e)),
            Err(_) => Err("Health check timeout".to_string()),
        }
    }

    pub fn session(&self, model: Option<String>, params: InferParams) -> CompletionSession {
        CompletionSession {
            endpoint: self.clone(),
            model,
            params,
        }
    }
}

pub(crate) struct CompletionSession {
    endpoint: CompletionEndpoint,
    model: Option<String>,
    params: InferParams,
}

/// Run `fut` until it finishes, the token is cancelled, or the deadline passes.
async fn race<T>(
    cancel: &CancellationToken,
    deadline: Option<(Instant, Duration)>,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    let expired = async {
        match deadline {
            Some((at, _)) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackendError::Cancelled),
        _ = expired => Err(BackendError::Timeout(deadline.map(|(_, d)| d).unwrap_or_default())),
        result = fut => result,
    }
}

#[async_trait]
impl InferenceSession for CompletionSession {
    async fn generate(
        &mut self,
        cancel: &CancellationToken,
        prompt: &str,
        sink: &mut dyn TokenSink,
    ) -> Result<FinalResult, BackendError> {
        let deadline = self
            .endpoint
            .request_timeout
            .filter(|t| !t.is_zero())
            .map(|t| (Instant::now() + t, t));

        let body = CompletionRequest {
            model: self.model.as_deref().filter(|m| !m.is_empty()),
            prompt,
            max_tokens: self.params.max_tokens.filter(|&n| n > 0),
            temperature: self.params.temperature,
            top_p: self.params.top_p,
            top_k: self.params.top_k.filter(|&k| k > 0),
            stop: &self.params.stop,
            seed: self.params.seed,
            repeat_penalty: self.params.repeat_penalty,
            stream: true,
        };
        let body = serde_json::to_vec(&body)
            .map_err(|e| BackendError::Request(format!("failed to encode request: {e}")))?;
        let request = self
            .endpoint
            .request(hyper::Method::POST, "/v1/completions", Bytes::from(body))?;

        let client = self.endpoint.client.clone();
        let connect_timeout = self.endpoint.connect_timeout.filter(|t| !t.is_zero());
        let response = race(cancel, deadline, async move {
            let send = client.request(request);
            let result = match connect_timeout {
                Some(t) => tokio::time::timeout(t, send)
                    .await
                    .map_err(|_| BackendError::Timeout(t))?,
                None => send.await,
            };
            result.map_err(|e| BackendError::Request(e.to_string()))
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            let text = race(cancel, deadline, async {
                read_body(response.into_body())
                    .await
                    .map_err(|e| BackendError::Stream(e.to_string()))
            })
            .await
            .unwrap_or_default();
            let body = text.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(BackendError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let mut lines = SseLineStream::new(response.into_body().into_data_stream());
        let mut result = FinalResult::default();
        loop {
            let next = race(cancel, deadline, async { Ok(lines.next().await) }).await?;
            let Some(line) = next else {
                debug!("Completion stream ended without [DONE]");
                break;
            };
            let line = line.map_err(|e| BackendError::Stream(e.to_string()))?;
            match parse_line(&String::from_utf8_lossy(&line)) {
                SseLine::Done => break,
                SseLine::Ignored => {}
                SseLine::Chunk {
                    content,
                    finish_reason,
                    usage,
                } => {
                    if !content.is_empty() {
                        sink.on_token(&content).await?;
                    }
                    if let Some(reason) = finish_reason {
                        result.finish_reason = reason;
                    }
                    if let Some(usage) = usage {
                        result.usage = usage;
                    }
                }
                SseLine::Unrecognized(line) => {
                    warn!(line = %line, "Ignoring unrecognized stream line");
                }
            }
        }
        Ok(result)
    }
}
