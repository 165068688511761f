//! Request orchestration: resolve the model, ensure it, admit, generate, stream NDJSON.
//!
//! The response is a sequence of `{"token":"..."}` lines followed by exactly one
//! `{"done":true,"content":"...","finish_reason":"...","usage":{...}}` line.

use super::Scheduler;
use crate::backend::{BackendError, InferParams, InferenceBackend, TokenSink, Usage};
use crate::errors::{Phase, SchedulerError};
use crate::events::Event;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Called after every line written to the output, e.g. to flush an HTTP response.
pub type FlushHook = dyn Fn() + Send + Sync;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferRequest {
    /// Empty or missing falls back to the default model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
}

impl InferRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    fn params(&self) -> InferParams {
        InferParams {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            max_tokens: self.max_tokens,
            stop: self.stop.clone(),
            seed: self.seed,
            repeat_penalty: self.repeat_penalty,
        }
    }
}

#[derive(Serialize)]
struct TokenLine<'a> {
    token: &'a str,
}

#[derive(Serialize)]
struct DoneLine<'a> {
    done: bool,
    content: &'a str,
    finish_reason: &'a str,
    usage: Usage,
}

struct Summary {
    tokens: u64,
    finish_reason: String,
}

/// Writes each token as one NDJSON line, flushing after every write.
struct NdjsonSink<'a, W> {
    out: &'a mut W,
    flush: Option<&'a FlushHook>,
    content: String,
    tokens: u64,
}

impl<'a, W: AsyncWrite + Unpin + Send> NdjsonSink<'a, W> {
    fn new(out: &'a mut W, flush: Option<&'a FlushHook>) -> Self {
        Self {
            out,
            flush,
            content: String::new(),
            tokens: 0,
        }
    }

    async fn write_line<T: Serialize>(&mut self, line: &T) -> std::io::Result<()> {
        let mut bytes = serde_json::to_vec(line)?;
        bytes.push(b'\n');
        self.out.write_all(&bytes).await?;
        self.out.flush().await?;
        if let Some(hook) = self.flush
            && std::panic::catch_unwind(AssertUnwindSafe(hook)).is_err()
        {
            warn!("Flush hook panicked, continuing");
        }
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> TokenSink for NdjsonSink<'_, W> {
    async fn on_token(&mut self, token: &str) -> Result<(), BackendError> {
        self.write_line(&TokenLine { token })
            .await
            .map_err(BackendError::Sink)?;
        self.content.push_str(token);
        self.tokens += 1;
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl Scheduler {
    /// Run one generation and stream it to `out` as NDJSON.
    ///
    /// Panics anywhere in the inference path are caught and returned as
    /// [`SchedulerError::Panicked`].
    pub async fn infer<W>(
        &self,
        cancel: &CancellationToken,
        request: InferRequest,
        out: &mut W,
        flush: Option<&FlushHook>,
    ) -> Result<(), SchedulerError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let model = request.model.clone().unwrap_or_default();
        match AssertUnwindSafe(self.infer_inner(cancel, request, out, flush))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(model = %model, error = %message, "Recovered panic in inference path");
                self.inner
                    .publish(Event::new("infer_error", model).with("error", message.clone()));
                Err(SchedulerError::Panicked(message))
            }
        }
    }

    async fn infer_inner<W>(
        &self,
        cancel: &CancellationToken,
        request: InferRequest,
        out: &mut W,
        flush: Option<&FlushHook>,
    ) -> Result<(), SchedulerError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let id = self.resolve_model_id(request.model.as_deref())?;
        let mut restarted = false;
        loop {
            self.ensure_instance(cancel, &id).await?;
            let permit = self.begin_generation(cancel, &id).await?;

            let Some(backend) = self.inner.backend() else {
                return Err(SchedulerError::DependencyUnavailable(
                    "no inference backend configured".to_string(),
                ));
            };
            let path = self
                .inner
                .registry
                .get(&id)
                .map(|m| m.path.clone())
                .ok_or_else(|| SchedulerError::ModelNotFound(id.clone()))?;

            let started = Instant::now();
            self.inner.publish(
                Event::new("infer_start", id.clone())
                    .with("prompt_chars", request.prompt.chars().count()),
            );
            debug!(model = %id, "Starting generation");

            match self
                .generate(cancel, backend, &path, &id, &request, out, flush)
                .await
            {
                Ok(summary) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    debug!(model = %id, tokens = summary.tokens, elapsed_ms, "Generation finished");
                    self.inner.publish(
                        Event::new("infer_done", id)
                            .with("tokens", summary.tokens)
                            .with("finish_reason", summary.finish_reason)
                            .with("elapsed_ms", elapsed_ms),
                    );
                    return Ok(());
                }
                // The runtime died while the instance was ready; reload it once
                Err(SchedulerError::Backend {
                    phase: Phase::BackendStart,
                    source: BackendError::NotRunning(_),
                    ..
                }) if !restarted => {
                    restarted = true;
                    let slots = Arc::clone(permit.slots());
                    drop(permit);
                    self.remove_exited(&id, &slots).await;
                }
                Err(e) => {
                    warn!(model = %id, error = %e, "Generation failed");
                    self.inner
                        .publish(Event::new("infer_error", id).with("error", e.to_string()));
                    return Err(e);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn generate<W>(
        &self,
        cancel: &CancellationToken,
        backend: Arc<dyn InferenceBackend>,
        path: &Path,
        id: &str,
        request: &InferRequest,
        out: &mut W,
        flush: Option<&FlushHook>,
    ) -> Result<Summary, SchedulerError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut session = backend
            .start(path, request.params())
            .await
            .map_err(|e| SchedulerError::backend(Phase::BackendStart, id, e))?;

        let mut sink = NdjsonSink::new(out, flush);
        let generated = session.generate(cancel, &request.prompt, &mut sink).await;
        session.close().await;
        let result = generated.map_err(|e| SchedulerError::backend(Phase::Generation, id, e))?;

        let content = if result.content.is_empty() {
            std::mem::take(&mut sink.content)
        } else {
            result.content
        };
        let finish_reason = if result.finish_reason.is_empty() {
            "stop".to_string()
        } else {
            result.finish_reason
        };
        sink.write_line(&DoneLine {
            done: true,
            content: &content,
            finish_reason: &finish_reason,
            usage: result.usage,
        })
        .await
        .map_err(|e| SchedulerError::backend(Phase::Generation, id, BackendError::Sink(e)))?;

        Ok(Summary {
            tokens: sink.tokens,
            finish_reason,
        })
    }
}
