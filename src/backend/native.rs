//! In-process backend driving a native runtime.
//!
//! Native runtimes are synchronous and call back once per token, so generation runs on the blocking pool and tokens cross back to the async
//! side through a bounded channel. The callback returns `false` to stop the runtime
//! when the caller cancels or the token sink fails.

use super::{
    BackendError, FinalResult, InferParams, InferenceBackend, InferenceSession, PreflightCheck,
    ProcessInfo, TokenSink, Usage, model_file_checks,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Loads models into this process.
pub trait NativeRuntime: Send + Sync + std::fmt::Debug {
    fn load(&self, model_path: &Path) -> Result<Box<dyn NativeModel>, BackendError>;
}

/// A loaded model.
pub trait NativeModel: Send {
    /// Generate synchronously, calling `on_token` for each fragment.
    ///
    /// Implementations must stop as soon as `on_token` returns `false`.
    fn generate(
        &mut self,
        prompt: &str,
        params: &InferParams,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<FinalResult, BackendError>;
}

type SharedModel = Arc<Mutex<Box<dyn NativeModel>>>;

pub struct InProcessBackend {
    runtime: Arc<dyn NativeRuntime>,
    loaded: DashMap<PathBuf, SharedModel>,
}

impl std::fmt::Debug for InProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBackend")
            .field("runtime", &self.runtime)
            .field("loaded", &self.loaded.len())
            .finish()
    }
}

impl InProcessBackend {
    pub fn new(runtime: Arc<dyn NativeRuntime>) -> Self {
        Self {
            runtime,
            loaded: DashMap::new(),
        }
    }

    pub fn is_loaded(&self, model_path: &Path) -> bool {
        self.loaded.contains_key(model_path)
    }

    async fn load(&self, model_path: &Path) -> Result<SharedModel, BackendError> {
        if let Some(model) = self.loaded.get(model_path) {
            return Ok(model.value().clone());
        }
        let runtime = self.runtime.clone();
        let path = model_path.to_path_buf();
        info!(path = %path.display(), "Loading model in process");
        let model = tokio::task::spawn_blocking(move || runtime.load(&path))
            .await
            .map_err(|e| BackendError::Load(format!("loader panicked: {e}")))??;
        let model: SharedModel = Arc::new(Mutex::new(model));
        Ok(self
            .loaded
            .entry(model_path.to_path_buf())
            .or_insert(model)
            .value()
            .clone())
    }
}

#[async_trait]
impl InferenceBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn provision(
        &self,
        model_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<ProcessInfo>, BackendError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(BackendError::Cancelled),
            result = self.load(model_path) => result.map(|_| None),
        }
    }

    async fn start(
        &self,
        model_path: &Path,
        params: InferParams,
    ) -> Result<Box<dyn InferenceSession>, BackendError> {
        let model = self.load(model_path).await?;
        Ok(Box::new(NativeSession { model, params }))
    }

    async fn teardown(&self, model_path: &Path) {
        if self.loaded.remove(model_path).is_some() {
            debug!(path = %model_path.display(), "Released in-process model");
        }
    }

    async fn shutdown(&self) {
        self.loaded.clear();
    }

    async fn preflight(&self, model_path: Option<&Path>) -> Vec<PreflightCheck> {
        model_file_checks(model_path)
    }
}

struct NativeSession {
    model: SharedModel,
    params: InferParams,
}

#[async_trait]
impl InferenceSession for NativeSession {
    async fn generate(
        &mut self,
        cancel: &CancellationToken,
        prompt: &str,
        sink: &mut dyn TokenSink,
    ) -> Result<FinalResult, BackendError> {
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let model = self.model.clone();
        let params = self.params.clone();
        let prompt = prompt.to_string();
        let stop = cancel.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let mut model = model.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut on_token = |token: &str| {
                !stop.is_cancelled() && tx.blocking_send(token.to_string()).is_ok()
            };
            model.generate(&prompt, &params, &mut on_token)
        });

        let mut failure = None;
        loop {
            let token = tokio::select! {
                _ = cancel.cancelled() => {
                    failure = Some(BackendError::Cancelled);
                    break;
                }
                token = rx.recv() => token,
            };
            let Some(token) = token else { break };
            if let Err(e) = sink.on_token(&token).await {
                failure = Some(e);
                break;
            }
        }
        // Closing the channel makes the next callback return false
        drop(rx);

        let result = handle
            .await
            .map_err(|e| BackendError::Stream(format!("native runtime panicked: {e}")))?;
        match failure {
            Some(e) => Err(e),
            None => result,
        }
    }
}

/// Reference runtime that echoes the prompt back word by word.
///
/// Loading requires the model file to exist, so registry and estimator behavior match a
/// real runtime. Used in tests where no weights are available.
#[derive(Debug, Clone, Default)]
pub struct EchoRuntime {
    token_delay: Duration,
}

impl EchoRuntime {
    pub fn with_token_delay(token_delay: Duration) -> Self {
        Self { token_delay }
    }
}

impl NativeRuntime for EchoRuntime {
    fn load(&self, model_path: &Path) -> Result<Box<dyn NativeModel>, BackendError> {
        let meta = std::fs::metadata(model_path)
            .map_err(|e| BackendError::Load(format!("{}: {e}", model_path.display())))?;
        if !meta.is_file() {
            return Err(BackendError::Load(format!(
                "{} is not a regular file",
                model_path.display()
            )));
        }
        Ok(Box::new(EchoModel {
            token_delay: self.token_delay,
        }))
    }
}

struct EchoModel {
    token_delay: Duration,
}

impl NativeModel for EchoModel {
    fn generate(
        &mut self,
        prompt: &str,
        params: &InferParams,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<FinalResult, BackendError> {
        let words: Vec<&str> = prompt.split_whitespace().collect();
        let limit = params
            .max_tokens
            .filter(|&n| n > 0)
            .map_or(words.len(), |n| n as usize);

        let mut content = String::new();
        let mut emitted = 0u64;
        let mut finish_reason = "stop";
        for (i, word) in words.iter().enumerate() {
            if i == limit {
                finish_reason = "length";
                break;
            }
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
            let token = if i == 0 {
                (*word).to_string()
            } else {
                format!(" {word}")
            };
            if params.stop.iter().any(|s| !s.is_empty() && token.contains(s.as_str())) {
                break;
            }
            if !on_token(&token) {
                finish_reason = "cancelled";
                break;
            }
            content.push_str(&token);
            emitted += 1;
        }

        let prompt_tokens = words.len() as u64;
        Ok(FinalResult {
            content,
            finish_reason: finish_reason.to_string(),
            usage: Usage {
                prompt_tokens,
                completion_tokens: emitted,
                total_tokens: prompt_tokens + emitted,
            },
        })
    }
}
