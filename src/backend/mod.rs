//! Pluggable inference backends.
//!
//! A backend turns a model path into a generation session. Three variants ship with the
//! crate and are selected once at startup through [`BackendConfig`]:
//!
//! - [`InProcessBackend`]: drives a [`NativeRuntime`] (GGUF weights through
//!   [`CandleRuntime`]) on the blocking thread pool
//! - [`RemoteBackend`]: streams from an already-running OpenAI-compatible server
//! - [`SubprocessBackend`]: spawns and supervises one server process per model path
//!
//! Backends that own processes implement the optional [`InferenceBackend::provision`] and
//! [`InferenceBackend::teardown`] hooks, which the scheduler calls on load and unload.

mod candle;
mod native;
mod openai;
mod remote;
mod subprocess;

pub use candle::{CandleConfig, CandleRuntime};
pub use native::{EchoRuntime, InProcessBackend, NativeModel, NativeRuntime};
pub use remote::{RemoteBackend, RemoteConfig};
pub use subprocess::{ProcessState, SpawnConfig, SubprocessBackend};

use crate::events::EventPublisher;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sampling parameters passed to [`InferenceBackend::start`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Summary of a finished generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FinalResult {
    /// Full text. Empty means "use the concatenated tokens".
    pub content: String,
    pub finish_reason: String,
    pub usage: Usage,
}

/// Process details recorded on an instance for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub port: u16,
    pub pid: u32,
}

/// Outcome of one non-destructive startup check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightCheck {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl PreflightCheck {
    pub fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to spawn runtime: {0}")]
    Spawn(String),

    #[error("runtime exited before becoming healthy ({status}); stderr tail:\n{stderr_tail}")]
    EarlyExit { status: String, stderr_tail: String },

    #[error("runtime not healthy after {0:?}")]
    HealthTimeout(Duration),

    /// The runtime for a model path is gone; it must be provisioned again
    #[error("runtime for {0} is not running")]
    NotRunning(String),

    #[error("no free port in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("upstream returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The token sink refused a fragment, usually because the client went away
    #[error("token sink failed: {0}")]
    Sink(#[source] std::io::Error),

    #[error("model load failed: {0}")]
    Load(String),

    #[error("invalid backend configuration: {0}")]
    Config(String),
}

/// Receives incremental text fragments during generation.
///
/// Returning an error aborts generation and the error is propagated to the caller.
#[async_trait]
pub trait TokenSink: Send {
    async fn on_token(&mut self, token: &str) -> Result<(), BackendError>;
}

#[async_trait]
pub trait InferenceBackend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Prepare the runtime for a model before it is marked ready.
    ///
    /// Backends that supervise a process spawn it here and return its port and pid.
    async fn provision(
        &self,
        _model_path: &Path,
        _cancel: &CancellationToken,
    ) -> Result<Option<ProcessInfo>, BackendError> {
        Ok(None)
    }

    async fn start(
        &self,
        model_path: &Path,
        params: InferParams,
    ) -> Result<Box<dyn InferenceSession>, BackendError>;

    /// Release anything owned for `model_path`. Best effort, never fails.
    async fn teardown(&self, _model_path: &Path) {}

    /// Release everything this backend owns.
    async fn shutdown(&self) {}

    fn set_event_publisher(&self, _publisher: Arc<dyn EventPublisher>) {}

    /// Backend-specific startup checks.
    async fn preflight(&self, _model_path: Option<&Path>) -> Vec<PreflightCheck> {
        Vec::new()
    }
}

#[async_trait]
pub trait InferenceSession: Send {
    async fn generate(
        &mut self,
        cancel: &CancellationToken,
        prompt: &str,
        sink: &mut dyn TokenSink,
    ) -> Result<FinalResult, BackendError>;

    async fn close(&mut self) {}
}

/// Backend selection, resolved once at startup.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Remote(RemoteConfig),
    Subprocess(SpawnConfig),
    /// Run GGUF models in this process with [`CandleRuntime`]
    InProcess(CandleConfig),
}

impl BackendConfig {
    pub fn build(self) -> Result<Arc<dyn InferenceBackend>, BackendError> {
        let backend: Arc<dyn InferenceBackend> = match self {
            BackendConfig::Remote(config) => Arc::new(RemoteBackend::new(config)?),
            BackendConfig::Subprocess(config) => Arc::new(SubprocessBackend::new(config)?),
            BackendConfig::InProcess(config) => {
                Arc::new(InProcessBackend::new(Arc::new(CandleRuntime::new(config)?)))
            }
        };
        Ok(backend)
    }
}

/// Checks shared by the path-based backends.
pub(crate) fn model_file_checks(model_path: Option<&Path>) -> Vec<PreflightCheck> {
    let Some(path) = model_path else {
        return Vec::new();
    };
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => vec![PreflightCheck::pass(
            "model_file",
            path.display().to_string(),
        )],
        Ok(_) => vec![PreflightCheck::fail(
            "model_file",
            format!("{} is not a regular file", path.display()),
        )],
        Err(e) => vec![PreflightCheck::fail(
            "model_file",
            format!("{}: {e}", path.display()),
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_exit_message_contains_stderr() {
        let err = BackendError::EarlyExit {
            status: "exit status: 3".into(),
            stderr_tail: "error: failed to load model".into(),
        };
        let message = err.to_string();
        assert!(message.contains("exit status: 3"));
        assert!(message.contains("failed to load model"));
    }

    #[test]
    fn test_infer_params_skip_unset_fields() {
        let params = InferParams {
            max_tokens: Some(16),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            serde_json::json!({"max_tokens": 16})
        );
    }

    #[test]
    fn test_build_selects_variant() {
        let remote = BackendConfig::Remote(
            RemoteConfig::builder()
                .base_url("http://127.0.0.1:8080")
                .build(),
        );
        assert_eq!(remote.build().unwrap().name(), "remote");

        let spawn = BackendConfig::Subprocess(SpawnConfig::builder().bin("llama-server").build());
        assert_eq!(spawn.build().unwrap().name(), "subprocess");

        let native = BackendConfig::InProcess(CandleConfig::builder().build());
        assert_eq!(native.build().unwrap().name(), "in-process");
    }

    #[test]
    fn test_model_file_checks() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let dir = tempfile::tempdir().unwrap();

        assert!(model_file_checks(None).is_empty());
        assert!(model_file_checks(Some(file.path()))[0].ok);
        assert!(!model_file_checks(Some(dir.path()))[0].ok);
        assert!(!model_file_checks(Some(Path::new("/no/such/model.gguf")))[0].ok);
    }
}
