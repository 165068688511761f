//! Backend for an externally managed, already-running completion server.

use super::openai::CompletionEndpoint;
use super::{BackendError, InferParams, InferenceBackend, InferenceSession, PreflightCheck};
use crate::client::{HttpClient, create_hyper_client};
use async_trait::async_trait;
use bon::Builder;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Builder)]
pub struct RemoteConfig {
    /// Base URL of the server, e.g. `http://127.0.0.1:8080`
    #[builder(into)]
    pub base_url: String,
    /// Sent as `Authorization: Bearer <key>` when set
    #[builder(into)]
    pub api_key: Option<String>,
    /// Bound on establishing the connection and receiving response headers
    #[builder(default = Duration::from_secs(10))]
    pub connect_timeout: Duration,
    /// Bound on a whole generation; zero disables it
    #[builder(default = Duration::ZERO)]
    pub request_timeout: Duration,
}

#[derive(Debug)]
pub struct RemoteBackend {
    endpoint: CompletionEndpoint,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig) -> Result<Self, BackendError> {
        Self::with_client(config, Arc::new(create_hyper_client()))
    }

    /// Use a caller-provided HTTP client, mainly for tests.
    pub fn with_client(
        config: RemoteConfig,
        client: Arc<dyn HttpClient>,
    ) -> Result<Self, BackendError> {
        let parsed = url::Url::parse(&config.base_url)
            .map_err(|e| BackendError::Config(format!("invalid base url {}: {e}", config.base_url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(BackendError::Config(format!(
                "unsupported scheme in {}",
                config.base_url
            )));
        }

        Ok(Self {
            endpoint: CompletionEndpoint {
                client,
                base_url: config.base_url,
                api_key: config.api_key,
                connect_timeout: Some(config.connect_timeout),
                request_timeout: Some(config.request_timeout),
            },
        })
    }
}

#[async_trait]
impl InferenceBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn start(
        &self,
        model_path: &Path,
        params: InferParams,
    ) -> Result<Box<dyn InferenceSession>, BackendError> {
        // The server selects the model by name, the path is forwarded as the `model` field
        let model = model_path.to_string_lossy().trim().to_string();
        debug!(model = %model, base_url = %self.endpoint.base_url, "Starting remote session");
        Ok(Box::new(self.endpoint.session(Some(model), params)))
    }

    async fn preflight(&self, _model_path: Option<&Path>) -> Vec<PreflightCheck> {
        let timeout = self
            .endpoint
            .connect_timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(Duration::from_secs(5));
        let check = match self.endpoint.check_health("/v1/models", timeout).await {
            Ok(true) => PreflightCheck::pass("server_reachable", self.endpoint.base_url.clone()),
            Ok(false) => PreflightCheck::fail(
                "server_reachable",
                format!("{} answered /v1/models with an error status", self.endpoint.base_url),
            ),
            Err(e) => PreflightCheck::fail("server_reachable", e),
        };
        vec![check]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{CollectingSink, MockHttpClient};
    use tokio_util::sync::CancellationToken;

    fn config() -> RemoteConfig {
        RemoteConfig::builder()
            .base_url("http://llama:8080")
            .build()
    }

    #[test]
    fn test_rejects_invalid_url() {
        let config = RemoteConfig::builder().base_url("not a url").build();
        let err = RemoteBackend::with_client(config, Arc::new(MockHttpClient::new(200, "")))
            .unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));

        let config = RemoteConfig::builder().base_url("ftp://llama").build();
        assert!(RemoteBackend::with_client(config, Arc::new(MockHttpClient::new(200, ""))).is_err());
    }

    #[tokio::test]
    async fn test_session_forwards_model_and_omits_auth_without_key() {
        let client = MockHttpClient::new_streaming(
            200,
            vec!["data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n".to_string()],
        );
        let backend = RemoteBackend::with_client(config(), Arc::new(client.clone())).unwrap();

        let mut session = backend
            .start(Path::new(" qwen2-7b "), InferParams::default())
            .await
            .unwrap();
        let mut sink = CollectingSink::default();
        session
            .generate(&CancellationToken::new(), "hello", &mut sink)
            .await
            .unwrap();
        session.close().await;

        assert_eq!(sink.tokens, vec!["hi"]);
        let requests = client.get_requests();
        assert_eq!(requests[0].authorization, None);
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["model"], "qwen2-7b");
    }

    #[tokio::test]
    async fn test_preflight_reports_reachability() {
        let backend =
            RemoteBackend::with_client(config(), Arc::new(MockHttpClient::new(200, "{}"))).unwrap();
        let checks = backend.preflight(None).await;
        assert_eq!(checks.len(), 1);
        assert!(checks[0].ok);
        assert_eq!(checks[0].name, "server_reachable");

        let backend =
            RemoteBackend::with_client(config(), Arc::new(MockHttpClient::new(401, ""))).unwrap();
        assert!(!backend.preflight(None).await[0].ok);
    }
}
