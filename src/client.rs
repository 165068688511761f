//! HTTP client abstraction for talking to completion servers
//!
//! The remote and subprocess backends issue their requests through [`HttpClient`], so tests
//! can swap in a scripted client instead of a real connection pool.
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::UnsyncBoxBody};
use hyper::{Request, Response};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body type shared by every client implementation.
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

pub type HyperClient = Client<hyper_tls::HttpsConnector<HttpConnector>, Full<Bytes>>;

#[async_trait]
pub trait HttpClient: std::fmt::Debug + Send + Sync {
    async fn request(&self, req: Request<Full<Bytes>>) -> Result<Response<ResponseBody>, BoxError>;
}

#[async_trait]
impl HttpClient for HyperClient {
    async fn request(&self, req: Request<Full<Bytes>>) -> Result<Response<ResponseBody>, BoxError> {
        let response = Client::request(self, req)
            .await
            .map_err(|e| Box::new(e) as BoxError)?;
        Ok(response.map(|body| body.map_err(|e| Box::new(e) as BoxError).boxed_unsync()))
    }
}

pub fn create_hyper_client() -> HyperClient {
    let https = hyper_tls::HttpsConnector::new();

    // Connection pool configuration via environment variables
    let pool_idle_timeout_secs = std::env::var("MODELPOOL_POOL_IDLE_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(90);

    let pool_max_idle_per_host = std::env::var("MODELPOOL_POOL_MAX_IDLE_PER_HOST")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(16);

    tracing::debug!(
        "HTTP client pool config: idle_timeout={}s, max_idle_per_host={}",
        pool_idle_timeout_secs,
        pool_max_idle_per_host
    );

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(std::time::Duration::from_secs(pool_idle_timeout_secs))
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_timer(hyper_util::rt::TokioTimer::new())
        .build(https)
}

/// Collect a response body into a string, for error reporting and small JSON replies.
pub async fn read_body(body: ResponseBody) -> Result<String, BoxError> {
    let bytes = body.collect().await?.to_bytes();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
