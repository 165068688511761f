//! modelpool - a memory-budgeted scheduler for a pool of LLM inference backends
//!
//! The scheduler exposes one logical inference endpoint and decides internally which
//! model is loaded, when it is evicted, how many requests per model may queue, and which
//! backend serves it.
//!
//! ```text
//!   HTTP layer (handlers)          callers of the public contract
//!            |
//!        Scheduler ---- events ---> EventPublisher (tracing, broadcast, memory)
//!   ensure | admit | infer | unload
//!            |
//!   instance map + memory budget (one RwLock)
//!            |
//!     InferenceBackend
//!   in-process | remote HTTP | supervised subprocess
//! ```
//!
//! Everything below the HTTP layer is usable as a library:
//!
//! ```no_run
//! use modelpool::{InferRequest, ModelRegistry, Scheduler, SchedulerConfig};
//! use modelpool::backend::{BackendConfig, CandleConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ModelRegistry::scan_dir("/models").await?;
//! let scheduler = Scheduler::new(
//!     registry,
//!     SchedulerConfig::builder().budget_mb(24_000).default_model("qwen2-7b").build(),
//! );
//! let backend = BackendConfig::InProcess(CandleConfig::builder().build()).build()?;
//! scheduler.set_inference_backend(backend);
//!
//! let mut out = Vec::new();
//! scheduler
//!     .infer(&CancellationToken::new(), InferRequest::new("Hello"), &mut out, None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use tracing::{info, instrument};

pub mod backend;
pub mod client;
pub mod errors;
pub mod estimator;
pub mod events;
pub mod handlers;
pub mod models;
pub mod registry;
pub mod scheduler;
pub mod sse;

pub use errors::{Phase, SchedulerError};
pub use registry::{Model, ModelRegistry};
pub use scheduler::{GenerationPermit, InferRequest, Scheduler, SchedulerConfig, StatusReport};

/// Shared state of the HTTP layer
#[derive(Clone, Debug)]
pub struct AppState {
    pub scheduler: Scheduler,
}

impl AppState {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }
}

/// Build the main router
/// This creates routes for:
/// - `GET /models`, `/status`, `/ready`, `/healthz`
/// - `POST /infer` - streams NDJSON tokens
/// - `POST /switch`, `/unload` - lifecycle control
#[instrument(skip(state))]
pub fn build_router(state: AppState) -> Router {
    info!("Building router");
    Router::new()
        .route("/models", get(handlers::models))
        .route("/status", get(handlers::status))
        .route("/ready", get(handlers::ready))
        .route("/healthz", get(handlers::healthz))
        .route("/infer", post(handlers::infer))
        .route("/switch", post(handlers::switch))
        .route("/unload", post(handlers::unload))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` is prepended to every metric name.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}
