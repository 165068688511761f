mod config;

use anyhow::Context;
use clap::Parser as _;
use config::Config;
use modelpool::events::TracingPublisher;
use modelpool::{
    AppState, ModelRegistry, Scheduler, build_metrics_layer_and_handle, build_metrics_router,
    build_router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    let config = Config::parse().validate()?;

    // Initialize tracing
    let default_filter = if config.verbose { "info,modelpool=debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    info!(port = config.port, backend = ?config.backend, "Starting modelpool");

    let registry = if let Some(file) = &config.registry {
        ModelRegistry::from_file(file).await
    } else if let Some(dir) = &config.models_dir {
        ModelRegistry::scan_dir(dir).await
    } else {
        anyhow::bail!("Either --registry or --models-dir is required");
    }
    .context("Failed to build the model registry")?;
    info!(models = registry.len(), "Model registry loaded");

    let scheduler = Scheduler::new(registry, config.scheduler_config());
    scheduler.set_event_publisher(Arc::new(TracingPublisher));
    let backend = config
        .backend_config()?
        .build()
        .context("Failed to create the inference backend")?;
    scheduler.set_inference_backend(backend);

    for check in scheduler.preflight().await {
        if check.ok {
            info!(check = %check.name, detail = %check.detail, "Preflight check passed");
        } else {
            warn!(check = %check.name, detail = %check.detail, "Preflight check failed");
        }
    }

    let mut router = build_router(AppState::new(scheduler.clone()));

    if config.metrics {
        let (prometheus_layer, handle) =
            build_metrics_layer_and_handle(config.metrics_prefix.clone());
        router = router.layer(prometheus_layer);

        let metrics_router = build_metrics_router(handle);
        let bind_addr = format!("0.0.0.0:{}", config.metrics_port);
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("Metrics endpoint enabled on {}", bind_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics_router).await {
                warn!(error = %e, "Metrics server stopped");
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("modelpool listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    scheduler.unload_all().await;
    info!("All instances unloaded");
    Ok(())
}
