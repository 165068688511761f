//! Integration tests for the scheduler driving real mock llama servers
//!
//! These tests spawn actual mock-llama-server processes through the subprocess backend.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use modelpool::backend::{BackendConfig, InferenceBackend, SpawnConfig, SubprocessBackend};
use modelpool::errors::SchedulerError;
use modelpool::events::MemoryPublisher;
use modelpool::handlers;
use modelpool::models::ModelRequest;
use modelpool::scheduler::InstanceState;
use modelpool::{AppState, InferRequest, Model, ModelRegistry, Scheduler, SchedulerConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// A registry of placeholder weight files in a temporary directory.
fn registry(ids: &[&str]) -> (TempDir, ModelRegistry) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let models = ids
        .iter()
        .map(|id| {
            let path = dir.path().join(format!("{id}.gguf"));
            std::fs::write(&path, b"GGUF").expect("Failed to write model file");
            Model::builder().id(*id).path(path).build()
        })
        .collect();
    (dir, ModelRegistry::new(models).expect("Invalid registry"))
}

fn spawn_config(extra_args: &[&str]) -> SpawnConfig {
    SpawnConfig::builder()
        .bin(env!("CARGO_BIN_EXE_mock-llama-server"))
        .extra_args(extra_args.iter().map(|a| a.to_string()).collect())
        .startup_timeout(Duration::from_secs(10))
        .health_interval(Duration::from_millis(20))
        .stop_grace(Duration::from_secs(2))
        .build()
}

fn scheduler(ids: &[&str], extra_args: &[&str]) -> (TempDir, Scheduler) {
    let (dir, registry) = registry(ids);
    let scheduler = Scheduler::new(registry, SchedulerConfig::default());
    let backend = BackendConfig::Subprocess(spawn_config(extra_args))
        .build()
        .expect("Failed to build backend");
    scheduler.set_inference_backend(backend);
    (dir, scheduler)
}

async fn is_listening(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

#[tokio::test]
async fn test_ensure_records_process() {
    let (_dir, scheduler) = scheduler(&["alpha"], &["--startup-delay-ms", "100"]);

    scheduler
        .ensure_instance(&CancellationToken::new(), "alpha")
        .await
        .unwrap();

    let status = scheduler.status().await;
    assert_eq!(status.instances.len(), 1);
    let instance = &status.instances[0];
    assert_eq!(instance.state, InstanceState::Ready);
    let port = instance.port.expect("port recorded");
    assert!(instance.pid.is_some_and(|pid| pid > 0));
    assert!(is_listening(port).await);
    assert_eq!(status.loads_total, 1);

    scheduler.unload_all().await;
}

#[tokio::test]
async fn test_infer_streams_ndjson() {
    let (_dir, scheduler) = scheduler(&["alpha"], &[]);
    let mut out: Vec<u8> = Vec::new();

    scheduler
        .infer(
            &CancellationToken::new(),
            InferRequest::new("hello there").with_model("alpha"),
            &mut out,
            None,
        )
        .await
        .unwrap();

    let lines: Vec<serde_json::Value> = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let tokens: Vec<&str> = lines
        .iter()
        .filter_map(|line| line["token"].as_str())
        .collect();
    assert_eq!(tokens, vec!["[alpha]", " hello", " there"]);

    let done = lines.last().unwrap();
    assert_eq!(done["done"], true);
    assert_eq!(done["content"], "[alpha] hello there");
    assert_eq!(done["finish_reason"], "stop");
    assert_eq!(done["usage"]["completion_tokens"], 3);

    scheduler.unload_all().await;
}

#[tokio::test]
async fn test_early_exit_reports_stderr() {
    let (_dir, scheduler) = scheduler(&["alpha"], &["--exit-on-start", "2"]);
    let events = Arc::new(MemoryPublisher::default());
    scheduler.set_event_publisher(events.clone());

    let err = scheduler
        .ensure_instance(&CancellationToken::new(), "alpha")
        .await
        .unwrap_err();

    assert!(matches!(err, SchedulerError::Backend { .. }), "{err:?}");
    assert!(
        err.to_string().contains("failed to load model 'alpha'"),
        "{err}"
    );

    let status = scheduler.status().await;
    assert!(status.instances.is_empty());
    assert!(
        status
            .error
            .is_some_and(|e| e.contains("failed to load model"))
    );
    assert_eq!(events.named("ensure_spawn_error").len(), 1);
}

#[tokio::test]
async fn test_unload_stops_process() {
    let (_dir, scheduler) = scheduler(&["alpha", "beta"], &[]);
    let cancel = CancellationToken::new();
    scheduler.ensure_instance(&cancel, "alpha").await.unwrap();
    scheduler.ensure_instance(&cancel, "beta").await.unwrap();

    let status = scheduler.status().await;
    let ports: Vec<u16> = status.instances.iter().filter_map(|i| i.port).collect();
    assert_eq!(ports.len(), 2);
    assert_ne!(ports[0], ports[1]);

    scheduler.unload("alpha").await.unwrap();

    let status = scheduler.status().await;
    assert_eq!(status.instances.len(), 1);
    assert_eq!(status.instances[0].model_id, "beta");
    assert!(!is_listening(ports[0]).await);
    assert!(is_listening(ports[1]).await);

    scheduler.unload_all().await;
    assert!(!is_listening(ports[1]).await);
}

#[tokio::test]
async fn test_unload_handler_called_directly() {
    let (_dir, scheduler) = scheduler(&["alpha"], &[]);
    scheduler
        .ensure_instance(&CancellationToken::new(), "alpha")
        .await
        .unwrap();
    let port = scheduler.status().await.instances[0].port.unwrap();

    let response = handlers::unload(
        State(AppState::new(scheduler.clone())),
        Json(ModelRequest {
            model: "alpha".into(),
        }),
    )
    .await
    .into_response();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(scheduler.status().await.instances.is_empty());
    assert!(!is_listening(port).await);
}

#[cfg(unix)]
fn kill(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_provision_restarts_dead_process() {
    let (_dir, registry) = registry(&["alpha"]);
    let path = registry.get("alpha").unwrap().path.clone();
    let backend = SubprocessBackend::new(spawn_config(&[])).unwrap();
    let events = Arc::new(MemoryPublisher::default());
    backend.set_event_publisher(events.clone());
    let cancel = CancellationToken::new();

    let first = backend.provision(&path, &cancel).await.unwrap().unwrap();
    kill(first.pid);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = backend.provision(&path, &cancel).await.unwrap().unwrap();

    assert_ne!(first.pid, second.pid);
    assert_eq!(backend.process_count(), 1);
    assert!(is_listening(second.port).await);
    assert_eq!(events.named("spawn_start").len(), 2);
    assert_eq!(events.named("spawn_stop").len(), 1);

    backend.shutdown().await;
    assert_eq!(backend.process_count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_infer_reloads_killed_process() {
    let (_dir, scheduler) = scheduler(&["alpha"], &[]);
    let events = Arc::new(MemoryPublisher::default());
    scheduler.set_event_publisher(events.clone());
    let cancel = CancellationToken::new();
    scheduler.ensure_instance(&cancel, "alpha").await.unwrap();
    let first = scheduler.status().await.instances[0].clone();
    kill(first.pid.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut out: Vec<u8> = Vec::new();
    scheduler
        .infer(&cancel, InferRequest::new("again").with_model("alpha"), &mut out, None)
        .await
        .unwrap();

    assert!(String::from_utf8(out).unwrap().contains("\"done\":true"));
    let status = scheduler.status().await;
    let second = &status.instances[0];
    assert_eq!(second.state, InstanceState::Ready);
    assert_ne!(second.pid, first.pid);
    assert!(is_listening(second.port.unwrap()).await);
    assert_eq!(status.loads_total, 2);
    assert_eq!(events.named("instance_exited").len(), 1);

    scheduler.unload_all().await;
}
