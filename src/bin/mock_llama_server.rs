//! Mock llama.cpp server for testing the subprocess backend
//!
//! Accepts the command line `llama-server` is spawned with and serves the endpoints
//! the scheduler talks to: `/health`, `/v1/models` and streaming `/v1/completions`.
//!
//! `--exit-on-start <code>` writes a load error to stderr and exits, which is how tests
//! exercise early-exit reporting.

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use clap::Parser;
use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mock-llama-server")]
#[command(about = "Mock llama.cpp server for testing")]
struct Args {
    /// Model weights (only the file name is used)
    #[arg(short = 'm', long = "model", default_value = "mock.gguf")]
    model: PathBuf,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on, 0 for any free port
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Context size (accepted, ignored)
    #[arg(short = 'c', long = "ctx-size")]
    #[allow(dead_code)]
    ctx_size: Option<u32>,

    /// GPU layers (accepted, ignored)
    #[arg(long = "n-gpu-layers", allow_hyphen_values = true)]
    #[allow(dead_code)]
    gpu_layers: Option<i32>,

    /// Threads (accepted, ignored)
    #[arg(short = 't', long)]
    #[allow(dead_code)]
    threads: Option<u32>,

    /// Time during which /health answers 503 after binding (ms)
    #[arg(long, default_value_t = 0)]
    startup_delay_ms: u64,

    /// Print a load error to stderr and exit with this code
    #[arg(long)]
    exit_on_start: Option<i32>,

    /// Delay before each streamed token (ms)
    #[arg(long, default_value_t = 5)]
    latency_ms: u64,
}

#[derive(Debug)]
struct MockState {
    model: String,
    loaded: AtomicBool,
    latency: Duration,
    request_count: AtomicU64,
}

/// llama-server spells the GPU layers flag with a single dash.
fn normalize_args(args: impl Iterator<Item = String>) -> Vec<String> {
    args.map(|arg| match arg.as_str() {
        "-ngl" => "--n-gpu-layers".to_string(),
        _ => arg,
    })
    .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_llama_server=debug")
        .with_writer(std::io::stdout)
        .init();

    let args = Args::parse_from(normalize_args(std::env::args()));
    let model = args
        .model
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mock".to_string());

    if let Some(code) = args.exit_on_start {
        eprintln!("llama_model_load: loading model from '{}'", args.model.display());
        eprintln!("error: failed to load model '{model}'");
        std::process::exit(code);
    }

    let state = Arc::new(MockState {
        model: model.clone(),
        loaded: AtomicBool::new(args.startup_delay_ms == 0),
        latency: Duration::from_millis(args.latency_ms),
        request_count: AtomicU64::new(0),
    });

    if args.startup_delay_ms > 0 {
        info!(delay_ms = args.startup_delay_ms, "Simulating model load");
        let state = state.clone();
        let delay = Duration::from_millis(args.startup_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state.loaded.store(true, Ordering::Release);
        });
    }

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/completions", post(completions))
        .with_state(state);

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    let actual_port = listener.local_addr()?.port();

    info!(model = %model, port = actual_port, "Mock llama server listening");
    println!("READY {actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<Arc<MockState>>) -> Response {
    if state.loaded.load(Ordering::Acquire) {
        Json(serde_json::json!({ "status": "ok" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": { "code": 503, "message": "Loading model" } })),
        )
            .into_response()
    }
}

#[derive(Serialize)]
struct ModelsResponse {
    object: &'static str,
    data: Vec<ModelInfo>,
}

#[derive(Serialize)]
struct ModelInfo {
    id: String,
    object: &'static str,
    owned_by: &'static str,
}

async fn list_models(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    Json(ModelsResponse {
        object: "list",
        data: vec![ModelInfo {
            id: state.model.clone(),
            object: "model",
            owned_by: "mock-llama-server",
        }],
    })
}

#[derive(Deserialize)]
struct CompletionRequest {
    prompt: String,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    stream: bool,
}

/// Tokens echo the prompt word by word after a fixed preamble.
fn reply_tokens(model: &str, prompt: &str, max_tokens: Option<u32>) -> Vec<String> {
    let mut tokens = vec![format!("[{model}]")];
    tokens.extend(prompt.split_whitespace().map(|word| format!(" {word}")));
    if let Some(max) = max_tokens.filter(|&n| n > 0) {
        tokens.truncate(max as usize);
    }
    tokens
}

fn sse(value: serde_json::Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

async fn completions(
    State(state): State<Arc<MockState>>,
    Json(request): Json<CompletionRequest>,
) -> Response {
    if !state.loaded.load(Ordering::Acquire) {
        warn!("Completion requested while the model is loading");
        return (StatusCode::SERVICE_UNAVAILABLE, "Loading model").into_response();
    }

    let count = state.request_count.fetch_add(1, Ordering::Relaxed) + 1;
    let tokens = reply_tokens(&state.model, &request.prompt, request.max_tokens);
    let prompt_tokens = request.prompt.split_whitespace().count() as u64;
    let completion_tokens = tokens.len() as u64;
    let finish_reason = match request.max_tokens {
        Some(max) if max > 0 && completion_tokens >= u64::from(max) => "length",
        _ => "stop",
    };

    info!(
        model = %state.model,
        request_num = count,
        stream = request.stream,
        tokens = completion_tokens,
        "Processing completion"
    );

    if !request.stream {
        return Json(serde_json::json!({
            "id": format!("cmpl-mock-{count}"),
            "object": "text_completion",
            "model": state.model,
            "choices": [{ "index": 0, "text": tokens.concat(), "finish_reason": finish_reason }],
            "usage": {
                "prompt_tokens": prompt_tokens,
                "completion_tokens": completion_tokens,
                "total_tokens": prompt_tokens + completion_tokens,
            },
        }))
        .into_response();
    }

    let latency = state.latency;
    let chunks = tokens
        .into_iter()
        .map(|text| sse(serde_json::json!({ "choices": [{ "index": 0, "text": text }] })))
        .chain([
            sse(serde_json::json!({
                "choices": [{ "index": 0, "text": "", "finish_reason": finish_reason }],
                "usage": {
                    "prompt_tokens": prompt_tokens,
                    "completion_tokens": completion_tokens,
                    "total_tokens": prompt_tokens + completion_tokens,
                },
            })),
            Bytes::from_static(b"data: [DONE]\n\n"),
        ])
        .collect::<Vec<_>>();
    let body = stream::iter(chunks).then(move |chunk| async move {
        tokio::time::sleep(latency).await;
        Ok::<_, Infallible>(chunk)
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_args() {
        let args = ["mock", "-m", "a.gguf", "-ngl", "-1"].map(String::from);
        let parsed = Args::parse_from(normalize_args(args.into_iter()));
        assert_eq!(parsed.gpu_layers, Some(-1));
        assert_eq!(parsed.model, PathBuf::from("a.gguf"));
    }

    #[test]
    fn test_reply_tokens() {
        assert_eq!(
            reply_tokens("alpha", "hello there", None),
            vec!["[alpha]", " hello", " there"]
        );
        assert_eq!(reply_tokens("alpha", "hello there", Some(2)).len(), 2);
    }
}
