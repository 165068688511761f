//! Configuration parsing and validation for the modelpool server
//!
//! This module handles command-line argument parsing and validation using clap.
//! Every flag can also be set through a `MODELPOOL_*` environment variable.
use anyhow::{Context, anyhow, bail};
use clap::{ArgAction, Parser, ValueEnum};
use modelpool::SchedulerConfig;
use modelpool::backend::{BackendConfig, CandleConfig, RemoteConfig, SpawnConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendMode {
    /// Forward to an already-running OpenAI-compatible server
    Remote,
    /// Spawn and supervise one server process per model
    Subprocess,
    /// Run GGUF models inside this process
    InProcess,
}

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the HTTP server will listen.
    #[arg(short = 'p', long, env = "MODELPOOL_PORT", default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, env = "MODELPOOL_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, env = "MODELPOOL_METRICS", default_value_t = true, action = ArgAction::Set)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "modelpool")]
    pub metrics_prefix: String,

    /// JSON file listing the available models.
    #[arg(short = 'f', long, env = "MODELPOOL_REGISTRY", conflicts_with = "models_dir")]
    pub registry: Option<PathBuf>,

    /// Directory scanned for `*.gguf` weights when no registry file is given.
    #[arg(short = 'd', long, env = "MODELPOOL_MODELS_DIR")]
    pub models_dir: Option<PathBuf>,

    /// Model used when a request does not name one.
    #[arg(long, env = "MODELPOOL_DEFAULT_MODEL")]
    pub default_model: Option<String>,

    /// Memory budget in MB shared by all loaded models. 0 disables the budget.
    #[arg(long, env = "MODELPOOL_BUDGET_MB", default_value_t = 0)]
    pub budget_mb: u64,

    /// Headroom in MB that loaded models may never consume.
    #[arg(long, env = "MODELPOOL_MARGIN_MB", default_value_t = 0)]
    pub margin_mb: u64,

    /// Queue slots per model, including the one executing.
    #[arg(long, env = "MODELPOOL_MAX_QUEUE_DEPTH", default_value_t = 32)]
    pub max_queue_depth: usize,

    /// How long a request may wait for admission, in milliseconds.
    #[arg(long, env = "MODELPOOL_MAX_WAIT_MS", default_value_t = 30_000)]
    pub max_wait_ms: u64,

    /// How long unload waits for in-flight work, in milliseconds.
    #[arg(long, env = "MODELPOOL_DRAIN_TIMEOUT_MS", default_value_t = 5_000)]
    pub drain_timeout_ms: u64,

    /// Bound on loading a model, in seconds.
    #[arg(long, env = "MODELPOOL_WARMUP_TIMEOUT_SECS", default_value_t = 120)]
    pub warmup_timeout_secs: u64,

    #[arg(long, env = "MODELPOOL_BACKEND", value_enum, default_value_t = BackendMode::Subprocess)]
    pub backend: BackendMode,

    /// Base URL of the server used by the remote backend.
    #[arg(long, env = "MODELPOOL_REMOTE_URL")]
    pub remote_url: Option<String>,

    /// Bearer token sent to the remote server.
    #[arg(long, env = "MODELPOOL_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Server binary spawned by the subprocess backend.
    #[arg(long, env = "MODELPOOL_LLAMA_BIN", default_value = "llama-server")]
    pub llama_bin: PathBuf,

    /// Address spawned servers bind to.
    #[arg(long, env = "MODELPOOL_LLAMA_HOST", default_value = "127.0.0.1")]
    pub llama_host: String,

    /// Inclusive port range for spawned servers, e.g. `8100-8199`.
    #[arg(long, env = "MODELPOOL_PORT_RANGE", value_parser = parse_port_range)]
    pub port_range: Option<(u16, u16)>,

    /// Context size passed as `-c`.
    #[arg(long, env = "MODELPOOL_CTX_SIZE")]
    pub ctx_size: Option<u32>,

    /// GPU layers passed as `-ngl`.
    #[arg(long, env = "MODELPOOL_GPU_LAYERS")]
    pub gpu_layers: Option<i32>,

    /// Threads passed as `-t`.
    #[arg(long, env = "MODELPOOL_THREADS")]
    pub threads: Option<u32>,

    /// Tokenizer for the in-process backend. Defaults to `tokenizer.json` beside each model.
    #[arg(long, env = "MODELPOOL_TOKENIZER")]
    pub tokenizer: Option<PathBuf>,

    /// Extra arguments appended to every spawned server command line.
    #[arg(long = "extra-arg", allow_hyphen_values = true)]
    pub extra_args: Vec<String>,

    /// Enable debug logging for this crate.
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

fn parse_port_range(value: &str) -> Result<(u16, u16), String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got '{value}'"))?;
    let start: u16 = start.trim().parse().map_err(|e| format!("bad start port: {e}"))?;
    let end: u16 = end.trim().parse().map_err(|e| format!("bad end port: {e}"))?;
    if start == 0 || start > end {
        return Err(format!("invalid port range {start}-{end}"));
    }
    Ok((start, end))
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        match (&self.registry, &self.models_dir) {
            (Some(file), _) if !file.exists() => {
                return Err(anyhow!("Registry file '{}' does not exist", file.display()));
            }
            (None, Some(dir)) if !dir.is_dir() => {
                return Err(anyhow!("Models directory '{}' does not exist", dir.display()));
            }
            (None, None) => bail!("Either --registry or --models-dir is required"),
            _ => {}
        }
        if self.backend == BackendMode::Remote && self.remote_url.is_none() {
            bail!("--remote-url is required with --backend remote");
        }
        Ok(self)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::builder()
            .maybe_default_model(self.default_model.clone())
            .budget_mb(self.budget_mb)
            .margin_mb(self.margin_mb)
            .max_queue_depth(self.max_queue_depth)
            .max_wait(Duration::from_millis(self.max_wait_ms))
            .drain_timeout(Duration::from_millis(self.drain_timeout_ms))
            .warmup_timeout(Duration::from_secs(self.warmup_timeout_secs))
            .build()
    }

    pub fn backend_config(&self) -> Result<BackendConfig, anyhow::Error> {
        Ok(match self.backend {
            BackendMode::Remote => {
                let base_url = self
                    .remote_url
                    .clone()
                    .context("--remote-url is required with --backend remote")?;
                BackendConfig::Remote(
                    RemoteConfig::builder()
                        .base_url(base_url)
                        .maybe_api_key(self.api_key.clone())
                        .build(),
                )
            }
            BackendMode::Subprocess => BackendConfig::Subprocess(
                SpawnConfig::builder()
                    .bin(self.llama_bin.clone())
                    .host(self.llama_host.clone())
                    .maybe_port_range(self.port_range)
                    .maybe_ctx_size(self.ctx_size)
                    .maybe_gpu_layers(self.gpu_layers)
                    .maybe_threads(self.threads)
                    .extra_args(self.extra_args.clone())
                    .startup_timeout(Duration::from_secs(self.warmup_timeout_secs))
                    .build(),
            ),
            BackendMode::InProcess => BackendConfig::InProcess(
                CandleConfig::builder()
                    .maybe_tokenizer(self.tokenizer.clone())
                    .build(),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("8100-8199"), Ok((8100, 8199)));
        assert!(parse_port_range("8199-8100").is_err());
        assert!(parse_port_range("8100").is_err());
    }

    #[test]
    fn test_requires_a_model_source() {
        let config = Config::parse_from(["modelpool"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_requires_url() {
        let dir = tempfile::tempdir().unwrap();
        let dir_arg = dir.path().to_str().unwrap();
        let config = Config::parse_from(["modelpool", "-d", dir_arg, "--backend", "remote"]);
        assert!(config.validate().is_err());

        let config = Config::parse_from([
            "modelpool",
            "-d",
            dir_arg,
            "--backend",
            "remote",
            "--remote-url",
            "http://127.0.0.1:8080",
        ])
        .validate()
        .unwrap();
        assert!(matches!(config.backend_config().unwrap(), BackendConfig::Remote(_)));
    }

    #[test]
    fn test_in_process_uses_tokenizer_flag() {
        let config = Config::parse_from([
            "modelpool",
            "--backend",
            "in-process",
            "--tokenizer",
            "/models/tokenizer.json",
        ]);
        match config.backend_config().unwrap() {
            BackendConfig::InProcess(candle) => assert_eq!(
                candle.tokenizer.as_deref(),
                Some(std::path::Path::new("/models/tokenizer.json"))
            ),
            other => panic!("unexpected backend: {other:?}"),
        }
    }

    #[test]
    fn test_scheduler_config_from_flags() {
        let config = Config::parse_from([
            "modelpool",
            "--budget-mb",
            "24000",
            "--margin-mb",
            "512",
            "--max-wait-ms",
            "250",
            "--default-model",
            "qwen",
        ]);
        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.budget_mb, 24000);
        assert_eq!(scheduler.margin_mb, 512);
        assert_eq!(scheduler.max_wait, Duration::from_millis(250));
        assert_eq!(scheduler.default_model.as_deref(), Some("qwen"));
    }
}
