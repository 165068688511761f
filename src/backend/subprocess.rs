//! Subprocess backend - spawns and supervises one completion server per model path
//!
//! The backend is responsible for:
//! - Picking a free TCP port (optionally from a configured range)
//! - Spawning the server with its stderr captured into a small ring buffer
//! - Polling the health endpoint until ready, while watching for an early exit
//! - Graceful teardown: SIGTERM, a grace period, then a forced kill
//!
//! The process table has its own lock, independent of the scheduler's instance map.

use super::openai::CompletionEndpoint;
use super::{
    BackendError, InferParams, InferenceBackend, InferenceSession, PreflightCheck, ProcessInfo,
    model_file_checks,
};
use crate::client::{HttpClient, create_hyper_client};
use crate::events::{Event, EventPublisher, NoopPublisher};
use async_trait::async_trait;
use bon::Builder;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Number of stderr lines kept per process.
const STDERR_TAIL_LINES: usize = 32;

#[derive(Debug, Clone, Builder)]
pub struct SpawnConfig {
    /// Server binary, e.g. `llama-server`
    #[builder(into)]
    pub bin: PathBuf,
    #[builder(into, default = String::from("127.0.0.1"))]
    pub host: String,
    /// Inclusive port range; any free port when unset
    pub port_range: Option<(u16, u16)>,
    pub ctx_size: Option<u32>,
    pub gpu_layers: Option<i32>,
    pub threads: Option<u32>,
    #[builder(default)]
    pub extra_args: Vec<String>,
    #[builder(into, default = String::from("/health"))]
    pub health_path: String,
    #[builder(default = Duration::from_secs(120))]
    pub startup_timeout: Duration,
    /// Bound on a single health check
    #[builder(default = Duration::from_secs(2))]
    pub health_timeout: Duration,
    #[builder(default = Duration::from_millis(200))]
    pub health_interval: Duration,
    /// Time allowed between SIGTERM and a forced kill
    #[builder(default = Duration::from_secs(5))]
    pub stop_grace: Duration,
}

impl SpawnConfig {
    pub fn args(&self, model_path: &Path, port: u16) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            model_path.display().to_string(),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            port.to_string(),
        ];
        if let Some(ctx) = self.ctx_size.filter(|&c| c > 0) {
            args.extend(["-c".to_string(), ctx.to_string()]);
        }
        if let Some(ngl) = self.gpu_layers {
            args.extend(["-ngl".to_string(), ngl.to_string()]);
        }
        if let Some(threads) = self.threads.filter(|&t| t > 0) {
            args.extend(["-t".to_string(), threads.to_string()]);
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Address used to reach the server from this process.
    fn connect_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            "::" => "[::1]",
            host => host,
        }
    }
}

/// State of a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned, health check not yet passed
    Starting,
    /// Health check passed
    Running,
}

struct ManagedProcess {
    state: ProcessState,
    child: Option<Child>,
    stderr_tail: Arc<std::sync::Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
}

struct ManagedEntry {
    port: u16,
    pid: u32,
    process: Mutex<ManagedProcess>,
}

pub struct SubprocessBackend {
    config: SpawnConfig,
    client: Arc<dyn HttpClient>,
    /// Supervised processes keyed by model path
    processes: DashMap<PathBuf, Arc<ManagedEntry>>,
    publisher: RwLock<Arc<dyn EventPublisher>>,
}

impl std::fmt::Debug for SubprocessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessBackend")
            .field("config", &self.config)
            .field("processes", &self.processes.len())
            .finish()
    }
}

impl SubprocessBackend {
    pub fn new(config: SpawnConfig) -> Result<Self, BackendError> {
        if config.bin.as_os_str().is_empty() {
            return Err(BackendError::Config("server binary path is empty".into()));
        }
        if let Some((start, end)) = config.port_range
            && (start == 0 || start > end)
        {
            return Err(BackendError::Config(format!(
                "invalid port range {start}-{end}"
            )));
        }
        Ok(Self {
            config,
            client: Arc::new(create_hyper_client()),
            processes: DashMap::new(),
            publisher: RwLock::new(Arc::new(NoopPublisher)),
        })
    }

    /// Get the state of the process serving `model_path`
    pub async fn process_state(&self, model_path: &Path) -> Option<ProcessState> {
        let entry = self.entry(model_path)?;
        let guard = entry.process.lock().await;
        Some(guard.state.clone())
    }

    /// Number of processes currently in the table
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    fn entry(&self, model_path: &Path) -> Option<Arc<ManagedEntry>> {
        self.processes.get(model_path).map(|e| e.value().clone())
    }

    fn publish(&self, event: Event) {
        let publisher = self
            .publisher
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        publisher.publish(event);
    }

    fn endpoint(&self, port: u16) -> CompletionEndpoint {
        CompletionEndpoint {
            client: self.client.clone(),
            base_url: format!("http://{}:{}", self.config.connect_host(), port),
            api_key: None,
            connect_timeout: Some(Duration::from_secs(10)),
            request_timeout: None,
        }
    }

    fn pick_port(&self) -> Result<u16, BackendError> {
        let in_use: Vec<u16> = self.processes.iter().map(|e| e.value().port).collect();
        let host = self.config.host.as_str();

        match self.config.port_range {
            Some((start, end)) => (start..=end)
                .filter(|port| !in_use.contains(port))
                .find(|&port| std::net::TcpListener::bind((host, port)).is_ok())
                .ok_or(BackendError::NoFreePort { start, end }),
            None => std::net::TcpListener::bind((host, 0))
                .and_then(|listener| listener.local_addr())
                .map(|addr| addr.port())
                .map_err(|e| BackendError::Spawn(format!("failed to pick a free port: {e}"))),
        }
    }

    /// Port of a live, ready process for `model_path`. Exited processes are reaped.
    async fn live_port(&self, model_path: &Path) -> Option<u16> {
        let entry = self.entry(model_path)?;
        let exited = {
            let mut guard = entry.process.lock().await;
            if guard.state != ProcessState::Running {
                return None;
            }
            match guard.child.as_mut().map(|c| c.try_wait()) {
                Some(Ok(None)) => false,
                Some(Ok(Some(status))) => {
                    warn!(path = %model_path.display(), status = %status, "Supervised process exited");
                    true
                }
                Some(Err(e)) => {
                    warn!(path = %model_path.display(), error = %e, "Failed to check process status");
                    false
                }
                None => true,
            }
        };
        if exited {
            self.stop_entry(model_path, &entry).await;
            return None;
        }
        Some(entry.port)
    }

    async fn spawn_and_wait(
        &self,
        model_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ProcessInfo, BackendError> {
        let port = self.pick_port()?;
        let args = self.config.args(model_path, port);
        let path_label = model_path.display().to_string();
        info!(path = %path_label, port, bin = %self.config.bin.display(), "Starting server process");
        debug!(path = %path_label, args = ?args, "Server command args");

        let mut child = Command::new(&self.config.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackendError::Spawn(format!("{}: {}", self.config.bin.display(), e))
            })?;

        let pid = child.id().unwrap_or_default();
        let stderr_tail = Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(
            STDERR_TAIL_LINES,
        )));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(capture_stderr(stderr, stderr_tail.clone(), pid)));

        let entry = Arc::new(ManagedEntry {
            port,
            pid,
            process: Mutex::new(ManagedProcess {
                state: ProcessState::Starting,
                child: Some(child),
                stderr_tail,
                stderr_task,
            }),
        });
        self.processes
            .insert(model_path.to_path_buf(), entry.clone());
        self.publish(
            Event::new("spawn_start", path_label.clone())
                .with("port", port)
                .with("pid", pid),
        );

        let endpoint = self.endpoint(port);
        let deadline = Instant::now() + self.config.startup_timeout;

        loop {
            // Check if process died
            let exit_status = {
                let mut guard = entry.process.lock().await;
                match guard.child.as_mut().map(|c| c.try_wait()) {
                    Some(Ok(status)) => status,
                    Some(Err(e)) => {
                        warn!(path = %path_label, error = %e, "Failed to check process status");
                        None
                    }
                    None => None,
                }
            };
            if let Some(status) = exit_status {
                let stderr_tail = self.drain_stderr(&entry).await;
                self.processes
                    .remove_if(model_path, |_, v| Arc::ptr_eq(v, &entry));
                warn!(path = %path_label, status = %status, "Server process exited during startup");
                self.publish(
                    Event::new("spawn_exit", path_label.clone())
                        .with("status", status.to_string())
                        .with("stderr_tail", stderr_tail.clone()),
                );
                return Err(BackendError::EarlyExit {
                    status: status.to_string(),
                    stderr_tail,
                });
            }

            let health = tokio::select! {
                _ = cancel.cancelled() => None,
                result = endpoint.check_health(&self.config.health_path, self.config.health_timeout) => Some(result),
            };
            match health {
                None => {
                    info!(path = %path_label, "Startup cancelled, stopping server process");
                    self.stop_entry(model_path, &entry).await;
                    return Err(BackendError::Cancelled);
                }
                Some(Ok(true)) => {
                    entry.process.lock().await.state = ProcessState::Running;
                    info!(path = %path_label, port, pid, "Server process is ready");
                    self.publish(
                        Event::new("spawn_ready", path_label)
                            .with("port", port)
                            .with("pid", pid),
                    );
                    return Ok(ProcessInfo { port, pid });
                }
                Some(Ok(false)) => {
                    debug!(path = %path_label, "Health check returned unhealthy, retrying...");
                }
                Some(Err(e)) => {
                    trace!(path = %path_label, error = %e, "Health check failed, retrying...");
                }
            }

            if Instant::now() >= deadline {
                warn!(path = %path_label, timeout = ?self.config.startup_timeout, "Server process did not become healthy");
                self.stop_entry(model_path, &entry).await;
                return Err(BackendError::HealthTimeout(self.config.startup_timeout));
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop_entry(model_path, &entry).await;
                    return Err(BackendError::Cancelled);
                }
                _ = tokio::time::sleep(self.config.health_interval) => {}
            }
        }
    }

    /// Wait briefly for the stderr reader to hit EOF and return the captured tail.
    async fn drain_stderr(&self, entry: &ManagedEntry) -> String {
        let (task, tail) = {
            let mut guard = entry.process.lock().await;
            guard.child = None;
            (guard.stderr_task.take(), guard.stderr_tail.clone())
        };
        if let Some(task) = task
            && tokio::time::timeout(Duration::from_secs(1), task).await.is_err()
        {
            debug!(pid = entry.pid, "Stderr reader still open after exit");
        }
        let lines = tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Terminate the process and drop its table entry, whatever the outcome.
    async fn stop_entry(&self, model_path: &Path, entry: &Arc<ManagedEntry>) {
        let child = {
            let mut guard = entry.process.lock().await;
            if let Some(task) = guard.stderr_task.take() {
                task.abort();
            }
            guard.child.take()
        };

        let mut forced = false;
        if let Some(mut child) = child {
            terminate(&mut child);
            match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(pid = entry.pid, status = %status, "Server process exited");
                }
                Ok(Err(e)) => {
                    warn!(pid = entry.pid, error = %e, "Failed to wait for server process");
                }
                Err(_) => {
                    forced = true;
                    warn!(pid = entry.pid, grace = ?self.config.stop_grace, "Server process ignored SIGTERM, killing");
                    if let Err(e) = child.kill().await {
                        warn!(pid = entry.pid, error = %e, "Failed to kill server process");
                    }
                }
            }
        }

        self.processes
            .remove_if(model_path, |_, v| Arc::ptr_eq(v, entry));
        info!(path = %model_path.display(), pid = entry.pid, forced, "Server process stopped");
        self.publish(
            Event::new("spawn_stop", model_path.display().to_string())
                .with("pid", entry.pid)
                .with("port", entry.port)
                .with("forced", forced),
        );
    }
}

/// Ask the process to exit gracefully.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}

async fn capture_stderr(
    stderr: ChildStderr,
    tail: Arc<std::sync::Mutex<VecDeque<String>>>,
    pid: u32,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                trace!(pid, line = %line, "server stderr");
                let mut tail = tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(pid, error = %e, "Stopped reading server stderr");
                break;
            }
        }
    }
}

#[async_trait]
impl InferenceBackend for SubprocessBackend {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn provision(
        &self,
        model_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<ProcessInfo>, BackendError> {
        if let Some(entry) = self.entry(model_path) {
            let running = entry.process.lock().await.state == ProcessState::Running;
            let healthy = running
                && self
                    .endpoint(entry.port)
                    .check_health(&self.config.health_path, self.config.health_timeout)
                    .await
                    .unwrap_or(false);
            if healthy {
                return Ok(Some(ProcessInfo {
                    port: entry.port,
                    pid: entry.pid,
                }));
            }
            info!(path = %model_path.display(), "Restarting stale server process");
            self.stop_entry(model_path, &entry).await;
        }

        self.spawn_and_wait(model_path, cancel).await.map(Some)
    }

    async fn start(
        &self,
        model_path: &Path,
        params: InferParams,
    ) -> Result<Box<dyn InferenceSession>, BackendError> {
        // Spawning is left to provision, which runs under the scheduler's ensure path
        let Some(port) = self.live_port(model_path).await else {
            return Err(BackendError::NotRunning(model_path.display().to_string()));
        };
        Ok(Box::new(self.endpoint(port).session(
            Some(model_path.display().to_string()),
            params,
        )))
    }

    async fn teardown(&self, model_path: &Path) {
        if let Some(entry) = self.entry(model_path) {
            self.stop_entry(model_path, &entry).await;
        }
    }

    async fn shutdown(&self) {
        let paths: Vec<PathBuf> = self.processes.iter().map(|e| e.key().clone()).collect();
        info!(count = paths.len(), "Stopping all server processes");
        futures_util::future::join_all(paths.iter().map(|path| self.teardown(path))).await;
    }

    fn set_event_publisher(&self, publisher: Arc<dyn EventPublisher>) {
        *self
            .publisher
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = publisher;
    }

    async fn preflight(&self, model_path: Option<&Path>) -> Vec<PreflightCheck> {
        let mut checks = vec![binary_check(&self.config.bin)];
        checks.extend(model_file_checks(model_path));
        checks
    }
}

fn binary_check(bin: &Path) -> PreflightCheck {
    let found = if bin.components().count() > 1 {
        bin.is_file().then(|| bin.to_path_buf())
    } else {
        std::env::var_os("PATH").and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(bin))
                .find(|candidate| candidate.is_file())
        })
    };
    match found {
        Some(path) => PreflightCheck::pass("server_binary", path.display().to_string()),
        None => PreflightCheck::fail(
            "server_binary",
            format!("{} not found", bin.display()),
        ),
    }
}
