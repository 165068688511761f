//! Scheduler - owns the instance map, memory accounting and admission
//!
//! All mutable scheduler state lives behind one reader/writer lock. Readers (status,
//! the ensure fast path, admission lookups) share it; mutators (load, eviction, unload)
//! take it exclusively. The lock is never held across a backend call or a slot wait.

mod admission;
mod config;
mod drain;
mod infer;
mod instance;
mod lifecycle;
mod status;

pub use admission::GenerationPermit;
pub use config::{
    DEFAULT_DRAIN_TIMEOUT, DEFAULT_EVICTION_DEADLINE, DEFAULT_MAX_QUEUE_DEPTH, DEFAULT_MAX_WAIT,
    DEFAULT_WARMUP_TIMEOUT, SchedulerConfig,
};
pub use infer::{FlushHook, InferRequest};
pub use instance::InstanceState;
pub use status::{GlobalState, InstanceStatus, StatusReport};

use crate::backend::{InferenceBackend, PreflightCheck};
use crate::errors::{SchedulerError, UNSPECIFIED_MODEL};
use crate::estimator::{FileSizeEstimator, MemoryEstimator};
use crate::events::{Event, EventPublisher, NoopPublisher};
use crate::registry::{Model, ModelRegistry};
use instance::{Clock, Instance};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Mutable scheduler state, guarded by [`SchedulerInner::state`]
#[derive(Debug)]
pub(crate) struct SchedulerState {
    instances: HashMap<String, Instance>,
    /// Sum of estimates of every live instance, loading ones included
    used_mb: u64,
    status: GlobalState,
    last_error: Option<String>,
    loads_total: u64,
    evictions_total: u64,
}

pub(crate) struct SchedulerInner {
    config: SchedulerConfig,
    registry: ModelRegistry,
    estimator: Arc<dyn MemoryEstimator>,
    state: RwLock<SchedulerState>,
    backend: std::sync::RwLock<Option<Arc<dyn InferenceBackend>>>,
    publisher: std::sync::RwLock<Arc<dyn EventPublisher>>,
    clock: Clock,
    next_op: AtomicU64,
    /// Cancels background switches on shutdown
    shutdown: CancellationToken,
}

impl SchedulerInner {
    fn publish(&self, event: Event) {
        let publisher = self
            .publisher
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        publisher.publish(event);
    }

    fn backend(&self) -> Option<Arc<dyn InferenceBackend>> {
        self.backend
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// The model scheduler. Cheap to clone; clones share state.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("models", &self.inner.registry.len())
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler that estimates memory from model file sizes.
    pub fn new(registry: ModelRegistry, config: SchedulerConfig) -> Self {
        Self::with_estimator(registry, config, Arc::new(FileSizeEstimator))
    }

    pub fn with_estimator(
        registry: ModelRegistry,
        config: SchedulerConfig,
        estimator: Arc<dyn MemoryEstimator>,
    ) -> Self {
        let config = config.normalized();
        if let Some(default) = &config.default_model
            && !registry.contains(default)
        {
            warn!(model = %default, "Default model is not in the registry");
        }
        info!(
            models = registry.len(),
            budget_mb = config.budget_mb,
            margin_mb = config.margin_mb,
            max_queue_depth = config.max_queue_depth,
            "Creating scheduler"
        );

        Self {
            inner: Arc::new(SchedulerInner {
                config,
                registry,
                estimator,
                state: RwLock::new(SchedulerState {
                    instances: HashMap::new(),
                    used_mb: 0,
                    status: GlobalState::Ready,
                    last_error: None,
                    loads_total: 0,
                    evictions_total: 0,
                }),
                backend: std::sync::RwLock::new(None),
                publisher: std::sync::RwLock::new(Arc::new(NoopPublisher)),
                clock: Clock::new(),
                next_op: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Route lifecycle events to `publisher`, including the backend's own events.
    pub fn set_event_publisher(&self, publisher: Arc<dyn EventPublisher>) {
        if let Some(backend) = self.inner.backend() {
            backend.set_event_publisher(publisher.clone());
        }
        *self
            .inner
            .publisher
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = publisher;
    }

    pub fn set_inference_backend(&self, backend: Arc<dyn InferenceBackend>) {
        let publisher = self
            .inner
            .publisher
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        backend.set_event_publisher(publisher);
        info!(backend = backend.name(), "Inference backend configured");
        *self
            .inner
            .backend
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(backend);
    }

    /// A copy of the registry's models.
    pub fn list_models(&self) -> Vec<Model> {
        self.inner.registry.models().to_vec()
    }

    /// True when the last load did not fail and at least one instance is ready.
    pub async fn ready(&self) -> bool {
        let state = self.inner.state.read().await;
        state.status != GlobalState::Error
            && state
                .instances
                .values()
                .any(|i| i.state == InstanceState::Ready)
    }

    /// Start loading `model_id` in the background and return an operation id.
    ///
    /// The load keeps running after the caller goes away; only [`Scheduler::unload_all`]
    /// cancels it.
    pub fn switch(&self, model_id: &str) -> Result<String, SchedulerError> {
        let id = self.resolve_model_id(Some(model_id))?;
        if !self.inner.registry.contains(&id) {
            return Err(SchedulerError::ModelNotFound(id));
        }

        let op_id = format!("op-{}", self.inner.next_op.fetch_add(1, Ordering::Relaxed));
        self.inner
            .publish(Event::new("switch_start", id.clone()).with("op_id", op_id.clone()));
        info!(model = %id, op_id = %op_id, "Switch requested");

        let scheduler = self.clone();
        let op = op_id.clone();
        let cancel = self.inner.shutdown.child_token();
        tokio::spawn(async move {
            match scheduler.ensure_instance(&cancel, &id).await {
                Ok(()) => {
                    scheduler
                        .inner
                        .publish(Event::new("switch_done", id).with("op_id", op));
                }
                Err(e) => {
                    warn!(model = %id, op_id = %op, error = %e, "Switch failed");
                    scheduler.inner.publish(
                        Event::new("switch_error", id)
                            .with("op_id", op)
                            .with("error", e.to_string()),
                    );
                }
            }
        });

        Ok(op_id)
    }

    /// Non-destructive configuration checks.
    pub async fn preflight(&self) -> Vec<PreflightCheck> {
        let mut checks = Vec::new();
        let backend = self.inner.backend();
        checks.push(match &backend {
            Some(b) => PreflightCheck::pass("backend_configured", b.name()),
            None => PreflightCheck::fail("backend_configured", "no inference backend set"),
        });

        let default_model = self
            .inner
            .config
            .default_model
            .as_deref()
            .and_then(|id| self.inner.registry.get(id).map(|m| (id, m)));
        match &self.inner.config.default_model {
            Some(id) => {
                checks.push(PreflightCheck::pass("default_model_configured", id.clone()));
                checks.push(match default_model {
                    Some(_) => PreflightCheck::pass("default_model_in_registry", id.clone()),
                    None => PreflightCheck::fail(
                        "default_model_in_registry",
                        format!("{id} is not in the registry"),
                    ),
                });
            }
            None => checks.push(PreflightCheck::fail(
                "default_model_configured",
                "requests must name a model",
            )),
        }

        if let Some(backend) = backend {
            let path = default_model.map(|(_, m)| m.path.as_path());
            checks.extend(backend.preflight(path).await);
        }
        checks
    }

    fn resolve_model_id(&self, requested: Option<&str>) -> Result<String, SchedulerError> {
        requested
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .or(self.inner.config.default_model.as_deref())
            .map(str::to_string)
            .ok_or_else(|| SchedulerError::ModelNotFound(UNSPECIFIED_MODEL.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryPublisher;
    use crate::test_utils::{scheduler_with_sizes, scheduler_without_backend};
    use std::time::Duration;

    async fn wait_for_event(events: &MemoryPublisher, name: &str) -> Event {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(event) = events.named(name).pop() {
                    return event;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("event not published in time")
    }

    #[tokio::test]
    async fn test_switch_loads_in_background() {
        let (scheduler, backend) =
            scheduler_with_sizes(&[("alpha", 10)], SchedulerConfig::default());
        let events = Arc::new(MemoryPublisher::default());
        scheduler.set_event_publisher(events.clone());
        assert!(!scheduler.ready().await);

        let op_id = scheduler.switch("alpha").unwrap();
        assert_eq!(op_id, "op-1");

        let done = wait_for_event(&events, "switch_done").await;
        assert_eq!(done.model_id, "alpha");
        assert_eq!(done.field("op_id"), Some(&serde_json::json!("op-1")));
        assert!(scheduler.ready().await);
        assert_eq!(backend.provisions.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.switch("alpha").unwrap(), "op-2");
    }

    #[tokio::test]
    async fn test_switch_failure_is_published() {
        let (scheduler, backend) =
            scheduler_with_sizes(&[("alpha", 10)], SchedulerConfig::default());
        backend.fail_provision("no such file");
        let events = Arc::new(MemoryPublisher::default());
        scheduler.set_event_publisher(events.clone());

        scheduler.switch("alpha").unwrap();

        let failed = wait_for_event(&events, "switch_error").await;
        assert!(
            failed
                .field("error")
                .and_then(|e| e.as_str())
                .is_some_and(|e| e.contains("no such file"))
        );
        assert!(!scheduler.ready().await);
        assert_eq!(scheduler.status().await.state, GlobalState::Error);
    }

    #[tokio::test]
    async fn test_switch_unknown_model() {
        let scheduler = scheduler_without_backend(&[("alpha", 10)], SchedulerConfig::default());
        assert!(matches!(
            scheduler.switch("nope"),
            Err(SchedulerError::ModelNotFound(id)) if id == "nope"
        ));
        assert!(scheduler.switch("").unwrap_err().is_model_not_found());
    }

    #[tokio::test]
    async fn test_switch_empty_id_uses_default() {
        let (scheduler, _backend) = scheduler_with_sizes(
            &[("alpha", 10)],
            SchedulerConfig::builder().default_model("alpha").build(),
        );
        let events = Arc::new(MemoryPublisher::default());
        scheduler.set_event_publisher(events.clone());

        scheduler.switch("").unwrap();

        assert_eq!(wait_for_event(&events, "switch_done").await.model_id, "alpha");
    }

    #[tokio::test]
    async fn test_preflight() {
        let scheduler = scheduler_without_backend(&[("alpha", 10)], SchedulerConfig::default());
        let checks = scheduler.preflight().await;
        let failed: Vec<&str> = checks
            .iter()
            .filter(|c| !c.ok)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(failed, vec!["backend_configured", "default_model_configured"]);

        let (scheduler, _backend) = scheduler_with_sizes(
            &[("alpha", 10)],
            SchedulerConfig::builder().default_model("beta").build(),
        );
        let checks = scheduler.preflight().await;
        let by_name = |name: &str| checks.iter().find(|c| c.name == name).map(|c| c.ok);
        assert_eq!(by_name("backend_configured"), Some(true));
        assert_eq!(by_name("default_model_configured"), Some(true));
        assert_eq!(by_name("default_model_in_registry"), Some(false));
    }

    #[test]
    fn test_list_models() {
        let scheduler =
            scheduler_without_backend(&[("alpha", 10), ("beta", 20)], SchedulerConfig::default());
        let ids: Vec<String> = scheduler.list_models().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
    }
}
