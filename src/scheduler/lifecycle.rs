//! Instance lifecycle: ensure, LRU eviction and warmup.

use super::instance::{Instance, InstanceState, Slots, Warmup};
use super::{GlobalState, Scheduler, SchedulerConfig, SchedulerInner, SchedulerState};
use crate::backend::{BackendError, ProcessInfo};
use crate::errors::{Phase, SchedulerError};
use crate::events::Event;
use crate::registry::Model;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const EVICTION_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// An instance already removed from the map whose backend resources still need releasing.
#[derive(Debug)]
pub(crate) struct Evicted {
    pub id: String,
    pub path: PathBuf,
    pub est_mb: u64,
}

enum EvictionPlan {
    Fits(Vec<Evicted>),
    /// The budget cannot be met now. `draining` is set when memory is about to be freed.
    Blocked {
        evicted: Vec<Evicted>,
        draining: bool,
    },
}

impl SchedulerState {
    fn fits(&self, config: &SchedulerConfig, required_mb: u64) -> bool {
        config.budget_mb == 0
            || self.used_mb + required_mb + config.margin_mb <= config.budget_mb
    }

    /// Remove least-recently-used idle instances until `required_mb` fits.
    ///
    /// Only Ready instances with no queued, executing or arriving callers are candidates.
    /// Ties on recency are broken arbitrarily.
    fn evict_until_fits(&mut self, config: &SchedulerConfig, required_mb: u64) -> EvictionPlan {
        let mut evicted = Vec::new();

        if config.budget_mb > 0 && required_mb + config.margin_mb > config.budget_mb {
            return EvictionPlan::Blocked {
                evicted,
                draining: false,
            };
        }

        while !self.fits(config, required_mb) {
            let victim = self
                .instances
                .iter()
                .filter(|(_, instance)| instance.is_evictable())
                .min_by_key(|(_, instance)| instance.slots.last_used())
                .map(|(id, _)| id.clone());

            let Some(id) = victim else {
                let draining = self
                    .instances
                    .values()
                    .any(|i| i.state == InstanceState::Draining);
                return EvictionPlan::Blocked { evicted, draining };
            };

            if let Some(instance) = self.instances.remove(&id) {
                instance.slots.close();
                self.used_mb = self.used_mb.saturating_sub(instance.est_mb);
                self.evictions_total += 1;
                evicted.push(Evicted {
                    id,
                    path: instance.model.path,
                    est_mb: instance.est_mb,
                });
            }
        }

        EvictionPlan::Fits(evicted)
    }
}

impl Scheduler {
    /// Make sure an instance of `model_id` is loaded and ready.
    ///
    /// An empty id resolves to the configured default model. Concurrent callers for the
    /// same model wait on the first caller's warmup instead of loading twice.
    pub async fn ensure_instance(
        &self,
        cancel: &CancellationToken,
        model_id: &str,
    ) -> Result<(), SchedulerError> {
        let id = self.resolve_model_id(Some(model_id))?;
        let inner = &self.inner;

        // Fast path: already ready
        {
            let state = inner.state.read().await;
            if let Some(instance) = state.instances.get(&id)
                && instance.state == InstanceState::Ready
            {
                instance.slots.touch(inner.clock.now());
                trace!(model = %id, "Instance already ready");
                return Ok(());
            }
        }

        inner.publish(Event::new("ensure_start", id.clone()));
        let Some(model) = inner.registry.get(&id).cloned() else {
            inner.publish(Event::new("ensure_model_not_found", id.clone()));
            return Err(SchedulerError::ModelNotFound(id));
        };
        let required_mb = inner.estimator.estimate_mb(&model).await;
        let config = &inner.config;
        let deadline = Instant::now() + config.eviction_deadline;

        let (warmup, evicted) = loop {
            let mut state = inner.state.write().await;

            if let Some(instance) = state.instances.get(&id) {
                let current = instance.state;
                match current {
                    InstanceState::Ready => {
                        instance.slots.touch(inner.clock.now());
                        return Ok(());
                    }
                    InstanceState::Draining => {
                        return Err(SchedulerError::TooBusy(format!("{id} is draining")));
                    }
                    InstanceState::Loading => {
                        let warmup = instance.warmup.clone();
                        drop(state);
                        debug!(model = %id, "Waiting for warmup in progress");
                        wait_for_warmup(cancel, &id, warmup).await?;
                        continue;
                    }
                }
            }

            match state.evict_until_fits(config, required_mb) {
                EvictionPlan::Fits(evicted) => {
                    let (tx, rx) = watch::channel(Warmup::Pending);
                    state.instances.insert(
                        id.clone(),
                        Instance {
                            model: model.clone(),
                            state: InstanceState::Loading,
                            est_mb: required_mb,
                            process: None,
                            slots: Arc::new(Slots::new(config.max_queue_depth, inner.clock.now())),
                            warmup: rx,
                        },
                    );
                    state.used_mb += required_mb;
                    state.status = GlobalState::Loading;
                    debug!(model = %id, required_mb, used_mb = state.used_mb, "Instance loading");
                    break (tx, evicted);
                }
                EvictionPlan::Blocked { evicted, draining } => {
                    let used_mb = state.used_mb;
                    drop(state);
                    self.release_evicted(evicted).await;

                    if draining && Instant::now() < deadline {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(SchedulerError::cancelled(Phase::Ensure, &id));
                            }
                            _ = tokio::time::sleep(EVICTION_RETRY_INTERVAL) => continue,
                        }
                    }

                    warn!(
                        model = %id,
                        required_mb,
                        used_mb,
                        budget_mb = config.budget_mb,
                        "No idle instance can be evicted to fit the budget"
                    );
                    inner.publish(
                        Event::new("ensure_budget_fail", id.clone())
                            .with("required_mb", required_mb)
                            .with("used_mb", used_mb)
                            .with("budget_mb", config.budget_mb),
                    );
                    return Err(SchedulerError::BudgetExceeded {
                        model: id,
                        required_mb,
                        used_mb,
                        budget_mb: config.budget_mb,
                        margin_mb: config.margin_mb,
                    });
                }
            }
        };

        let mut load = LoadGuard {
            inner: Arc::clone(&self.inner),
            id: id.clone(),
            path: model.path.clone(),
            warmup: Some(warmup),
        };
        self.release_evicted(evicted).await;

        let outcome = self.provision(cancel, &id, &model).await;
        load.settle(outcome).await
    }

    /// Release backend resources of evicted instances, outside the map lock.
    pub(crate) async fn release_evicted(&self, evicted: Vec<Evicted>) {
        if evicted.is_empty() {
            return;
        }
        let backend = self.inner.backend();
        for victim in evicted {
            info!(model = %victim.id, freed_mb = victim.est_mb, "Evicting idle instance");
            self.inner
                .publish(Event::new("evict", victim.id.clone()).with("freed_mb", victim.est_mb));
            if let Some(backend) = &backend {
                backend.teardown(&victim.path).await;
            }
        }
    }

    async fn provision(
        &self,
        cancel: &CancellationToken,
        id: &str,
        model: &Model,
    ) -> Result<Option<ProcessInfo>, SchedulerError> {
        let Some(backend) = self.inner.backend() else {
            debug!(model = %id, "No backend configured, nothing to provision");
            return Ok(None);
        };

        let token = cancel.child_token();
        let timeout = self.inner.config.warmup_timeout;
        let mut provision = backend.provision(&model.path, &token);
        let result = tokio::select! {
            result = &mut provision => result,
            _ = tokio::time::sleep(timeout) => {
                // Let the backend clean up after itself before reporting
                token.cancel();
                let _ = provision.await;
                Err(BackendError::Timeout(timeout))
            }
        };

        result.map_err(|e| SchedulerError::backend(Phase::Ensure, id, e))
    }
}

async fn wait_for_warmup(
    cancel: &CancellationToken,
    id: &str,
    mut warmup: watch::Receiver<Warmup>,
) -> Result<(), SchedulerError> {
    let outcome = |warmup: &Warmup| match warmup {
        Warmup::Ready => Some(Ok(())),
        Warmup::Failed(reason) => Some(Err(SchedulerError::WarmupFailed {
            model: id.to_string(),
            reason: reason.clone(),
        })),
        Warmup::Pending => None,
    };

    loop {
        if let Some(result) = outcome(&warmup.borrow_and_update()) {
            return result;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(SchedulerError::cancelled(Phase::Ensure, id)),
            changed = warmup.changed() => {
                if changed.is_err() {
                    return outcome(&warmup.borrow()).unwrap_or_else(|| {
                        Err(SchedulerError::WarmupFailed {
                            model: id.to_string(),
                            reason: "warmup abandoned".to_string(),
                        })
                    });
                }
            }
        }
    }
}

/// Settles a Loading instance exactly once, even if the ensure future is dropped.
struct LoadGuard {
    inner: Arc<SchedulerInner>,
    id: String,
    path: PathBuf,
    warmup: Option<watch::Sender<Warmup>>,
}

impl LoadGuard {
    async fn settle(
        &mut self,
        outcome: Result<Option<ProcessInfo>, SchedulerError>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.inner.state.write().await;
        let Some(warmup) = self.warmup.take() else {
            return outcome.map(|_| ());
        };

        match outcome {
            Ok(process) => {
                let mut est_mb = 0;
                if let Some(instance) = state.instances.get_mut(&self.id) {
                    instance.state = InstanceState::Ready;
                    instance.process = process;
                    instance.slots.touch(self.inner.clock.now());
                    est_mb = instance.est_mb;
                }
                state.loads_total += 1;
                state.status = GlobalState::Ready;
                state.last_error = None;
                let used_mb = state.used_mb;
                drop(state);
                warmup.send_replace(Warmup::Ready);

                info!(model = %self.id, est_mb, used_mb, "Instance ready");
                let mut event = Event::new("ensure_ready", self.id.clone()).with("est_mb", est_mb);
                if let Some(process) = process {
                    self.inner.publish(
                        Event::new("ensure_spawn_ready", self.id.clone())
                            .with("port", process.port)
                            .with("pid", process.pid),
                    );
                    event = event.with("port", process.port).with("pid", process.pid);
                }
                self.inner.publish(event);
                Ok(())
            }
            Err(err) => {
                remove_loading(&mut state, &self.id, &err.to_string());
                drop(state);
                warmup.send_replace(Warmup::Failed(err.to_string()));

                warn!(model = %self.id, error = %err, "Instance failed to load");
                let name = match err {
                    SchedulerError::Backend { .. } => "ensure_spawn_error",
                    _ => "ensure_error",
                };
                self.inner
                    .publish(Event::new(name, self.id.clone()).with("error", err.to_string()));
                Err(err)
            }
        }
    }
}

fn remove_loading(state: &mut SchedulerState, id: &str, error: &str) {
    if let Some(instance) = state.instances.remove(id) {
        instance.slots.close();
        state.used_mb = state.used_mb.saturating_sub(instance.est_mb);
    }
    state.status = GlobalState::Error;
    state.last_error = Some(error.to_string());
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        let Some(warmup) = self.warmup.take() else {
            return;
        };
        // The ensure future was dropped mid-load; clean up in the background
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let id = std::mem::take(&mut self.id);
        let path = std::mem::take(&mut self.path);
        handle.spawn(async move {
            let reason = "load abandoned by caller";
            remove_loading(&mut *inner.state.write().await, &id, reason);
            warmup.send_replace(Warmup::Failed(reason.to_string()));
            if let Some(backend) = inner.backend() {
                backend.teardown(&path).await;
            }
            warn!(model = %id, "Load abandoned before completion");
            inner.publish(Event::new("ensure_error", id).with("error", reason));
        });
    }
}
