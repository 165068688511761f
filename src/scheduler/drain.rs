//! Cooperative unload.
//!
//! Draining is best effort: when the drain deadline passes with work still queued or
//! executing, teardown proceeds anyway and may cut an in-flight generation short.

use super::instance::{InstanceState, Slots};
use super::Scheduler;
use crate::errors::SchedulerError;
use crate::events::Event;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

impl Scheduler {
    /// Stop admitting work for `model_id`, wait for it to drain, then tear it down.
    pub async fn unload(&self, model_id: &str) -> Result<(), SchedulerError> {
        let id = self.resolve_model_id(Some(model_id))?;
        let inner = &self.inner;

        let (slots, path, est_mb) = {
            let mut state = inner.state.write().await;
            let Some(instance) = state.instances.get_mut(&id) else {
                return Err(SchedulerError::ModelNotFound(id));
            };
            let current = instance.state;
            match current {
                InstanceState::Ready => instance.state = InstanceState::Draining,
                InstanceState::Loading => {
                    return Err(SchedulerError::TooBusy(format!("{id} is still loading")));
                }
                InstanceState::Draining => {
                    return Err(SchedulerError::TooBusy(format!("{id} is already draining")));
                }
            }
            (
                Arc::clone(&instance.slots),
                instance.model.path.clone(),
                instance.est_mb,
            )
        };

        info!(model = %id, "Draining instance");
        inner.publish(Event::new("unload_start", id.clone()));

        let deadline = Instant::now() + inner.config.drain_timeout;
        while !slots.is_idle() {
            if Instant::now() >= deadline {
                warn!(
                    model = %id,
                    inflight = slots.inflight(),
                    queue_len = slots.queue_len(),
                    "Drain timed out, tearing down anyway"
                );
                inner.publish(
                    Event::new("unload_timeout", id.clone())
                        .with("inflight", slots.inflight())
                        .with("queue_len", slots.queue_len()),
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        slots.close();
        if let Some(backend) = inner.backend() {
            backend.teardown(&path).await;
        }

        {
            let mut state = inner.state.write().await;
            let owned = state
                .instances
                .get(&id)
                .is_some_and(|i| Arc::ptr_eq(&i.slots, &slots));
            if owned {
                state.instances.remove(&id);
                state.used_mb = state.used_mb.saturating_sub(est_mb);
            }
            debug!(model = %id, used_mb = state.used_mb, "Instance removed");
        }

        info!(model = %id, freed_mb = est_mb, "Instance unloaded");
        inner.publish(Event::new("unload_done", id).with("freed_mb", est_mb));
        Ok(())
    }

    /// Forget an instance whose runtime went away on its own, so the next ensure
    /// provisions it again. Only the instance owning `slots` is removed.
    pub(crate) async fn remove_exited(&self, id: &str, slots: &Arc<Slots>) {
        let inner = &self.inner;
        let removed = {
            let mut state = inner.state.write().await;
            let owned = state
                .instances
                .get(id)
                .is_some_and(|i| Arc::ptr_eq(&i.slots, slots));
            let removed = if owned { state.instances.remove(id) } else { None };
            if let Some(instance) = &removed {
                state.used_mb = state.used_mb.saturating_sub(instance.est_mb);
            }
            removed
        };
        let Some(instance) = removed else {
            return;
        };

        instance.slots.close();
        warn!(model = %id, "Runtime exited, instance removed");
        inner.publish(Event::new("instance_exited", id).with("freed_mb", instance.est_mb));
        if let Some(backend) = inner.backend() {
            backend.teardown(&instance.model.path).await;
        }
    }

    /// Unload every ready instance, cancel background switches, and stop the backend.
    pub async fn unload_all(&self) {
        self.inner.shutdown.cancel();

        let ids: Vec<String> = {
            let state = self.inner.state.read().await;
            state
                .instances
                .iter()
                .filter(|(_, i)| i.state == InstanceState::Ready)
                .map(|(id, _)| id.clone())
                .collect()
        };
        info!(count = ids.len(), "Unloading all instances");

        let results = join_all(ids.iter().map(|id| self.unload(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!(model = %id, error = %e, "Failed to unload instance");
            }
        }

        if let Some(backend) = self.inner.backend() {
            backend.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryPublisher;
    use crate::scheduler::SchedulerConfig;
    use crate::test_utils::scheduler_with_sizes;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_unload_removes_instance() {
        let (scheduler, backend) = scheduler_with_sizes(&[("alpha", 10)], SchedulerConfig::default());
        let events = Arc::new(MemoryPublisher::default());
        scheduler.set_event_publisher(events.clone());
        scheduler
            .ensure_instance(&CancellationToken::new(), "alpha")
            .await
            .unwrap();

        scheduler.unload("alpha").await.unwrap();

        let status = scheduler.status().await;
        assert!(status.instances.is_empty());
        assert_eq!(status.used_mb, 0);
        assert_eq!(backend.teardowns(), vec![PathBuf::from("/models/alpha.gguf")]);
        let names = events.names();
        assert!(names.ends_with(&["unload_start".to_string(), "unload_done".to_string()]));
    }

    #[tokio::test]
    async fn test_unload_waits_for_inflight_work() {
        let (scheduler, _backend) = scheduler_with_sizes(&[("alpha", 10)], SchedulerConfig::default());
        let cancel = CancellationToken::new();
        scheduler.ensure_instance(&cancel, "alpha").await.unwrap();
        let permit = scheduler.begin_generation(&cancel, "alpha").await.unwrap();

        let unloading = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.unload("alpha").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Draining: the instance is still present and refuses new work
        let status = scheduler.status().await;
        assert_eq!(status.instances[0].state, InstanceState::Draining);
        assert_eq!(status.draining_count, 1);
        assert!(scheduler.begin_generation(&cancel, "alpha").await.unwrap_err().is_too_busy());
        assert!(!unloading.is_finished());

        drop(permit);
        unloading.await.unwrap().unwrap();
        assert!(scheduler.status().await.instances.is_empty());
    }

    #[tokio::test]
    async fn test_drain_timeout_still_tears_down() {
        let config = SchedulerConfig::builder()
            .drain_timeout(Duration::from_millis(30))
            .build();
        let (scheduler, backend) = scheduler_with_sizes(&[("alpha", 10)], config);
        let events = Arc::new(MemoryPublisher::default());
        scheduler.set_event_publisher(events.clone());
        let cancel = CancellationToken::new();
        scheduler.ensure_instance(&cancel, "alpha").await.unwrap();
        let _stuck = scheduler.begin_generation(&cancel, "alpha").await.unwrap();

        scheduler.unload("alpha").await.unwrap();

        assert!(scheduler.status().await.instances.is_empty());
        assert_eq!(backend.teardowns().len(), 1);
        assert_eq!(events.named("unload_timeout").len(), 1);
    }

    #[tokio::test]
    async fn test_unload_unknown_and_loading() {
        let (scheduler, backend) = scheduler_with_sizes(&[("alpha", 10)], SchedulerConfig::default());
        assert!(scheduler.unload("alpha").await.unwrap_err().is_model_not_found());

        backend.set_provision_delay(Duration::from_millis(200));
        let loading = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .ensure_instance(&CancellationToken::new(), "alpha")
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(scheduler.unload("alpha").await.unwrap_err().is_too_busy());
        loading.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unload_all() {
        let (scheduler, backend) =
            scheduler_with_sizes(&[("alpha", 10), ("beta", 10)], SchedulerConfig::default());
        let cancel = CancellationToken::new();
        scheduler.ensure_instance(&cancel, "alpha").await.unwrap();
        scheduler.ensure_instance(&cancel, "beta").await.unwrap();

        scheduler.unload_all().await;

        let status = scheduler.status().await;
        assert!(status.instances.is_empty());
        assert_eq!(status.used_mb, 0);
        assert_eq!(backend.teardowns().len(), 2);
        assert_eq!(backend.shutdowns.load(Ordering::SeqCst), 1);
    }
}
