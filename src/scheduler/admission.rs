//! Two-phase admission: a bounded FIFO queue slot, then the single execution slot.

use super::instance::{InstanceState, PendingGuard, Slots};
use super::Scheduler;
use crate::errors::{Phase, SchedulerError};
use crate::events::Event;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Held for the duration of one generation. Dropping it releases the execution slot,
/// then the queue slot.
#[derive(Debug)]
pub struct GenerationPermit {
    // Drop order follows declaration order
    _exec: OwnedSemaphorePermit,
    _queue: OwnedSemaphorePermit,
    pending: PendingGuard,
}

impl GenerationPermit {
    /// Slots of the instance this permit was issued for.
    pub(crate) fn slots(&self) -> &Arc<Slots> {
        self.pending.slots()
    }
}

enum Wait {
    Acquired(OwnedSemaphorePermit),
    Closed,
    TimedOut,
    Cancelled,
}

async fn acquire(cancel: &CancellationToken, semaphore: &Arc<Semaphore>, max_wait: Duration) -> Wait {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Wait::Cancelled,
        result = tokio::time::timeout(max_wait, Arc::clone(semaphore).acquire_owned()) => match result {
            Ok(Ok(permit)) => Wait::Acquired(permit),
            Ok(Err(_)) => Wait::Closed,
            Err(_) => Wait::TimedOut,
        },
    }
}

impl Scheduler {
    /// Reserve a queue slot and then the execution slot of `model_id`'s instance.
    ///
    /// Waiters are served in arrival order. Each phase gives up after the configured
    /// max wait with [`SchedulerError::TooBusy`]. Draining instances reject immediately.
    pub async fn begin_generation(
        &self,
        cancel: &CancellationToken,
        model_id: &str,
    ) -> Result<GenerationPermit, SchedulerError> {
        let id = self.resolve_model_id(Some(model_id))?;

        let (slots, pending) = {
            let state = self.inner.state.read().await;
            let Some(instance) = state.instances.get(&id) else {
                return Err(SchedulerError::ModelNotFound(id));
            };
            if instance.state == InstanceState::Draining {
                self.reject(&id, "draining");
                return Err(SchedulerError::TooBusy(format!("{id} is draining")));
            }
            (Arc::clone(&instance.slots), instance.slots.enter())
        };

        let max_wait = self.inner.config.max_wait;
        let queue = match acquire(cancel, &slots.queue, max_wait).await {
            Wait::Acquired(permit) => permit,
            Wait::Cancelled => return Err(SchedulerError::cancelled(Phase::Admission, &id)),
            Wait::Closed => return Err(SchedulerError::TooBusy(format!("{id} was unloaded"))),
            Wait::TimedOut => {
                self.reject(&id, "queue_full");
                return Err(SchedulerError::TooBusy(format!(
                    "{id} queue full ({} slots) after {max_wait:?}",
                    slots.depth
                )));
            }
        };

        let exec = match acquire(cancel, &slots.exec, max_wait).await {
            Wait::Acquired(permit) => permit,
            Wait::Cancelled => return Err(SchedulerError::cancelled(Phase::Admission, &id)),
            Wait::Closed => return Err(SchedulerError::TooBusy(format!("{id} was unloaded"))),
            Wait::TimedOut => {
                self.reject(&id, "exec_timeout");
                return Err(SchedulerError::TooBusy(format!(
                    "{id} busy generating after {max_wait:?}"
                )));
            }
        };

        slots.touch(self.inner.clock.now());
        debug!(model = %id, queue_len = slots.queue_len(), "Admitted");

        Ok(GenerationPermit {
            _exec: exec,
            _queue: queue,
            pending,
        })
    }

    fn reject(&self, id: &str, reason: &'static str) {
        debug!(model = %id, reason, "Admission rejected");
        self.inner
            .publish(Event::new("admission_rejected", id.to_string()).with("reason", reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryPublisher;
    use crate::scheduler::SchedulerConfig;
    use crate::test_utils::scheduler_with_sizes;
    use std::sync::Mutex;
    use std::time::Instant;

    async fn loaded(config: SchedulerConfig) -> Scheduler {
        let (scheduler, _backend) = scheduler_with_sizes(&[("alpha", 10)], config);
        scheduler
            .ensure_instance(&CancellationToken::new(), "alpha")
            .await
            .unwrap();
        scheduler
    }

    #[tokio::test]
    async fn test_queue_full_returns_too_busy() {
        let scheduler = loaded(
            SchedulerConfig::builder()
                .max_queue_depth(1)
                .max_wait(Duration::from_millis(20))
                .build(),
        )
        .await;
        let events = Arc::new(MemoryPublisher::default());
        scheduler.set_event_publisher(events.clone());
        let cancel = CancellationToken::new();

        let _held = scheduler.begin_generation(&cancel, "alpha").await.unwrap();
        let started = Instant::now();
        let err = scheduler
            .begin_generation(&cancel, "alpha")
            .await
            .unwrap_err();

        assert!(err.is_too_busy(), "{err}");
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(events.named("admission_rejected").len(), 1);
    }

    #[tokio::test]
    async fn test_permit_release_frees_slots() {
        let scheduler = loaded(SchedulerConfig::default()).await;
        let cancel = CancellationToken::new();

        let permit = scheduler.begin_generation(&cancel, "alpha").await.unwrap();
        {
            let state = scheduler.inner.state.read().await;
            let slots = &state.instances["alpha"].slots;
            assert_eq!(slots.queue_len(), 1);
            assert_eq!(slots.inflight(), 1);
        }

        drop(permit);
        let state = scheduler.inner.state.read().await;
        assert!(state.instances["alpha"].slots.is_idle());
    }

    #[tokio::test]
    async fn test_fifo_order_within_instance() {
        let scheduler = loaded(SchedulerConfig::default()).await;
        let cancel = CancellationToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = scheduler.begin_generation(&cancel, "alpha").await.unwrap();

        let mut tasks = Vec::new();
        for name in ["first", "second", "third"] {
            let scheduler = scheduler.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _permit = scheduler
                    .begin_generation(&CancellationToken::new(), "alpha")
                    .await
                    .unwrap();
                order.lock().unwrap().push(name);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
            // Let each caller reach the execution slot wait before the next arrives
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_cancel_while_queued_releases_queue_slot() {
        let scheduler = loaded(SchedulerConfig::default()).await;
        let _held = scheduler
            .begin_generation(&CancellationToken::new(), "alpha")
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = scheduler
            .begin_generation(&cancel, "alpha")
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::Cancelled { phase: Phase::Admission, .. }));
        let state = scheduler.inner.state.read().await;
        let slots = &state.instances["alpha"].slots;
        assert_eq!(slots.queue_len(), 1);
        assert_eq!(slots.pending(), 1);
    }

    #[tokio::test]
    async fn test_draining_instance_rejects_without_consuming_a_slot() {
        let scheduler = loaded(SchedulerConfig::default()).await;
        scheduler
            .inner
            .state
            .write()
            .await
            .instances
            .get_mut("alpha")
            .unwrap()
            .state = InstanceState::Draining;

        let err = scheduler
            .begin_generation(&CancellationToken::new(), "alpha")
            .await
            .unwrap_err();

        assert!(err.is_too_busy());
        let state = scheduler.inner.state.read().await;
        assert!(state.instances["alpha"].slots.is_idle());
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let (scheduler, _backend) = scheduler_with_sizes(&[("alpha", 10)], SchedulerConfig::default());

        let err = scheduler
            .begin_generation(&CancellationToken::new(), "alpha")
            .await
            .unwrap_err();

        assert!(err.is_model_not_found());
    }
}
