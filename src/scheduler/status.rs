use super::instance::InstanceState;
use super::Scheduler;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobalState {
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatus {
    pub model_id: String,
    pub state: InstanceState,
    pub last_used_unix: u64,
    pub est_vram_mb: u64,
    pub queue_len: usize,
    pub inflight: usize,
    pub max_queue_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Point-in-time snapshot of the scheduler, taken under the shared lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// Sorted by model id
    pub instances: Vec<InstanceStatus>,
    pub budget_mb: u64,
    pub used_mb: u64,
    pub margin_mb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub warmups_in_progress: usize,
    pub draining_count: usize,
    pub state: GlobalState,
    pub loads_total: u64,
    pub evictions_total: u64,
    pub uptime_seconds: u64,
    pub server_time_unix: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl Scheduler {
    pub async fn status(&self) -> StatusReport {
        let inner = &self.inner;
        let state = inner.state.read().await;

        let mut instances: Vec<InstanceStatus> = state
            .instances
            .iter()
            .map(|(id, instance)| InstanceStatus {
                model_id: id.clone(),
                state: instance.state,
                last_used_unix: inner.clock.to_unix(instance.slots.last_used()),
                est_vram_mb: instance.est_mb,
                queue_len: instance.slots.queue_len(),
                inflight: instance.slots.inflight(),
                max_queue_depth: instance.slots.depth,
                port: instance.process.map(|p| p.port),
                pid: instance.process.map(|p| p.pid),
            })
            .collect();
        instances.sort_by(|a, b| a.model_id.cmp(&b.model_id));

        let count = |wanted: InstanceState| instances.iter().filter(|i| i.state == wanted).count();

        StatusReport {
            budget_mb: inner.config.budget_mb,
            used_mb: state.used_mb,
            margin_mb: inner.config.margin_mb,
            error: state.last_error.clone(),
            warmups_in_progress: count(InstanceState::Loading),
            draining_count: count(InstanceState::Draining),
            state: state.status,
            loads_total: state.loads_total,
            evictions_total: state.evictions_total,
            uptime_seconds: inner.clock.uptime().as_secs(),
            server_time_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            default_model: inner.config.default_model.clone(),
            instances,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerConfig;
    use crate::test_utils::scheduler_with_sizes;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_empty_status() {
        let config = SchedulerConfig::builder()
            .budget_mb(100)
            .margin_mb(5)
            .default_model("alpha")
            .build();
        let (scheduler, _backend) = scheduler_with_sizes(&[("alpha", 10)], config);

        let status = scheduler.status().await;

        assert!(status.instances.is_empty());
        assert_eq!(status.budget_mb, 100);
        assert_eq!(status.margin_mb, 5);
        assert_eq!(status.state, GlobalState::Ready);
        assert_eq!(status.default_model.as_deref(), Some("alpha"));
        assert!(status.server_time_unix > 0);
    }

    #[tokio::test]
    async fn test_counts_warmups_and_serializes() {
        let (scheduler, backend) =
            scheduler_with_sizes(&[("alpha", 10), ("beta", 20)], SchedulerConfig::default());
        scheduler
            .ensure_instance(&CancellationToken::new(), "beta")
            .await
            .unwrap();
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

        let status = scheduler.status().await;
        assert_eq!(status.warmups_in_progress, 1);
        assert_eq!(status.state, GlobalState::Loading);
        assert_eq!(status.used_mb, 30);
        assert_eq!(status.instances[0].model_id, "alpha");
        assert_eq!(status.instances[0].state, InstanceState::Loading);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "loading");
        assert_eq!(json["instances"][1]["state"], "ready");
        assert_eq!(json["instances"][1]["max_queue_depth"], 32);
        assert!(json.get("error").is_none());

        loading.await.unwrap().unwrap();
        assert_eq!(scheduler.status().await.loads_total, 2);
    }
}
