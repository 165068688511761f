use bon::Builder;
use std::time::Duration;

pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 32;
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WARMUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_EVICTION_DEADLINE: Duration = Duration::from_secs(1);

/// Scheduler tuning. A zero `budget_mb` disables budget enforcement.
#[derive(Debug, Clone, Builder)]
pub struct SchedulerConfig {
    /// Model used when a request does not name one
    #[builder(into)]
    pub default_model: Option<String>,

    #[builder(default)]
    pub budget_mb: u64,

    /// Headroom that loaded models may never consume
    #[builder(default)]
    pub margin_mb: u64,

    /// Queue slots per instance, including the one executing
    #[builder(default = DEFAULT_MAX_QUEUE_DEPTH)]
    pub max_queue_depth: usize,

    /// Bound on each admission phase
    #[builder(default = DEFAULT_MAX_WAIT)]
    pub max_wait: Duration,

    /// How long unload waits for queued and in-flight work before tearing down anyway
    #[builder(default = DEFAULT_DRAIN_TIMEOUT)]
    pub drain_timeout: Duration,

    /// Bound on backend provisioning during ensure
    #[builder(default = DEFAULT_WARMUP_TIMEOUT)]
    pub warmup_timeout: Duration,

    /// How long ensure keeps retrying eviction while draining instances release memory
    #[builder(default = DEFAULT_EVICTION_DEADLINE)]
    pub eviction_deadline: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SchedulerConfig {
    /// Replace zero or empty values with defaults.
    pub(crate) fn normalized(mut self) -> Self {
        if self.max_queue_depth == 0 {
            self.max_queue_depth = DEFAULT_MAX_QUEUE_DEPTH;
        }
        if self.max_wait.is_zero() {
            self.max_wait = DEFAULT_MAX_WAIT;
        }
        if self.drain_timeout.is_zero() {
            self.drain_timeout = DEFAULT_DRAIN_TIMEOUT;
        }
        if self.warmup_timeout.is_zero() {
            self.warmup_timeout = DEFAULT_WARMUP_TIMEOUT;
        }
        if self.eviction_deadline.is_zero() {
            self.eviction_deadline = DEFAULT_EVICTION_DEADLINE;
        }
        self.default_model = self
            .default_model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        self
    }
}
