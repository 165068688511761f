//! Error taxonomy for the scheduler's public contract.
//!
//! Every error that crosses the public boundary names the model it concerns, and backend
//! failures also carry the [`Phase`] in which they happened, so a caller can log a precise
//! cause without inspecting scheduler state.

use crate::backend::BackendError;
use std::fmt;

/// Placeholder id used when a request names no model and no default is configured.
pub const UNSPECIFIED_MODEL: &str = "(unspecified)";

/// The step of a request in which an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ensure,
    Admission,
    BackendStart,
    Generation,
    Unload,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Ensure => "ensure",
            Phase::Admission => "admission",
            Phase::BackendStart => "backend-start",
            Phase::Generation => "generation",
            Phase::Unload => "unload",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Unknown model id (maps to 404)
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Admission queue or execution slot exhausted, or the instance is draining (maps to 429)
    #[error("too busy: {0}")]
    TooBusy(String),

    /// No idle instance could be evicted to fit the memory budget
    #[error(
        "memory budget exceeded for {model}: need {required_mb} MB, {used_mb} MB used of {budget_mb} MB (margin {margin_mb} MB)"
    )]
    BudgetExceeded {
        model: String,
        required_mb: u64,
        used_mb: u64,
        budget_mb: u64,
        margin_mb: u64,
    },

    /// No inference backend configured (maps to 503)
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// The caller's cancellation token fired while the request was suspended
    #[error("{phase} cancelled for {model}")]
    Cancelled { phase: Phase, model: String },

    /// Another caller's warmup of the same instance failed while this caller waited on it
    #[error("warmup failed for {model}: {reason}")]
    WarmupFailed { model: String, reason: String },

    /// A backend failure, wrapped with the phase and model it happened in
    #[error("{phase} failed for {model}: {source}")]
    Backend {
        phase: Phase,
        model: String,
        #[source]
        source: BackendError,
    },

    /// A panic inside the inference path, recovered and converted into an error
    #[error("inference panicked: {0}")]
    Panicked(String),
}

impl SchedulerError {
    pub(crate) fn backend(phase: Phase, model: &str, source: BackendError) -> Self {
        match source {
            BackendError::Cancelled => SchedulerError::Cancelled {
                phase,
                model: model.to_string(),
            },
            source => SchedulerError::Backend {
                phase,
                model: model.to_string(),
                source,
            },
        }
    }

    pub(crate) fn cancelled(phase: Phase, model: &str) -> Self {
        SchedulerError::Cancelled {
            phase,
            model: model.to_string(),
        }
    }

    /// Whether the error is backpressure and should map to a 429-class response.
    pub fn is_too_busy(&self) -> bool {
        matches!(self, SchedulerError::TooBusy(_))
    }

    pub fn is_model_not_found(&self) -> bool {
        matches!(self, SchedulerError::ModelNotFound(_))
    }

    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, SchedulerError::BudgetExceeded { .. })
    }

    pub fn is_dependency_unavailable(&self) -> bool {
        matches!(self, SchedulerError::DependencyUnavailable(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SchedulerError::Cancelled { .. })
    }
}
