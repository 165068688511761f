/// Request and response bodies of the HTTP layer.
use crate::errors::SchedulerError;
use crate::registry::Model;
use serde::{Deserialize, Serialize};

/// Body of `/switch` and `/unload`. An empty model means the default model.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelRequest {
    #[serde(default)]
    pub model: String,
}

/// The response from the /models endpoint, which is a list of models.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct ListModelResponse {
    /// The object type, which is always "list".
    pub object: String,
    pub data: Vec<Model>,
}

impl ListModelResponse {
    pub(crate) fn new(models: Vec<Model>) -> Self {
        Self {
            object: "list".into(),
            data: models,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub(crate) struct SwitchResponse {
    pub op_id: String,
    pub model: String,
}

#[derive(Serialize, Debug, Clone)]
pub(crate) struct UnloadResponse {
    pub model: String,
    pub unloaded: bool,
}

#[derive(Serialize, Debug, Clone)]
pub(crate) struct ErrorResponse {
    pub error: String,
    /// Stable machine-readable error class
    pub kind: &'static str,
}

impl From<&SchedulerError> for ErrorResponse {
    fn from(err: &SchedulerError) -> Self {
        let kind = match err {
            SchedulerError::ModelNotFound(_) => "model_not_found",
            SchedulerError::TooBusy(_) => "too_busy",
            SchedulerError::BudgetExceeded { .. } => "budget_exceeded",
            SchedulerError::DependencyUnavailable(_) => "dependency_unavailable",
            SchedulerError::Cancelled { .. } => "cancelled",
            SchedulerError::WarmupFailed { .. } => "warmup_failed",
            SchedulerError::Backend { .. } => "backend_error",
            SchedulerError::Panicked(_) => "internal_error",
        };
        Self {
            error: err.to_string(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_kind() {
        let body = ErrorResponse::from(&SchedulerError::TooBusy("alpha queue full".into()));
        assert_eq!(
            serde_json::to_value(body).unwrap(),
            serde_json::json!({"error": "too busy: alpha queue full", "kind": "too_busy"})
        );
    }

    #[test]
    fn test_model_request_defaults_to_empty() {
        let request: ModelRequest = serde_json::from_str("{}").unwrap();
        assert!(request.model.is_empty());
    }
}
