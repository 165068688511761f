/// Axum handlers for the scheduler's HTTP surface
use crate::AppState;
use crate::errors::SchedulerError;
use crate::models::{ErrorResponse, ListModelResponse, ModelRequest, SwitchResponse, UnloadResponse};
use crate::scheduler::{FlushHook, InferRequest};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::{StreamExt, stream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const STREAM_BUFFER_BYTES: usize = 64 * 1024;

/// A scheduler error rendered as a JSON body with the matching status code.
#[derive(Debug)]
pub struct ApiError(pub SchedulerError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            SchedulerError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            SchedulerError::TooBusy(_) => StatusCode::TOO_MANY_REQUESTS,
            SchedulerError::BudgetExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            SchedulerError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SchedulerError::Cancelled { .. } => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            debug!(error = %self.0, status = status.as_u16(), "Request rejected");
        }
        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}

#[instrument(skip(state))]
pub async fn models(State(state): State<AppState>) -> impl IntoResponse {
    Json(ListModelResponse::new(state.scheduler.list_models()))
}

#[instrument(skip(state))]
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.status().await)
}

pub async fn ready(State(state): State<AppState>) -> StatusCode {
    if state.scheduler.ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn healthz() -> &'static str {
    "ok"
}

#[instrument(skip(state))]
pub async fn switch(
    State(state): State<AppState>,
    Json(request): Json<ModelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let op_id = state.scheduler.switch(&request.model)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SwitchResponse {
            op_id,
            model: request.model,
        }),
    ))
}

#[instrument(skip(state))]
pub async fn unload(
    State(state): State<AppState>,
    Json(request): Json<ModelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.scheduler.unload(&request.model).await?;
    Ok(Json(UnloadResponse {
        model: request.model,
        unloaded: true,
    }))
}

/// Run an inference and stream the result as NDJSON.
///
/// Errors raised before the first line is written map to a status code. Once streaming
/// has started the status is already sent, so a failure is reported as a final
/// `{"error": ...}` line instead.
#[instrument(skip_all)]
pub async fn infer(
    State(state): State<AppState>,
    Json(request): Json<InferRequest>,
) -> Result<Response, ApiError> {
    let (mut writer, reader) = tokio::io::duplex(STREAM_BUFFER_BYTES);
    let cancel = CancellationToken::new();
    let streaming = Arc::new(AtomicBool::new(false));

    let task = {
        let scheduler = state.scheduler.clone();
        let cancel = cancel.clone();
        let streaming = Arc::clone(&streaming);
        tokio::spawn(async move {
            let flag = Arc::clone(&streaming);
            let hook: &FlushHook = &move || flag.store(true, Ordering::Release);
            let result = scheduler.infer(&cancel, request, &mut writer, Some(hook)).await;
            if let Err(e) = &result
                && streaming.load(Ordering::Acquire)
            {
                warn!(error = %e, "Inference failed mid-stream");
                let line = serde_json::json!({ "error": e.to_string() });
                let _ = writer.write_all(format!("{line}\n").as_bytes()).await;
            }
            result
        })
    };

    // Dropping the handler or the body (client disconnect) cancels the inference,
    // including while it is still warming up or queued
    let guard = cancel.drop_guard();
    let mut lines = ReaderStream::new(reader);
    let first = match lines.next().await {
        Some(Ok(first)) => first,
        Some(Err(e)) => {
            error!(error = %e, "Failed to read inference stream");
            return Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
        None => {
            return match task.await {
                Ok(Ok(())) => Ok(StatusCode::NO_CONTENT.into_response()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => {
                    error!(error = %e, "Inference task failed");
                    Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response())
                }
            };
        }
    };

    info!("Streaming inference response");
    let body = stream::once(async move { Ok(first) })
        .chain(lines)
        .map(move |chunk| {
            let _guard = &guard;
            chunk
        });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerConfig;
    use crate::test_utils::scheduler_with_sizes;
    use std::time::Duration;

    #[tokio::test]
    async fn test_disconnect_during_warmup_cancels_inference() {
        let (scheduler, backend) =
            scheduler_with_sizes(&[("alpha", 10)], SchedulerConfig::default());
        backend.set_provision_delay(Duration::from_millis(200));
        let state = AppState::new(scheduler.clone());

        let request = infer(State(state), Json(InferRequest::new("hi").with_model("alpha")));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), request)
                .await
                .is_err()
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(backend.starts.load(Ordering::SeqCst), 0);
        assert!(scheduler.status().await.instances.is_empty());
    }

    #[tokio::test]
    async fn test_completed_inference_is_not_cancelled() {
        let (scheduler, backend) =
            scheduler_with_sizes(&[("alpha", 10)], SchedulerConfig::default());
        let state = AppState::new(scheduler);

        let response = infer(State(state), Json(InferRequest::new("hi").with_model("alpha")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).contains("\"done\":true"));
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
    }
}
