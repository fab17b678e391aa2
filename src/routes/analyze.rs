use crate::{
    model_service::{ModelService, PredictionError},
    server::SharedState,
};
use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::instrument;

const FILE_FIELD: &str = "file";

#[derive(Serialize, Deserialize, Debug)]
pub struct Analysis {
    pub result: String,
}

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("Invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Missing multipart field `file`")]
    MissingFile,
    #[error("{0}")]
    Prediction(#[from] PredictionError),
}

impl IntoResponse for AnalyzeError {
    fn into_response(self) -> Response {
        let status = match &self {
            AnalyzeError::Multipart(e) => e.status(),
            AnalyzeError::MissingFile => StatusCode::BAD_REQUEST,
            AnalyzeError::Prediction(PredictionError::Decode(_)) => StatusCode::BAD_REQUEST,
            AnalyzeError::Prediction(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Analyze request failed: {}", self);
        } else {
            tracing::warn!("Analyze request rejected: {}", self);
        }
        (status, self.to_string()).into_response()
    }
}

#[instrument(skip(state, multipart))]
pub async fn analyze<M: ModelService>(
    State(state): State<SharedState<M>>,
    mut multipart: Multipart,
) -> Result<Json<Analysis>, AnalyzeError> {
    state.metrics.record_request("/analyze");

    let image_data = read_file_field(&mut multipart).await?;
    tracing::debug!("Received {} bytes of image data", image_data.len());

    let start = Instant::now();
    let prediction = state.model_service.predict(image_data).await;
    state
        .metrics
        .record_prediction_duration(duration_ms(start.elapsed()), "/analyze");

    let label = prediction?;
    tracing::info!("Predicted label {}", label);
    state.metrics.record_prediction(&label);

    Ok(Json(Analysis { result: label }))
}

async fn read_file_field(multipart: &mut Multipart) -> Result<Bytes, AnalyzeError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(FILE_FIELD) {
            return Ok(field.bytes().await?);
        }
    }
    Err(AnalyzeError::MissingFile)
}

/// Saturates instead of wrapping for durations past `u64::MAX` milliseconds.
fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
