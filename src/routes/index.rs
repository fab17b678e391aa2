use crate::{model_service::ModelService, server::SharedState};
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use tracing::instrument;

/// Serves the upload page, read from disk on every request.
#[instrument(skip(state))]
pub async fn index<M: ModelService>(State(state): State<SharedState<M>>) -> Response {
    state.metrics.record_request("/");

    match tokio::fs::read_to_string(state.index_file.as_path()).await {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!("Failed to read {:?}: {}", state.index_file, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Index page unavailable").into_response()
        }
    }
}
