mod analyze;
mod health;
mod index;
mod metrics;

pub use analyze::Analysis;

use crate::{model_service::ModelService, server::SharedState};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

pub fn api_routes<M: ModelService>(body_limit_bytes: usize) -> Router<SharedState<M>> {
    Router::new()
        .route("/", get(index::index::<M>))
        .route(
            "/analyze",
            post(analyze::analyze::<M>).layer(DefaultBodyLimit::max(body_limit_bytes)),
        )
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler::<M>))
}
