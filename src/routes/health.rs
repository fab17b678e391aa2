use axum::response::{IntoResponse, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

/// Only reachable once the model is loaded, so a response means ready.
pub async fn healthcheck() -> impl IntoResponse {
    Json(Health {
        status: "Available",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}
