use crate::{
    config::ServerConfig, model_service::ModelService, routes::api_routes, telemetry::Metrics,
};
use axum::{
    http::{header, HeaderName},
    Router,
};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};

/// Everything a request handler needs. The model is loaded before this is
/// built and is never mutated afterwards.
#[derive(Clone)]
pub struct SharedState<M: ModelService> {
    pub model_service: Arc<M>,
    pub metrics: Arc<Metrics>,
    pub index_file: Arc<PathBuf>,
}

impl<M: ModelService> SharedState<M> {
    pub fn new(model_service: M, metrics: Arc<Metrics>, config: &ServerConfig) -> Self {
        Self {
            model_service: Arc::new(model_service),
            metrics,
            index_file: Arc::new(config.index_file.clone()),
        }
    }
}

pub fn build_router<M: ModelService>(state: SharedState<M>, config: &ServerConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers([
            HeaderName::from_static("x-requested-with"),
            header::CONTENT_TYPE,
        ]);

    Router::new()
        .merge(api_routes::<M>(config.body_limit_bytes))
        .nest_service("/static", ServeDir::new(&config.static_dir))
        .with_state(state)
        .layer(cors)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new<M: ModelService>(
        model_service: M,
        metrics: Arc<Metrics>,
        config: &ServerConfig,
    ) -> anyhow::Result<Self> {
        let addr = config.get_address();
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let app_state = SharedState::new(model_service, metrics, config);
        let router = build_router(app_state, config).layer(metrics_layer);

        let listener = TcpListener::bind(&addr).await?;

        Ok(Self { router, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(self, mut shutdown_rx: Receiver<()>) -> JoinHandle<anyhow::Result<()>> {
        match self.listener.local_addr() {
            Ok(addr) => tracing::info!("Starting app on {}", addr),
            Err(e) => tracing::warn!("Starting app on unknown address: {}", e),
        }

        let listener = self.listener;
        let router = self.router;
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok(())
        })
    }
}
