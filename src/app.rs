use crate::{
    config::{Config, ServerConfig},
    labels::ClassLabels,
    model_service::ModelService,
    ort_service::{ModelError, OrtModelService},
    provisioner::{build_client, ensure_artifact, ProvisionError},
    server::HttpServer,
    telemetry::Metrics,
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{signal, sync::broadcast};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Artifact provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
    #[error("{0}")]
    Labels(String),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("HTTP server error: {0}")]
    Server(#[from] anyhow::Error),
}

/// Provisions the artifact, loads it, and only then binds the listener.
pub async fn start_app(config: Config) -> Result<(), AppError> {
    let model_service = load_model(&config).await?;
    serve(model_service, &config.server).await
}

async fn load_model(config: &Config) -> Result<OrtModelService, AppError> {
    let client = build_client(Duration::from_secs(config.artifact.download_timeout_secs))?;
    let artifact_path = config.artifact.get_path();
    let outcome = ensure_artifact(&client, &config.artifact.url, &artifact_path).await?;
    tracing::debug!("Artifact provisioning finished: {:?}", outcome);

    let labels = ClassLabels::new(&config.labels).map_err(AppError::Labels)?;
    let model_config = config.model.clone();

    tracing::info!("Loading model from {:?}", artifact_path);
    let model_service = tokio::task::spawn_blocking(move || {
        OrtModelService::new(&artifact_path, &model_config, labels)
    })
    .await??;

    Ok(model_service)
}

/// Serves an already loaded model until SIGINT or SIGTERM.
pub async fn serve<M: ModelService>(
    model_service: M,
    server_config: &ServerConfig,
) -> Result<(), AppError> {
    let metrics = Arc::new(Metrics::new()?);
    let server = HttpServer::new(model_service, metrics, server_config).await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut server_handle = server.run(shutdown_rx);

    tokio::select! {
        result = &mut server_handle => {
            result??;
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, starting graceful shutdown.");
            let _ = shutdown_tx.send(());
            server_handle.await??;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
