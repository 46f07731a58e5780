use crate::{
    config::Config,
    history::PredictionStore,
    server::{HttpServer, SharedState},
    uploads::UploadStore,
};
use std::sync::Arc;
use tokio::{signal, sync::broadcast};
use tumor_inference::InferenceService;

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting up Brain Tumor Detection API");

    let uploads = Arc::new(UploadStore::create(config.uploads.clone()).await?);
    let history = Arc::new(PredictionStore::initialize(&config.history)?);

    let inference_service = Arc::new(InferenceService::new(config.model.clone()));
    let initialized = tokio::task::spawn_blocking({
        let inference_service = inference_service.clone();
        move || inference_service.initialize().map(|_| ())
    })
    .await?;
    if let Err(e) = initialized {
        tracing::error!("Failed to initialize model: {}", e);
        return Err(e.into());
    }

    let state = SharedState {
        model_service: inference_service,
        uploads: uploads.clone(),
        history,
    };
    let server = HttpServer::new(state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let cleanup_handle = uploads.spawn_cleanup(shutdown_tx.subscribe());
    let server_handle = server.run(shutdown_tx.subscribe())?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;
    cleanup_handle.await?;

    tracing::info!("Shutting down Brain Tumor Detection API");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
