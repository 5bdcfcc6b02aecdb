use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tower_http::services::ServeDir;
use tracing_subscriber::EnvFilter;

use facvision::adapters::{
    http::{router, state::HttpState},
    onnx::model_catalog::OnnxModelCatalog,
    sinks::SinkFactory,
    source::CameraSources,
};
use facvision::application::services::InspectionService;
use facvision::config::{AppConfig, ProjectFile};
use facvision::domain::inspection::ProjectContext;

fn bootstrap(service: &InspectionService, file: ProjectFile) -> anyhow::Result<()> {
    for camera in file.cameras {
        let id = camera.id.clone();
        service.register_camera(camera).with_context(|| format!("camera {id}"))?;
    }
    for model in file.models {
        let id = model.id.clone();
        service.register_model(model).with_context(|| format!("model {id}"))?;
    }
    if let Some(actions) = file.actions {
        service.apply_actions(actions).context("actions")?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!("cannot listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Logging (RUST_LOG, info by default)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::parse();
    let project_file = config.project_file.as_deref().map(ProjectFile::load).transpose()?;
    let project = project_file
        .as_ref()
        .map(|f| f.project.clone())
        .unwrap_or_else(|| ProjectContext { id: config.project_id.clone(), name: String::new() });

    tracing::info!(project = %project.id, "initialising adapters");

    // 2. Infrastructure adapters, shared between the service and the HTTP server
    let sources = Arc::new(CameraSources::new(config.ffmpeg.clone(), config.connect_timeout())?);
    let models = Arc::new(OnnxModelCatalog::new(config.model_dir.clone()));
    let sinks = Arc::new(SinkFactory::new(
        project.clone(),
        config.database.clone(),
        config.image_dir.clone(),
        config.connect_timeout(),
    ));

    // 3. Use cases
    let service = Arc::new(InspectionService::new(
        project,
        config.to_pipeline_config(),
        sources,
        models,
        sinks,
    ));
    if let Some(file) = project_file {
        bootstrap(&service, file).context("loading project file")?;
    }

    // 4. API state and router, dashboard assets as fallback
    let state = HttpState { inspection: service.clone() };
    let app = router(state).fallback_service(ServeDir::new(&config.static_dir));

    // 5. Serve until ctrl-c / SIGTERM
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!("dashboard at http://{}", config.bind);
    tracing::info!("static files served from {}", config.static_dir.display());

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    service.shutdown();
    Ok(())
}
