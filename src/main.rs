use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod labels;
mod model;
mod preprocess;
mod routes;
mod storage;
mod utils;

use config::Settings;
use model::ModelService;
use routes::AppState;
use storage::{ImageCatalog, LocalBucket};
use utils::ensure_artifacts_exist;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "graphology_service=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env().context("invalid configuration")?;
    tracing::info!(?settings, "starting graphology service");

    ensure_artifacts_exist(&settings)
        .await
        .context("failed to fetch model artifacts")?;

    let model_config = settings.model_config();
    let model = tokio::task::spawn_blocking(move || ModelService::load(&model_config))
        .await?
        .context("failed to load model")?;
    tracing::info!(policy = ?model.policy(), "model service ready");

    let bucket = LocalBucket::open(settings.storage_dir.join("objects"), &settings.public_base_url)
        .await
        .context("failed to open object storage")?;
    let catalog = ImageCatalog::new(settings.storage_dir.join("images.jsonl"));

    let state = Arc::new(AppState {
        model,
        bucket,
        catalog,
    });
    let app = routes::router(state, settings.body_limit_bytes);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .context("server error")?;

    Ok(())
}
