use anyhow::{Context, Result};
use snapfind_core::{CaptionModel, Captioner, ModelOptions};
use snapfind_store::FileStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod flow;
mod http;
mod page;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("snapfindd starting");

    let config = config::Config::from_env()?;
    let store = FileStore::open(&config.store_dir)?;
    tracing::info!(
        store = %store.dir().display(),
        models = %config.model_dir.display(),
        device = %config.device,
        "configuration loaded"
    );

    let model_dir = config.model_dir.clone();
    let max_new_tokens = config.max_new_tokens;
    let intra_threads = config.intra_threads;
    let loader: engine::CaptionerLoader = Box::new(move |device| {
        let opts = ModelOptions {
            model_dir: model_dir.clone(),
            device,
            max_new_tokens,
            intra_threads,
        };
        CaptionModel::load(&opts).map(|model| Box::new(model) as Box<dyn Captioner>)
    });
    let engine = engine::spawn_engine(loader, Some(config.device))?;

    let state = http::AppState {
        store,
        engine,
        batches: Arc::new(flow::BatchRegistry::default()),
        default_device: config.device,
    };
    let app = http::router(state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(addr = %config.bind, "snapfindd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("snapfindd shutting down");
    Ok(())
}
