use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vision_serving_core::{
    AppConfig, HttpFetcher, ImageDecoder, ModelRegistry, build_router, engine::default_loader,
};

fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .max_blocking_threads(config.max_blocking_threads)
        .enable_all()
        .build()?;

    runtime.block_on(serve(config))
}

async fn serve(config: Arc<AppConfig>) -> anyhow::Result<()> {
    tracing::info!(model_dir = %config.model_dir.display(), device = %config.device, "loading models");

    let registry = Arc::new(ModelRegistry::initialize(config.as_ref(), default_loader())?);
    if registry.is_empty() {
        tracing::warn!("no models loaded, every prediction route will answer 404");
    }

    let fetcher = HttpFetcher::new(config.fetch_timeout, config.max_image_bytes)?;
    let decoder = ImageDecoder::new(Box::new(fetcher), config.max_image_bytes);
    let router = build_router(config.clone(), registry, decoder);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
