use cropscan_api::setup;
use cropscan_core::Config;

// mimalloc as the global allocator.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let (app, background) = setup::initialize_app(config.clone()).await?;

    let served = setup::server::start_server(&config, app).await;

    background.shutdown().await;
    tracing::info!("Shutdown complete");

    served
}
