use anyhow::Context;
use clap::Parser;
use flux_config::ConfigLoader;
use flux_ipcam::{CameraEngine, Device};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "FLUX IP Camera Engine")]
struct Args {
    /// 包含 global.toml 与 cameras.toml 的目录
    #[arg(long, default_value = "./config")]
    config_dir: String,

    /// 覆盖 RUST_LOG
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match &args.log_filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,flux_ipcam=debug")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let loader = ConfigLoader::new(&args.config_dir);
    let global = loader.load_global().context("failed to load global.toml")?;
    ConfigLoader::validate_global(&global)?;
    let cameras: Vec<Device> = loader.load_cameras().context("failed to load cameras.toml")?;
    info!(
        config_dir = %args.config_dir,
        cameras = cameras.len(),
        "Starting FLUX IP camera engine"
    );

    let engine = CameraEngine::new(global);
    let mut events = engine.subscribe();

    for device in cameras {
        let device_id = device.id.clone();
        if let Err(e) = engine.add_device(device).await {
            error!(device_id = %device_id, "Skipping camera: {}", e);
            continue;
        }
        if let Err(e) = engine.start_device(&device_id).await {
            error!(device_id = %device_id, "Failed to start camera: {}", e);
        }
    }

    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "ipcam_events", "{}", json),
                    Err(e) => warn!("Failed to encode event: {}", e),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");

    engine.shutdown().await?;
    logger.abort();
    Ok(())
}
