use candle_core::Device;
use clap::Parser;
use dfu_serve::asset::{AssetFetcher, FetchOutcome};
use dfu_serve::cli::{Cli, Commands};
use dfu_serve::config::Config;
use dfu_serve::model::{ModelKind, ModelLoader, ModelRegistry, ReadinessSnapshot};
use dfu_serve::{coordinator, server, Error, Result};
use std::sync::Arc;

fn parse_device(device_str: &str) -> Result<Device> {
    match device_str {
        "cpu" => Ok(Device::Cpu),
        s if s.starts_with("cuda") => {
            let parts: Vec<&str> = s.split(':').collect();
            let ordinal = if parts.len() > 1 {
                parts[1]
                    .parse::<usize>()
                    .map_err(|_| Error::InvalidInput(format!("Invalid CUDA device: {}", s)))?
            } else {
                0
            };
            Device::new_cuda(ordinal)
                .map_err(|e| Error::ConfigError(format!("Failed to initialize CUDA device: {}", e)))
        }
        _ => Err(Error::InvalidInput(format!("Unknown device: {}", device_str))),
    }
}

async fn initialize(config: &Config, device: &Device) -> Result<(Arc<ModelRegistry>, ReadinessSnapshot)> {
    let registry = Arc::new(ModelRegistry::new());
    let loader = Arc::new(ModelLoader::from_config(config, device, Arc::clone(&registry))?);
    let snapshot = coordinator::initialize_all(loader, &ModelKind::ALL).await;
    Ok((registry, snapshot))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Serve { device, port, host } => {
            let device = parse_device(&device)?;
            let device_name = format!("{:?}", device);

            println!("🚀 DFU inference service starting...");
            println!("   Device: {}", device_name);
            println!("   Assets: {:?}", config.assets_dir);

            let (registry, snapshot) = initialize(&config, &device).await?;
            for (kind, status) in &snapshot.kinds {
                println!(
                    "   {}: {}",
                    kind,
                    match (&status.origin, status.loaded) {
                        (Some(origin), true) => format!("loaded via {}", origin),
                        _ => "not loaded".to_string(),
                    }
                );
            }

            println!("   Listening on: http://{}:{}", host, port);
            println!("   Health: http://{}:{}/api/health", host, port);

            let state = server::AppState::new(registry, device_name);
            server::serve(&host, port, state).await?;
        }

        Commands::Fetch { kind } => {
            let source = match kind {
                ModelKind::Classification => &config.classifier_source,
                ModelKind::Detection => &config.detector_source,
            };
            let destination = config.assets_dir.join(kind.filename());

            let fetcher = AssetFetcher::new(config.policy.fetch.clone())?;
            match fetcher.ensure(source, &destination).await? {
                FetchOutcome::AlreadyPresent => {
                    println!("✓ {} already present: {:?}", source.description, destination);
                }
                FetchOutcome::Downloaded { url, bytes } => {
                    println!("✓ Downloaded {}", source.description);
                    println!("  From: {}", url);
                    println!("  Path: {:?}", destination);
                    println!("  Size: {} bytes", bytes);
                }
            }
        }

        Commands::Status { device } => {
            let device = parse_device(&device)?;
            let (_registry, snapshot) = initialize(&config, &device).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    Ok(())
}
