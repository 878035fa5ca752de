use anyhow::Result;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cypherpunkpay::{config::Config, App};

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration first: it carries the default log level
    let (config, source) = load_config().await?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if config.logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }

    info!("Starting CypherpunkPay...");
    match source {
        Some(path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    let app = App::new(config).await?;
    app.start();

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal, initiating graceful shutdown..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    app.shutdown().await;
    info!("CypherpunkPay stopped gracefully");
    Ok(())
}

/// Load configuration from the first file found, or use defaults
async fn load_config() -> Result<(Config, Option<PathBuf>)> {
    let config_paths = vec![
        PathBuf::from("./cypherpunkpay.toml"),
        PathBuf::from("/etc/cypherpunkpay/cypherpunkpay.toml"),
        dirs::config_dir()
            .map(|d| d.join("cypherpunkpay/cypherpunkpay.toml"))
            .unwrap_or_default(),
    ];

    for path in config_paths {
        if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let config: Config = toml::from_str(&content)?;
            return Ok((config, Some(path)));
        }
    }

    Ok((Config::default(), None))
}
