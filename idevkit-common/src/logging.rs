//! Logging setup for idevkit

use crate::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for the application
///
/// Uses RUST_LOG when set, INFO otherwise.
pub fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install(filter, false)?;

    tracing::info!("Logging initialized");
    Ok(())
}

/// Initialize logging with a specific log level
pub fn init_logging_with_level(level: &str) -> anyhow::Result<()> {
    install(EnvFilter::new(level), false)?;

    tracing::info!("Logging initialized with level: {}", level);
    Ok(())
}

/// Initialize logging from the `[logging]` configuration section
pub fn init_logging_from_config(config: &LoggingConfig) -> anyhow::Result<()> {
    install(EnvFilter::new(&config.level), config.json)?;

    tracing::info!(level = %config.level, json = config.json, "Logging initialized");
    Ok(())
}

fn install(filter: EnvFilter, json: bool) -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
    };

    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}
