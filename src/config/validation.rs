use anyhow::{anyhow, Context, Result};
use chrono::format::{Item, StrftimeItems};
use std::net::IpAddr;

use super::AppConfig;

/// Configuration validator for ensuring configuration integrity
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire application configuration
    pub fn validate(config: &AppConfig) -> Result<()> {
        Self::validate_server_config(config)?;
        Self::validate_library_config(config)?;
        Self::validate_logging_config(config)?;
        Ok(())
    }

    fn validate_server_config(config: &AppConfig) -> Result<()> {
        if config.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        config
            .server
            .host
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid server host address: {}", config.server.host))?;

        if config.server.version_poll_delay_secs == 0 {
            return Err(anyhow!("Version poll delay must be greater than 0 seconds"));
        }

        Ok(())
    }

    fn validate_library_config(config: &AppConfig) -> Result<()> {
        let library = &config.library;

        if !library.base_path.exists() {
            return Err(anyhow!(
                "Base path does not exist: {}",
                library.base_path.display()
            ));
        }
        if !library.base_path.is_dir() {
            return Err(anyhow!(
                "Base path is not a directory: {}",
                library.base_path.display()
            ));
        }

        if library.data_dir.as_os_str().is_empty() {
            return Err(anyhow!("Data directory cannot be empty"));
        }

        if library.refresh_interval_secs == 0 {
            return Err(anyhow!("Refresh interval must be greater than 0 seconds"));
        }
        if library.long_poll_timeout_secs == 0 {
            return Err(anyhow!("Long-poll timeout must be greater than 0 seconds"));
        }

        Self::validate_today_format(&library.today_format)
    }

    /// The format must be non-empty and render without errors.
    pub fn validate_today_format(format: &str) -> Result<()> {
        if format.trim().is_empty() {
            return Err(anyhow!("Today format cannot be empty"));
        }
        if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
            return Err(anyhow!("Invalid today format: {}", format));
        }
        Ok(())
    }

    fn validate_logging_config(config: &AppConfig) -> Result<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        let level = config.logging.level.to_lowercase();
        if !LEVELS.contains(&level.as_str()) {
            return Err(anyhow!("Invalid log level: {}", config.logging.level));
        }
        Ok(())
    }
}
