use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

pub mod validation;

use crate::library::FolderOptions;
use crate::watcher::FolderWatcher;
use validation::ConfigValidator;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DATA_DIR: &str = "./ratings";

/// Command line interface
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Browse, rate and curate folders of generated images", long_about = None)]
pub struct Args {
    /// The directory containing the image folders to serve
    pub base_path: Option<PathBuf>,

    /// Optional TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// The network port to listen on
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// The address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Where ratings.json and customizations.json are stored
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Main application configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub library: LibraryConfig,
    pub logging: LoggingConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Fixed version tag; when unset the process start time is used.
    pub version_tag: Option<String>,
    pub version_poll_delay_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            version_tag: None,
            version_poll_delay_secs: 10,
        }
    }
}

/// Library and persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub base_path: PathBuf,
    pub data_dir: PathBuf,
    pub refresh_interval_secs: u64,
    pub long_poll_timeout_secs: u64,
    pub write_debounce_ms: u64,
    pub watch_today: bool,
    pub today_format: String,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            refresh_interval_secs: 20,
            long_poll_timeout_secs: 30,
            write_debounce_ms: 5000,
            watch_today: true,
            today_format: crate::library::folder::DEFAULT_TODAY_FORMAT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Build the configuration from parsed command line arguments. Values given
    /// on the command line override the ones from the configuration file.
    pub fn from_args(args: Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::parse_file(path)?,
            None => Self::default(),
        };

        if let Some(base_path) = args.base_path {
            config.library.base_path = base_path;
        }
        if let Some(port) = args.port {
            config.server.port = port;
        }
        if let Some(host) = args.host {
            config.server.host = host;
        }
        if let Some(data_dir) = args.data_dir {
            config.library.data_dir = data_dir;
        }
        if let Some(level) = args.log_level {
            config.logging.level = level;
        }
        if args.debug {
            config.logging.level = "debug".to_string();
        }

        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config = Self::parse_file(config_path.as_ref())?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    fn parse_file(config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .host
            .parse()
            .with_context(|| format!("Invalid server host address: {}", self.server.host))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// The configured version tag, or the current time in epoch milliseconds.
    pub fn resolve_version_tag(&self) -> String {
        match self.server.version_tag.as_deref().map(str::trim) {
            Some(tag) if !tag.is_empty() => tag.to_string(),
            _ => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default()
                .to_string(),
        }
    }

    pub fn version_poll_delay(&self) -> Duration {
        Duration::from_secs(self.server.version_poll_delay_secs)
    }

    pub fn write_debounce(&self) -> Duration {
        Duration::from_millis(self.library.write_debounce_ms)
    }

    /// Folder settings derived from `[library]`; `watcher` is ignored when
    /// watching is disabled.
    pub fn folder_options(&self, watcher: Option<Arc<dyn FolderWatcher>>) -> FolderOptions {
        FolderOptions {
            refresh_interval: Duration::from_secs(self.library.refresh_interval_secs),
            long_poll_timeout: Duration::from_secs(self.library.long_poll_timeout_secs),
            today_format: self.library.today_format.clone(),
            watcher: if self.library.watch_today { watcher } else { None },
        }
    }
}
