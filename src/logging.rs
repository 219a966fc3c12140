use anyhow::{anyhow, Result};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::AppConfig;
use crate::library::{flatten_tree, FolderNode, LibraryListing};

/// Initialize logging. `RUST_LOG` wins over `log_level`; `debug` forces the
/// debug level when no level is given.
pub fn init_logging_with_options(log_level: Option<&str>, debug: bool) -> Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let level = log_level.unwrap_or(default_level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow!("Invalid log level: {}", e))?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized with level: {}", level);
    Ok(())
}

/// Log the effective configuration at startup
pub fn log_startup_info(config: &AppConfig, version_tag: &str) {
    info!("=== imgshelf starting ===");
    info!("Base path: {}", config.library.base_path.display());
    info!("Data directory: {}", config.library.data_dir.display());
    info!(
        "Refresh interval: {}s, long-poll timeout: {}s, write debounce: {}ms",
        config.library.refresh_interval_secs,
        config.library.long_poll_timeout_secs,
        config.library.write_debounce_ms
    );
    if config.library.watch_today {
        info!("Watching today's folder (format {})", config.library.today_format);
    } else {
        info!("Folder watching disabled");
    }
    info!("Version tag: {}", version_tag);
}

/// Log a summary of the scanned folder tree
pub fn log_library_summary(listing: &LibraryListing) {
    fn count(nodes: &[FolderNode]) -> usize {
        nodes.iter().map(|node| 1 + count(&node.children)).sum()
    }

    let libraries = flatten_tree(&listing.folders);
    info!(
        "Library scanned: {} folder(s), {} with images{}",
        count(&listing.folders),
        libraries.len(),
        if listing.root.is_some() { ", base directory holds images" } else { "" }
    );
    for node in libraries {
        debug!("  - {}", node.relative_path);
    }
}
