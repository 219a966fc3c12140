use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use imgshelf::{
    config::{AppConfig, Args},
    library::{CustomizationsStore, LibraryIndex, RatingsStore},
    logging,
    state::AppState,
    watcher::{FolderWatcher, NotifyWatcher},
    web,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let debug = args.debug;
    let config = AppConfig::from_args(args).context("Invalid configuration")?;

    logging::init_logging_with_options(Some(config.logging.level.as_str()), debug)?;

    let version_tag: Arc<str> = config.resolve_version_tag().into();
    logging::log_startup_info(&config, &version_tag);

    let write_delay = config.write_debounce();
    let ratings = Arc::new(RatingsStore::new(&config.library.data_dir, write_delay));
    let customizations = Arc::new(CustomizationsStore::new(&config.library.data_dir, write_delay));

    // Migrates legacy per-folder rating files on first start.
    if let Err(e) = ratings.load() {
        warn!("Failed to load ratings from {}: {}", ratings.ratings_file().display(), e);
    }

    let watcher: Arc<dyn FolderWatcher> = Arc::new(NotifyWatcher::new());
    let library = Arc::new(
        LibraryIndex::open(
            &config.library.base_path,
            ratings,
            customizations,
            config.folder_options(Some(watcher)),
        )
        .with_context(|| {
            format!(
                "Failed to scan library at {}",
                config.library.base_path.display()
            )
        })?,
    );
    logging::log_library_summary(&library.list()?);

    let addr = config.socket_addr()?;
    let app_state = AppState {
        config: Arc::new(config),
        library: library.clone(),
        version_tag,
    };
    let app = web::create_router(app_state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Server is running on http://{}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shutting down, flushing pending writes");
    if let Err(e) = library.flush() {
        error!("Failed to flush pending writes: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
