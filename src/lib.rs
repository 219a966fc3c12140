pub mod config;
pub mod error;
pub mod library;
pub mod logging;
pub mod media;
pub mod metadata;
pub mod watcher;
pub mod web;

pub mod state {
    use crate::{config::AppConfig, library::LibraryIndex};
    use std::sync::Arc;

    #[derive(Clone)]
    pub struct AppState {
        pub config: Arc<AppConfig>,
        pub library: Arc<LibraryIndex>,
        pub version_tag: Arc<str>,
    }
}
