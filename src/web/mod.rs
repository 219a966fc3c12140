pub mod handlers;

use crate::state::AppState;
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

/// Static routes are matched before the `/libs/{*rest}` catch-all.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/version-tag", get(handlers::version_tag_handler))
        .route("/libs", get(handlers::list_libraries))
        .route("/libs/reload", post(handlers::reload_libraries))
        .route("/libs/delete", delete(handlers::delete_file))
        .route(
            "/libs/customizations",
            get(handlers::get_customizations).post(handlers::set_customization),
        )
        .route(
            "/libs/customizations/{*folder_path}",
            delete(handlers::remove_customization),
        )
        .route(
            "/libs/{*rest}",
            get(handlers::libs_get_handler).post(handlers::libs_post_handler),
        )
        .layer(middleware::from_fn(handlers::log_requests))
        .with_state(state)
}
