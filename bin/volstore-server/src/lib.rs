//! Volstore object server
//!
//! HTTP front end mapping object requests onto the lifecycle controller:
//! - `GET|HEAD /{device}/{account}/{container}/{object}` open and read
//! - `PUT` stage, write and commit
//! - `DELETE` unlink
//! - `GET /health`

pub mod handlers;

use axum::{Router, extract::DefaultBodyLimit, routing::get};
use std::sync::Arc;
use volstore_storage::VolumeRegistry;

/// Shared server state
#[derive(Debug)]
pub struct AppState {
    pub registry: VolumeRegistry,
}

/// Build the object server router
pub fn router(state: Arc<AppState>, max_object_size: usize) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/{device}/{account}/{container}/{*object}",
            get(handlers::get_object)
                .head(handlers::head_object)
                .put(handlers::put_object)
                .delete(handlers::delete_object),
        )
        .layer(DefaultBodyLimit::max(max_object_size))
        .with_state(state)
}
