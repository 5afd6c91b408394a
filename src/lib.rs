pub mod appresult;
pub mod blobs;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod messages;
pub mod receipts;
pub mod rooms;
pub mod sweeper;

use std::sync::Arc;

use axum::{extract::FromRef, routing::get, Router};
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};

pub use appresult::{AppError, AppResult};
pub use config::Config;
pub use error::{ChatError, ChatResult};

use blobs::BlobStore;
use messages::MessageStore;
use rooms::Gateway;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub blobs: BlobStore,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, config: &Config) -> Self {
        let blobs = BlobStore::new(db_pool.clone(), config.max_blob_bytes);
        let gateway = Gateway::new(
            MessageStore::new(db_pool),
            blobs.clone(),
            rooms::policy::from_config(config),
            config.outbox_capacity,
        );

        Self {
            gateway: Arc::new(gateway),
            blobs,
        }
    }
}

pub fn app(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/blobs/{id}", get(blobs::blob))
        .merge(rooms::ws_router())
        .nest("/rooms", rooms::router())
        .nest("/messages", rooms::message_router())
        .with_state(app_state)
        .layer(cors)
}
