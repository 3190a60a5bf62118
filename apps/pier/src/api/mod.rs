//! HTTP action surface: JSON endpoints for out-of-band control of sessions,
//! recordings, sync mappings, connection modes and APK installs.

pub mod devices;
pub mod install;
pub mod recordings;
pub mod sync;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::json;

use crate::state::AppState;

/// JSON bodies are parsed up to this size; the raw APK upload route opts
/// out below.
const JSON_BODY_LIMIT: usize = 50 * 1024 * 1024;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/recordings", get(recordings::list))
        .route("/api/recordings/start", post(recordings::start))
        .route("/api/recordings/stop", post(recordings::stop))
        .route("/api/recordings/run", post(recordings::run))
        .route("/api/recordings/pause", post(recordings::pause))
        .route("/api/recordings/resume", post(recordings::resume))
        .route("/api/recordings/update-name", post(recordings::update_name))
        .route("/api/recordings/delete", post(recordings::delete))
        .route("/api/sync", get(sync::mappings))
        .route("/api/sync/set", post(sync::set))
        .route("/api/sync/clear", post(sync::clear))
        .route("/api/devices/connect", post(devices::connect))
        .route("/api/device/keep-awake", post(devices::keep_awake))
        .route(
            "/api/goog/device/install-apk-binary",
            post(install::upload_apk).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api/goog/device/install-uploaded",
            post(install::install_uploaded),
        )
        .route("/api/goog/device/send-binary", post(install::send_binary))
        .layer(DefaultBodyLimit::max(JSON_BODY_LIMIT))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
