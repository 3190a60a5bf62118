//! Connection-mode switching and keep-awake endpoints.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::adb::connect::ConnectRequest;
use crate::state::AppState;

/// Switch each named device's connection mode. Per-device failures do not
/// abort the batch; a mixed result returns 207 with the per-device list.
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Json(requests): Json<Vec<ConnectRequest>>,
) -> (StatusCode, Json<Value>) {
    let mut results = Vec::with_capacity(requests.len());
    let mut all_ok = true;
    for request in &requests {
        match state.controller.switch(request).await {
            Ok(message) => results.push(json!({
                "device": request.device,
                "success": true,
                "message": message,
            })),
            Err(e) => {
                all_ok = false;
                results.push(json!({
                    "device": request.device,
                    "success": false,
                    "error": e.to_string(),
                }));
            }
        }
    }
    // A change in attached transports shows up on the next refresh.
    state.tracker.trigger_refresh();

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    (status, Json(json!({ "success": all_ok, "results": results })))
}

#[derive(Deserialize)]
pub struct KeepAwakeRequest {
    pub device: String,
    #[serde(default)]
    pub seconds: Option<u64>,
}

pub async fn keep_awake(
    State(state): State<Arc<AppState>>,
    Json(body): Json<KeepAwakeRequest>,
) -> Result<Json<Value>, crate::error::GatewayError> {
    let seconds = state
        .keep_awake
        .keep_awake(&body.device, body.seconds)
        .await?;
    Ok(Json(json!({ "success": true, "seconds": seconds })))
}
