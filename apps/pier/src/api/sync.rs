//! Mirror-mapping endpoints.

use std::sync::Arc;

use axum::{extract::State, response::Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::state::AppState;

pub async fn mappings(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "success": true, "mappings": state.sync.mappings() }))
}

#[derive(Deserialize)]
pub struct SetMappingRequest {
    pub target: String,
    #[serde(default)]
    pub devices: Vec<String>,
}

pub async fn set(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetMappingRequest>,
) -> Result<Json<Value>> {
    let stored = state.sync.set_mapping(&body.target, &body.devices);
    Ok(Json(json!({
        "success": true,
        "target": body.target.trim(),
        "devices": stored,
    })))
}

pub async fn clear(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.sync.clear();
    Json(json!({ "success": true }))
}
