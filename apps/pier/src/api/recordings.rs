//! Recording control and management endpoints. Session-scoped operations
//! look the session up by id and drive its state machine; the rest operate
//! on the on-disk store.

use std::sync::Arc;

use axum::{
    extract::State,
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};
use crate::recording::normalize_id;
use crate::state::AppState;
use crate::ws::proxy::ProxySession;

fn session_of(state: &AppState, name: &str) -> Result<Arc<ProxySession>> {
    state
        .sessions
        .get(name)
        .ok_or_else(|| GatewayError::NotFound(format!("session {name}")))
}

#[derive(Deserialize)]
pub struct SessionRequest {
    pub session: String,
    #[serde(default)]
    pub id: Option<String>,
}

pub async fn start(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionRequest>,
) -> Result<Json<Value>> {
    let session = session_of(&state, &body.session)?;
    let id = session.start_recording(body.id).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

pub async fn stop(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionRequest>,
) -> Result<Json<Value>> {
    let session = session_of(&state, &body.session)?;
    let outcome = session.stop().await?;
    Ok(Json(json!({ "success": true, "stopped": outcome })))
}

pub async fn run(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionRequest>,
) -> Result<Json<Value>> {
    let id = body
        .id
        .ok_or_else(|| GatewayError::BadParam("id is required".into()))?;
    let session = session_of(&state, &body.session)?;
    session.run_recording(&id).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn pause(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionRequest>,
) -> Result<Json<Value>> {
    session_of(&state, &body.session)?.pause().await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn resume(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionRequest>,
) -> Result<Json<Value>> {
    session_of(&state, &body.session)?.resume().await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn list(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let recordings = state.recordings.list().await?;
    let summaries: Vec<Value> = recordings
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "name": r.name,
                "remote": r.remote,
                "createdAt": r.created_at,
                "messages": r.messages.len(),
            })
        })
        .collect();
    Ok(Json(json!({ "success": true, "recordings": summaries })))
}

#[derive(Deserialize)]
pub struct UpdateNameRequest {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn update_name(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateNameRequest>,
) -> Result<Json<Value>> {
    state
        .recordings
        .update_name(&normalize_id(&body.id), body.name)
        .await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
pub struct DeleteRequest {
    pub id: String,
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeleteRequest>,
) -> Result<Json<Value>> {
    state.recordings.delete(&normalize_id(&body.id)).await?;
    Ok(Json(json!({ "success": true })))
}
