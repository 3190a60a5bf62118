//! Server-push sockets: `devices-list` streams device snapshots on change,
//! `record-status` streams recording-state snapshots.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::adb::tracker::DeviceRecord;
use crate::recording::SessionMode;
use crate::state::AppState;

/// A device record as presented to the browser, with the live recording
/// state folded in.
#[derive(Serialize)]
struct DeviceView<'a> {
    #[serde(flatten)]
    record: &'a DeviceRecord,
    recording_state: SessionMode,
}

pub async fn serve_devices_list(socket: WebSocket, state: Arc<AppState>) {
    let (snapshot, mut changes) = state.tracker.subscribe();
    let (mut sink, mut stream) = socket.split();

    // Cached snapshot immediately; the refreshed one follows on broadcast.
    if send_devices(&mut sink, &state, &snapshot).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            changed = changes.recv() => match changed {
                Ok(snapshot) => {
                    if send_devices(&mut sink, &state, &snapshot).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "devices-list subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn send_devices(
    sink: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
    records: &[DeviceRecord],
) -> Result<(), axum::Error> {
    let views: Vec<DeviceView<'_>> = records
        .iter()
        .map(|record| DeviceView {
            record,
            recording_state: state.recording_status.state_of(&record.id),
        })
        .collect();
    let json = serde_json::to_string(&views).unwrap_or_else(|_| "[]".to_string());
    sink.send(Message::Text(json)).await
}

pub async fn serve_record_status(socket: WebSocket, state: Arc<AppState>) {
    let (snapshot, mut changes) = state.recording_status.subscribe();
    let (mut sink, mut stream) = socket.split();

    let initial = serde_json::to_string(&snapshot).unwrap_or_else(|_| "[]".to_string());
    if sink.send(Message::Text(initial)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            changed = changes.recv() => match changed {
                Ok(snapshot) => {
                    let json = serde_json::to_string(&snapshot)
                        .unwrap_or_else(|_| "[]".to_string());
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "record-status subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
