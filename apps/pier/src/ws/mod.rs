//! Inbound WebSocket surface: one endpoint, classified by the `action`
//! query parameter.

pub mod proxy;
pub mod push;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use pier_proto::fsls::{parse_channel_init, CHANNEL_TAG};
use tracing::{info, warn};

use crate::error::close;
use crate::fsls::{self, AdbFileStore};
use crate::mux::{ChannelEvent, IncomingChannel, Multiplexer, RawOut};
use crate::state::AppState;
use crate::ws::proxy::ProxyOptions;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(upgrade))
}

async fn upgrade(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| dispatch(socket, params, state))
}

async fn dispatch(socket: WebSocket, params: HashMap<String, String>, state: Arc<AppState>) {
    let action = params.get("action").map(String::as_str).unwrap_or("");
    info!(action, "websocket connected");
    match action {
        "proxy-ws" => proxy_ws(socket, &params, state).await,
        "proxy-adb" => proxy_adb(socket, &params, state).await,
        "multiplex" => serve_multiplex(socket, state).await,
        "devices-list" => push::serve_devices_list(socket, state).await,
        "record-status" => push::serve_record_status(socket, state).await,
        other => {
            close_with(
                socket,
                close::BAD_PARAMETERS,
                &format!("unknown action: {other}"),
            )
            .await
        }
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// `?action=proxy-ws&ws=<url>[&session=][&record=][&replay=]`
async fn proxy_ws(socket: WebSocket, params: &HashMap<String, String>, state: Arc<AppState>) {
    let Some(upstream_url) = params.get("ws") else {
        return close_with(socket, close::BAD_PARAMETERS, "missing ws parameter").await;
    };
    let options = ProxyOptions {
        session_id: params
            .get("session")
            .cloned()
            .unwrap_or_else(|| upstream_url.clone()),
        upstream_url: upstream_url.clone(),
        record_id: params.get("record").cloned(),
        replay_id: params.get("replay").cloned(),
        log_payloads: state.config.log_payloads,
    };
    proxy::serve(socket, options, state).await;
}

/// `?action=proxy-adb&udid=<serial>&remote=tcp:<port>[&path=][&record=][&replay=]`
///
/// Resolves the device's scrcpy socket via an ADB TCP forward, then proxies
/// to the forwarded port on the loopback.
async fn proxy_adb(socket: WebSocket, params: &HashMap<String, String>, state: Arc<AppState>) {
    let (Some(udid), Some(remote)) = (params.get("udid"), params.get("remote")) else {
        return close_with(socket, close::BAD_PARAMETERS, "missing udid or remote").await;
    };
    let Some(remote_port) = parse_remote(remote) else {
        return close_with(socket, close::BAD_PARAMETERS, "bad remote specifier").await;
    };

    let local_port = match state.adb.forward(udid, 0, remote_port).await {
        Ok(port) => port,
        Err(e) => {
            warn!(udid = %udid, error = %e, "adb forward failed");
            return close_with(socket, close::INIT_FAILURE, &e.to_string()).await;
        }
    };

    let path = params
        .get("path")
        .map(|p| {
            if p.starts_with('/') {
                p.clone()
            } else {
                format!("/{p}")
            }
        })
        .unwrap_or_default();
    let options = ProxyOptions {
        session_id: udid.clone(),
        upstream_url: format!("ws://127.0.0.1:{local_port}{path}"),
        record_id: params.get("record").cloned(),
        replay_id: params.get("replay").cloned(),
        log_payloads: state.config.log_payloads,
    };
    proxy::serve(socket, options, state).await;
}

/// `tcp:8886` or a bare port number.
fn parse_remote(remote: &str) -> Option<u16> {
    remote
        .strip_prefix("tcp:")
        .unwrap_or(remote)
        .parse()
        .ok()
}

/// `?action=multiplex` — the socket becomes the root of a channel
/// multiplexer; children announce their purpose in their init blob.
async fn serve_multiplex(socket: WebSocket, state: Arc<AppState>) {
    let (root, mut events, mut out) = Multiplexer::new();
    let (mut sink, mut stream) = socket.split();

    tokio::spawn(async move {
        while let Some(raw) = out.recv().await {
            match raw {
                RawOut::Frame(bytes) => {
                    if sink.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                RawOut::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let service_state = Arc::clone(&state);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ChannelEvent::Channel(incoming) = event {
                route_channel(incoming, &service_state);
            }
        }
    });

    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Binary(bytes)) => {
                if let Err(e) = root.feed(&bytes) {
                    warn!(error = %e, "bad multiplexer frame");
                    let _ = root.close(e.close_code(), Some(&e.to_string()));
                    return;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    root.raw_socket_closed(close::NORMAL, None);
}

/// Hand an announced channel to its service, selected by the init tag.
fn route_channel(incoming: IncomingChannel, state: &Arc<AppState>) {
    if incoming.init.starts_with(CHANNEL_TAG) {
        match parse_channel_init(&incoming.init) {
            Ok(serial) => {
                let store = Arc::new(AdbFileStore::new(state.adb.server_addr(), serial));
                tokio::spawn(fsls::serve_session(incoming, store));
            }
            Err(e) => {
                let _ = incoming
                    .channel
                    .close(close::BAD_PARAMETERS, Some(&e.to_string()));
            }
        }
    } else {
        let _ = incoming
            .channel
            .close(close::BAD_PARAMETERS, Some("unsupported channel tag"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::timeout]
    fn remote_specifier_accepts_tcp_prefix_and_bare_port() {
        assert_eq!(parse_remote("tcp:8886"), Some(8886));
        assert_eq!(parse_remote("8886"), Some(8886));
        assert_eq!(parse_remote("tcp:"), None);
        assert_eq!(parse_remote("unix:@scrcpy"), None);
    }
}
