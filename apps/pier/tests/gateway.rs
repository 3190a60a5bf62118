//! End-to-end gateway tests: real sockets on the loopback, a scripted
//! scrcpy-side WebSocket server upstream, and a browser-side client
//! downstream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use pier::config::Config;
use pier::state::AppState;
use pier::{api, ws};
use pier_proto::control::ControlMessage;
use pier_proto::mux::MuxFrame;
use pier_proto::stream_params::StreamParams;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};
use tower_http::cors::CorsLayer;

fn test_state(dir: &tempfile::TempDir) -> Arc<AppState> {
    AppState::new(Config {
        recordings_dir: dir.path().join("recordings"),
        uploads_dir: dir.path().join("uploads"),
        ..Config::default()
    })
}

async fn spawn_gateway(state: Arc<AppState>) -> SocketAddr {
    let app = Router::new()
        .merge(ws::router())
        .merge(api::router())
        .layer(CorsLayer::permissive())
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A stand-in for the device-side scrcpy server: accepts WebSocket
/// connections and reports every binary payload it receives.
async fn spawn_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(mut socket) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = socket.next().await {
                    if let Message::Binary(payload) = message {
                        let _ = tx.send(payload);
                    }
                }
            });
        }
    });
    (addr, rx)
}

fn touch_down_100_200() -> Vec<u8> {
    ControlMessage::Touch {
        action: 0,
        pointer_id: 0,
        x: 100,
        y: 200,
        screen_width: 500,
        screen_height: 500,
        pressure: 1.0,
        buttons: 0,
    }
    .encode()
}

fn key_tap_home() -> (Vec<u8>, Vec<u8>) {
    let down = ControlMessage::Key {
        action: 0,
        keycode: 3,
        repeat: 0,
        meta: 0,
    }
    .encode();
    let up = ControlMessage::Key {
        action: 1,
        keycode: 3,
        repeat: 0,
        meta: 0,
    }
    .encode();
    (down, up)
}

#[test_deadline::tokio_timeout_test]
async fn proxy_hand_off_queues_config_then_forwards_input() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let gateway = spawn_gateway(state).await;
    let (upstream_addr, mut upstream_rx) = spawn_upstream().await;

    let url = format!(
        "ws://{gateway}/?action=proxy-ws&ws=ws://{upstream_addr}&session=ABC"
    );
    let (mut browser, _) = connect_async(&url).await.unwrap();

    // First frame: the 36-byte stream config, possibly before the gateway's
    // upstream socket is open — it must be queued and drained in order.
    let config = StreamParams {
        bitrate: 8_388_608,
        max_fps: 25,
        i_frame_interval: 5,
        width: 500,
        height: 500,
        send_frame_meta: false,
        locked_video_orientation: -1,
        display_id: 0,
    };
    browser
        .send(Message::Binary(config.build().to_vec()))
        .await
        .unwrap();
    browser
        .send(Message::Binary(touch_down_100_200()))
        .await
        .unwrap();

    let first = upstream_rx.recv().await.unwrap();
    assert_eq!(first, config.build().to_vec());
    let second = upstream_rx.recv().await.unwrap();
    let expected: Vec<u8> = [
        vec![0x02, 0x00],
        vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        vec![0x00, 0x00, 0x00, 0x64],
        vec![0x00, 0x00, 0x00, 0xC8],
        vec![0x01, 0xF4, 0x01, 0xF4],
        vec![0xFF, 0xFF],
        vec![0x00, 0x00, 0x00, 0x00],
    ]
    .concat();
    assert_eq!(second, expected);
}

#[test_deadline::tokio_timeout_test]
async fn sync_mirroring_reaches_followers_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let gateway = spawn_gateway(Arc::clone(&state)).await;

    let (addr_a, mut rx_a) = spawn_upstream().await;
    let (addr_b, mut rx_b) = spawn_upstream().await;
    let (addr_c, mut rx_c) = spawn_upstream().await;

    let mut browsers = Vec::new();
    for (session, addr) in [("A", addr_a), ("B", addr_b), ("C", addr_c)] {
        let url = format!(
            "ws://{gateway}/?action=proxy-ws&ws=ws://{addr}&session={session}"
        );
        let (browser, _) = connect_async(&url).await.unwrap();
        browsers.push(browser);
    }
    state
        .sync
        .set_mapping("A", &["B".to_string(), "C".to_string()]);

    let (down, up) = key_tap_home();
    browsers[0]
        .send(Message::Binary(down.clone()))
        .await
        .unwrap();
    browsers[0].send(Message::Binary(up.clone())).await.unwrap();

    for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
        assert_eq!(rx.recv().await.unwrap(), down);
        assert_eq!(rx.recv().await.unwrap(), up);
    }
}

#[test_deadline::tokio_timeout_test]
async fn record_then_replay_preserves_payloads_and_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let gateway = spawn_gateway(Arc::clone(&state)).await;
    let (upstream_addr, mut upstream_rx) = spawn_upstream().await;

    let url = format!(
        "ws://{gateway}/?action=proxy-ws&ws=ws://{upstream_addr}&session=A&record=demo"
    );
    let (mut browser, _) = connect_async(&url).await.unwrap();

    let (down, up) = key_tap_home();
    let frames = [down.clone(), up.clone(), down.clone()];
    browser.send(Message::Binary(frames[0].clone())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    browser.send(Message::Binary(frames[1].clone())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    browser.send(Message::Binary(frames[2].clone())).await.unwrap();
    for _ in 0..3 {
        let _ = upstream_rx.recv().await.unwrap();
    }

    let session = state.sessions.get("A").unwrap();
    let path = session.stop_recording().await.unwrap();
    assert!(path.ends_with("demo.json"));

    let recording = state.recordings.load("demo").await.unwrap();
    assert_eq!(recording.messages.len(), 3);
    let ats: Vec<u64> = recording.messages.iter().map(|m| m.at).collect();
    assert!(ats[0] < 100, "first at {}", ats[0]);
    assert!((150..450).contains(&ats[1]), "second at {}", ats[1]);
    assert!((450..900).contains(&ats[2]), "third at {}", ats[2]);

    // Replay into the open upstream and watch the same payloads return
    // with roughly the recorded gaps.
    session.run_recording("demo").await.unwrap();
    let started = Instant::now();
    let mut replayed = Vec::new();
    for _ in 0..3 {
        replayed.push((upstream_rx.recv().await.unwrap(), started.elapsed()));
    }
    assert_eq!(replayed[0].0, frames[0]);
    assert_eq!(replayed[1].0, frames[1]);
    assert_eq!(replayed[2].0, frames[2]);
    let gap1 = replayed[1].1 - replayed[0].1;
    let gap2 = replayed[2].1 - replayed[1].1;
    assert!(gap1 >= Duration::from_millis(100), "gap1 {gap1:?}");
    assert!(gap2 > gap1, "gap2 {gap2:?} <= gap1 {gap1:?}");
}

#[test_deadline::tokio_timeout_test]
async fn record_status_socket_pushes_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let gateway = spawn_gateway(Arc::clone(&state)).await;

    let (mut status_socket, _) =
        connect_async(format!("ws://{gateway}/?action=record-status"))
            .await
            .unwrap();
    let initial = status_socket.next().await.unwrap().unwrap();
    assert_eq!(initial.into_text().unwrap(), "[]");

    // A transition elsewhere shows up as a pushed snapshot.
    let (upstream_addr, _upstream_rx) = spawn_upstream().await;
    let url = format!(
        "ws://{gateway}/?action=proxy-ws&ws=ws://{upstream_addr}&session=S1&record=take1"
    );
    let (_browser, _) = connect_async(&url).await.unwrap();

    let pushed = status_socket.next().await.unwrap().unwrap();
    let text = pushed.into_text().unwrap();
    assert!(text.contains("\"S1\""), "{text}");
    assert!(text.contains("record"), "{text}");
}

#[test_deadline::tokio_timeout_test]
async fn unknown_action_closes_with_4003() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let gateway = spawn_gateway(state).await;

    let (mut socket, _) = connect_async(format!("ws://{gateway}/?action=bogus"))
        .await
        .unwrap();
    match socket.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4003);
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[test_deadline::tokio_timeout_test]
async fn multiplex_rejects_unknown_channel_tags() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let gateway = spawn_gateway(state).await;

    let (mut socket, _) = connect_async(format!("ws://{gateway}/?action=multiplex"))
        .await
        .unwrap();
    let create = MuxFrame::Create {
        channel: 9,
        init: b"NOPE".to_vec(),
    };
    socket
        .send(Message::Binary(create.encode()))
        .await
        .unwrap();

    let reply = socket.next().await.unwrap().unwrap();
    let Message::Binary(bytes) = reply else {
        panic!("expected binary close frame, got {reply:?}");
    };
    match MuxFrame::decode(&bytes).unwrap() {
        MuxFrame::Close { channel, code, .. } => {
            assert_eq!(channel, 9);
            assert_eq!(code, 4003);
        }
        other => panic!("expected channel close, got {other:?}"),
    }
}
