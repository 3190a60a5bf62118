//! The per-session WebSocket↔upstream proxy.
//!
//! A session owns one downstream socket (browser) and lazily opens one
//! upstream socket (the ADB-forwarded scrcpy port). Downstream frames that
//! arrive before the upstream is open queue per session and drain in order
//! on open. The recorder, player and sync mirror all hang off the
//! downstream receive path.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{self, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, info, warn};

use crate::error::{close, GatewayError, Result};
use crate::recording::player::{Player, PlayerFrame};
use crate::recording::recorder::Recorder;
use crate::recording::status::RecordingStatusService;
use crate::recording::{normalize_id, RecordingStore, SessionMode};
use crate::state::AppState;

/// A payload crossing the proxy, direction-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

impl Frame {
    fn into_upstream(self) -> tungstenite::Message {
        match self {
            Frame::Binary(b) => tungstenite::Message::Binary(b),
            Frame::Text(t) => tungstenite::Message::Text(t),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Frame::Binary(_) => "binary",
            Frame::Text(_) => "text",
        }
    }

    fn len(&self) -> usize {
        match self {
            Frame::Binary(b) => b.len(),
            Frame::Text(t) => t.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub session_id: String,
    pub upstream_url: String,
    pub record_id: Option<String>,
    pub replay_id: Option<String>,
    pub log_payloads: bool,
}

enum UpstreamState {
    Pending(Vec<Frame>),
    Open(mpsc::UnboundedSender<tungstenite::Message>),
    Closed,
}

#[derive(Default)]
struct RecordingState {
    recorder: Option<Recorder>,
    player: Option<Player>,
    player_recording_id: Option<String>,
    /// Bumped on every playback start so a stale run's completion callback
    /// cannot clear a newer run.
    generation: u64,
}

fn mode_of(rec: &RecordingState) -> SessionMode {
    // With record+replay on one session the recorder wins the presented
    // state, matching the stop() preference.
    if let Some(recorder) = &rec.recorder {
        if recorder.is_paused() {
            SessionMode::Pause
        } else {
            SessionMode::Record
        }
    } else if let Some(player) = &rec.player {
        if player.is_running() {
            SessionMode::Run
        } else {
            SessionMode::Pause
        }
    } else {
        SessionMode::Stop
    }
}

#[derive(Debug, Serialize)]
pub struct StopOutcome {
    pub mode: SessionMode,
    #[serde(rename = "filePath", skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

pub struct ProxySession {
    id: String,
    remote_url: String,
    log_payloads: bool,
    replay_id: Option<String>,
    downstream: mpsc::UnboundedSender<ws::Message>,
    upstream: Mutex<UpstreamState>,
    recording: tokio::sync::Mutex<RecordingState>,
    released: AtomicBool,
    store: Arc<RecordingStore>,
    status: Arc<RecordingStatusService>,
}

impl ProxySession {
    pub fn new(
        options: ProxyOptions,
        downstream: mpsc::UnboundedSender<ws::Message>,
        store: Arc<RecordingStore>,
        status: Arc<RecordingStatusService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: options.session_id,
            remote_url: options.upstream_url,
            log_payloads: options.log_payloads,
            replay_id: options.replay_id,
            downstream,
            upstream: Mutex::new(UpstreamState::Pending(Vec::new())),
            recording: tokio::sync::Mutex::new(RecordingState::default()),
            released: AtomicBool::new(false),
            store,
            status,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_url(&self) -> &str {
        &self.remote_url
    }

    /// Downstream→upstream path: log, capture, forward, mirror.
    pub async fn handle_downstream(self: &Arc<Self>, frame: Frame, state: &AppState) {
        if self.log_payloads {
            debug!(session = %self.id, frame = ?frame, "downstream frame");
        } else {
            debug!(session = %self.id, kind = frame.kind(), size = frame.len(), "downstream frame");
        }

        {
            let mut rec = self.recording.lock().await;
            if let Some(recorder) = rec.recorder.as_mut() {
                if !recorder.is_paused() {
                    match &frame {
                        Frame::Binary(b) => recorder.capture_binary(b),
                        Frame::Text(t) => recorder.capture_text(t),
                    }
                }
            }
        }

        let followers = state.sync.followers_of(&self.id);
        for follower in followers {
            if let Some(peer) = state.sessions.get(&follower) {
                peer.forward_from_sync(frame.clone());
            }
        }

        self.send_upstream(frame);
    }

    /// Entry point for mirrored traffic from a sync source. Honors this
    /// session's pending queue like any other upstream-bound frame.
    pub fn forward_from_sync(&self, frame: Frame) {
        self.send_upstream(frame);
    }

    fn send_upstream(&self, frame: Frame) {
        let mut upstream = self.upstream.lock().expect("upstream lock");
        match &mut *upstream {
            UpstreamState::Pending(queue) => queue.push(frame),
            UpstreamState::Open(tx) => {
                let _ = tx.send(frame.into_upstream());
            }
            UpstreamState::Closed => {
                debug!(session = %self.id, "dropping frame for closed upstream");
            }
        }
    }

    /// Flip to OPEN and drain the pending queue, in arrival order. A session
    /// already released stays closed even when its socket opens late.
    fn upstream_opened(&self, tx: mpsc::UnboundedSender<tungstenite::Message>) {
        let queued = {
            let mut upstream = self.upstream.lock().expect("upstream lock");
            if matches!(&*upstream, UpstreamState::Closed) {
                return;
            }
            match std::mem::replace(&mut *upstream, UpstreamState::Open(tx.clone())) {
                UpstreamState::Pending(queue) => queue,
                other => {
                    *upstream = other;
                    return;
                }
            }
        };
        for frame in queued {
            let _ = tx.send(frame.into_upstream());
        }
    }

    fn upstream_closed(&self) {
        let mut upstream = self.upstream.lock().expect("upstream lock");
        *upstream = UpstreamState::Closed;
    }

    fn close_downstream(&self, code: u16, reason: &str) {
        let _ = self.downstream.send(ws::Message::Close(Some(ws::CloseFrame {
            code,
            reason: reason.to_string().into(),
        })));
    }

    pub async fn mode(&self) -> SessionMode {
        mode_of(&*self.recording.lock().await)
    }

    // ------------------------------------------------------------------
    // Control operations, reached through the HTTP action surface.

    /// Begin capturing. A recorder that is somehow still present is
    /// persisted first rather than discarded; an active playback refuses.
    pub async fn start_recording(self: &Arc<Self>, id: Option<String>) -> Result<String> {
        let mut rec = self.recording.lock().await;
        if rec.player.is_some() {
            return Err(GatewayError::InvalidState("playback is active"));
        }
        if let Some(old) = rec.recorder.take() {
            let recording = old.into_recording();
            if let Err(e) = self.store.persist(&recording).await {
                warn!(session = %self.id, error = %e, "failed to persist replaced recording");
            }
        }
        let resolved = normalize_id(id.as_deref().unwrap_or(""));
        rec.recorder = Some(Recorder::new(
            resolved.clone(),
            self.remote_url.clone(),
            None,
        ));
        self.status
            .update(&self.id, SessionMode::Record, Some(resolved.clone()));
        info!(session = %self.id, id = %resolved, "recording started");
        Ok(resolved)
    }

    pub async fn stop_recording(&self) -> Result<PathBuf> {
        let mut rec = self.recording.lock().await;
        let Some(recorder) = rec.recorder.take() else {
            return Err(GatewayError::InvalidState("no recording in progress"));
        };
        let recording = recorder.into_recording();
        let path = self.store.persist(&recording).await?;
        self.status
            .update(&self.id, mode_of(&rec), rec.player_recording_id.clone());
        info!(session = %self.id, path = %path.display(), "recording stopped");
        Ok(path)
    }

    /// Stop whichever of recorder/player is active, preferring the recorder.
    pub async fn stop(&self) -> Result<StopOutcome> {
        let mut rec = self.recording.lock().await;
        if let Some(recorder) = rec.recorder.take() {
            let recording = recorder.into_recording();
            let file_path = match self.store.persist(&recording).await {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(session = %self.id, error = %e, "recording persist failed");
                    None
                }
            };
            self.status
                .update(&self.id, mode_of(&rec), rec.player_recording_id.clone());
            return Ok(StopOutcome {
                mode: SessionMode::Record,
                file_path,
            });
        }
        if let Some(mut player) = rec.player.take() {
            player.stop();
            rec.player_recording_id = None;
            self.status.update(&self.id, SessionMode::Stop, None);
            return Ok(StopOutcome {
                mode: SessionMode::Run,
                file_path: None,
            });
        }
        Err(GatewayError::InvalidState("nothing to stop"))
    }

    /// HTTP-facing replay start: only from a fully stopped session.
    pub async fn run_recording(self: &Arc<Self>, id: &str) -> Result<()> {
        let recording = self.store.load(&normalize_id(id)).await?;
        let mut rec = self.recording.lock().await;
        if mode_of(&rec) != SessionMode::Stop {
            return Err(GatewayError::InvalidState("session is not stopped"));
        }
        self.start_playback(&mut rec, recording.id, Player::new(recording.messages));
        Ok(())
    }

    /// Construction-time replay (`replay` query parameter): starts alongside
    /// a recorder; the recorder keeps capturing downstream-origin frames
    /// only, never player output.
    async fn run_recording_unchecked(self: &Arc<Self>, id: &str) -> Result<()> {
        let recording = self.store.load(&normalize_id(id)).await?;
        let mut rec = self.recording.lock().await;
        if rec.player.is_some() {
            return Err(GatewayError::InvalidState("playback is active"));
        }
        self.start_playback(&mut rec, recording.id, Player::new(recording.messages));
        Ok(())
    }

    fn start_playback(self: &Arc<Self>, rec: &mut RecordingState, id: String, mut player: Player) {
        rec.generation += 1;
        let generation = rec.generation;

        let (tx, mut rx) = mpsc::unbounded_channel::<PlayerFrame>();
        let forwarder = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let frame = match frame {
                    PlayerFrame::Binary(b) => Frame::Binary(b),
                    PlayerFrame::Text(t) => Frame::Text(t),
                };
                forwarder.send_upstream(frame);
            }
        });

        let on_done = Arc::clone(self);
        player.start(tx, move || {
            tokio::spawn(async move {
                on_done.playback_finished(generation).await;
            });
        });

        rec.player = Some(player);
        rec.player_recording_id = Some(id.clone());
        self.status.update(&self.id, mode_of(rec), Some(id));
    }

    async fn playback_finished(&self, generation: u64) {
        let mut rec = self.recording.lock().await;
        if rec.generation != generation || rec.player.is_none() {
            return;
        }
        rec.player = None;
        rec.player_recording_id = None;
        self.status
            .update(&self.id, mode_of(&rec), None);
        info!(session = %self.id, "playback finished");
    }

    pub async fn pause(&self) -> Result<()> {
        let mut rec = self.recording.lock().await;
        match mode_of(&rec) {
            SessionMode::Record => {
                if let Some(recorder) = rec.recorder.as_mut() {
                    recorder.pause();
                }
            }
            SessionMode::Run => {
                if let Some(player) = rec.player.as_mut() {
                    player.pause();
                }
            }
            _ => return Err(GatewayError::InvalidState("nothing to pause")),
        }
        let record_id = rec
            .recorder
            .as_ref()
            .map(|r| r.id().to_string())
            .or_else(|| rec.player_recording_id.clone());
        self.status.update(&self.id, SessionMode::Pause, record_id);
        Ok(())
    }

    pub async fn resume(self: &Arc<Self>) -> Result<()> {
        let mut rec = self.recording.lock().await;
        if mode_of(&rec) != SessionMode::Pause {
            return Err(GatewayError::InvalidState("nothing to resume"));
        }
        if let Some(recorder) = rec.recorder.as_mut() {
            recorder.resume();
            let id = recorder.id().to_string();
            self.status.update(&self.id, SessionMode::Record, Some(id));
            return Ok(());
        }
        let Some(player) = rec.player.take() else {
            return Err(GatewayError::InvalidState("nothing to resume"));
        };
        let id = rec.player_recording_id.take().unwrap_or_default();
        self.start_playback(&mut rec, id, player);
        Ok(())
    }

    /// Tear the session down. Idempotent; both socket paths call it.
    pub async fn release(&self, state: &AppState) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        state.sessions.remove_if_same(&self.id, self);
        self.upstream_closed();

        let mut rec = self.recording.lock().await;
        if let Some(mut player) = rec.player.take() {
            player.stop();
        }
        rec.player_recording_id = None;
        if let Some(recorder) = rec.recorder.take() {
            let recording = recorder.into_recording();
            if let Err(e) = self.store.persist(&recording).await {
                warn!(session = %self.id, error = %e, "recording persist on release failed");
            }
        }
        self.status.remove(&self.id);
        info!(session = %self.id, "session released");
    }
}

/// Serve one downstream WebSocket through a proxy session.
pub async fn serve(socket: WebSocket, options: ProxyOptions, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (down_tx, mut down_rx) = mpsc::unbounded_channel::<ws::Message>();
    tokio::spawn(async move {
        while let Some(message) = down_rx.recv().await {
            let is_close = matches!(message, ws::Message::Close(_));
            if sink.send(message).await.is_err() || is_close {
                break;
            }
        }
    });

    let record_id = options.record_id.clone();
    let session = ProxySession::new(
        options,
        down_tx,
        Arc::clone(&state.recordings),
        Arc::clone(&state.recording_status),
    );
    state.sessions.insert(Arc::clone(&session));

    if let Some(id) = record_id {
        if let Err(e) = session.start_recording(Some(id)).await {
            warn!(session = %session.id(), error = %e, "recording at connect failed");
        }
    }

    tokio::spawn(run_upstream(Arc::clone(&session), Arc::clone(&state)));

    while let Some(item) = stream.next().await {
        match item {
            Ok(ws::Message::Binary(payload)) => {
                session.handle_downstream(Frame::Binary(payload), &state).await;
            }
            Ok(ws::Message::Text(payload)) => {
                session.handle_downstream(Frame::Text(payload), &state).await;
            }
            Ok(ws::Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    session.release(&state).await;
}

/// Open the upstream socket, drain the pending queue, then forward
/// upstream traffic downstream byte-for-byte until either side ends.
async fn run_upstream(session: Arc<ProxySession>, state: Arc<AppState>) {
    let (upstream, _) = match connect_async(session.remote_url()).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(session = %session.id(), error = %e, "upstream connect failed");
            session.close_downstream(close::UPSTREAM_ERROR, &e.to_string());
            session.upstream_closed();
            return;
        }
    };
    let (mut up_sink, mut up_stream) = upstream.split();
    let (up_tx, mut up_rx) = mpsc::unbounded_channel::<tungstenite::Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = up_rx.recv().await {
            if up_sink.send(message).await.is_err() {
                break;
            }
        }
    });

    session.upstream_opened(up_tx);

    if let Some(replay) = session.replay_id.clone() {
        if let Err(e) = session.run_recording_unchecked(&replay).await {
            warn!(session = %session.id(), error = %e, "replay at connect failed");
        }
    }

    let mut outcome: Option<(u16, String)> = None;
    while let Some(item) = up_stream.next().await {
        match item {
            Ok(tungstenite::Message::Binary(payload)) => {
                let _ = session.downstream.send(ws::Message::Binary(payload));
            }
            Ok(tungstenite::Message::Text(payload)) => {
                let _ = session.downstream.send(ws::Message::Text(payload));
            }
            Ok(tungstenite::Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.into_owned())
                    .unwrap_or_default();
                outcome = Some((close::UPSTREAM_CLOSED, reason));
                break;
            }
            Ok(_) => {}
            Err(e) => {
                outcome = Some((close::UPSTREAM_ERROR, e.to_string()));
                break;
            }
        }
    }
    let (code, reason) =
        outcome.unwrap_or_else(|| (close::UPSTREAM_CLOSED, "upstream closed".to_string()));
    session.close_downstream(code, &reason);
    session.upstream_closed();
    writer.abort();
    session.release(&state).await;
}
