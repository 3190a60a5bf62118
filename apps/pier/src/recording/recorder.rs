//! Capture side of the record/replay engine.
//!
//! The recorder's clock is its own: message offsets are measured from
//! `started_at` minus the time spent paused, so a pause/resume cycle leaves
//! no gap in the replayed timeline.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
// Tokio's Instant so the clock is virtualizable under `tokio::time::pause`.
use tokio::time::Instant;

use super::{RecordedMessage, Recording};

pub struct Recorder {
    id: String,
    remote: String,
    created_at: String,
    meta: Option<serde_json::Value>,
    messages: Vec<RecordedMessage>,
    started_at: Instant,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl Recorder {
    pub fn new(id: String, remote: String, meta: Option<serde_json::Value>) -> Self {
        Self {
            id,
            remote,
            created_at: Utc::now().to_rfc3339(),
            meta,
            messages: Vec::new(),
            started_at: Instant::now(),
            paused_at: None,
            paused_total: Duration::ZERO,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    pub fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total += paused_at.elapsed();
        }
    }

    fn elapsed_ms(&self) -> u64 {
        let mut elapsed = self.started_at.elapsed();
        elapsed = elapsed.saturating_sub(self.paused_total);
        if let Some(paused_at) = self.paused_at {
            elapsed = elapsed.saturating_sub(paused_at.elapsed());
        }
        elapsed.as_millis() as u64
    }

    pub fn capture_binary(&mut self, payload: &[u8]) {
        let at = self.elapsed_ms();
        self.messages.push(RecordedMessage {
            at,
            data: BASE64.encode(payload),
            binary: true,
        });
    }

    pub fn capture_text(&mut self, payload: &str) {
        let at = self.elapsed_ms();
        self.messages.push(RecordedMessage {
            at,
            data: payload.to_string(),
            binary: false,
        });
    }

    pub fn into_recording(self) -> Recording {
        Recording {
            id: self.id,
            remote: self.remote,
            created_at: self.created_at,
            name: None,
            meta: self.meta,
            messages: self.messages,
        }
    }
}
