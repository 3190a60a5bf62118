//! Broadcast of per-session recording states to `record-status` subscribers.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use super::SessionMode;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionRecordingStatus {
    pub session: String,
    pub state: SessionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

pub struct RecordingStatusService {
    states: Mutex<BTreeMap<String, SessionRecordingStatus>>,
    tx: broadcast::Sender<Vec<SessionRecordingStatus>>,
}

impl Default for RecordingStatusService {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingStatusService {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            states: Mutex::new(BTreeMap::new()),
            tx,
        }
    }

    /// Record a session's transition and push a full snapshot to listeners.
    pub fn update(&self, session: &str, state: SessionMode, record_id: Option<String>) {
        let snapshot = {
            let mut states = self.states.lock().expect("status lock");
            if state == SessionMode::Stop {
                states.remove(session);
            } else {
                states.insert(
                    session.to_string(),
                    SessionRecordingStatus {
                        session: session.to_string(),
                        state,
                        record_id,
                    },
                );
            }
            states.values().cloned().collect::<Vec<_>>()
        };
        let _ = self.tx.send(snapshot);
    }

    pub fn remove(&self, session: &str) {
        self.update(session, SessionMode::Stop, None);
    }

    /// Current snapshot plus a stream of future ones.
    pub fn subscribe(
        &self,
    ) -> (
        Vec<SessionRecordingStatus>,
        broadcast::Receiver<Vec<SessionRecordingStatus>>,
    ) {
        let rx = self.tx.subscribe();
        let snapshot = self
            .states
            .lock()
            .expect("status lock")
            .values()
            .cloned()
            .collect();
        (snapshot, rx)
    }

    pub fn state_of(&self, session: &str) -> SessionMode {
        self.states
            .lock()
            .expect("status lock")
            .get(session)
            .map(|s| s.state)
            .unwrap_or(SessionMode::Stop)
    }
}
