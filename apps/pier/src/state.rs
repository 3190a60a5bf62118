//! Shared application state. Everything the handlers touch hangs off one
//! `AppState` passed through axum, so tests can build as many independent
//! instances as they need.

use std::sync::Arc;

use dashmap::DashMap;

use crate::adb::connect::{ConnectPreferences, ConnectionController, KeepAwakeService};
use crate::adb::tracker::DeviceTracker;
use crate::adb::AdbHost;
use crate::config::Config;
use crate::recording::status::RecordingStatusService;
use crate::recording::RecordingStore;
use crate::sync::SyncService;
use crate::ws::proxy::ProxySession;

/// Live proxy sessions by session id (= device id unless overridden).
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<ProxySession>>,
}

impl SessionRegistry {
    pub fn insert(&self, session: Arc<ProxySession>) {
        self.sessions.insert(session.id().to_string(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProxySession>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `id` only while it still maps to `session`; a newer session
    /// that reused the id stays registered.
    pub fn remove_if_same(&self, id: &str, session: &ProxySession) {
        self.sessions
            .remove_if(id, |_, current| std::ptr::eq(current.as_ref(), session));
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

pub struct AppState {
    pub config: Config,
    pub adb: Arc<AdbHost>,
    pub prefs: Arc<ConnectPreferences>,
    pub tracker: Arc<DeviceTracker>,
    pub controller: ConnectionController,
    pub keep_awake: KeepAwakeService,
    pub sync: SyncService,
    pub sessions: SessionRegistry,
    pub recordings: Arc<RecordingStore>,
    pub recording_status: Arc<RecordingStatusService>,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let adb = Arc::new(AdbHost::new(&config.adb_host, config.adb_port));
        let prefs = Arc::new(ConnectPreferences::default());
        let tracker = Arc::new(DeviceTracker::new(Arc::clone(&adb), Arc::clone(&prefs)));
        let controller = ConnectionController::new(
            Arc::clone(&adb),
            Arc::clone(&tracker),
            Arc::clone(&prefs),
        );
        let keep_awake = KeepAwakeService::new(Arc::clone(&adb));
        let recordings = Arc::new(RecordingStore::new(config.recordings_dir.clone()));
        Arc::new(Self {
            config,
            adb,
            prefs,
            tracker,
            controller,
            keep_awake,
            sync: SyncService::default(),
            sessions: SessionRegistry::default(),
            recordings,
            recording_status: Arc::new(RecordingStatusService::new()),
        })
    }

    /// An isolated instance with its disk directories under `dir`; nothing
    /// talks to a real ADB server unless a test asks it to.
    #[cfg(test)]
    pub fn for_tests(dir: &std::path::Path) -> Arc<Self> {
        let config = Config {
            recordings_dir: dir.join("recordings"),
            uploads_dir: dir.join("uploads"),
            ..Config::default()
        };
        Self::new(config)
    }
}
