//! Event-driven view of attached devices.
//!
//! The tracker consumes the ADB server's track-devices change stream and
//! keeps a snapshot of device records behind TTL caches. Every change event
//! invalidates the caches and triggers a coalesced refresh: one collection
//! in flight, at most one queued behind it, extra triggers dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::connect::ConnectPreferences;
use super::{net, transport_of, AdbHost, Transport};

pub const CACHE_TTL: Duration = Duration::from_secs(5);
const RESOLVE_FANOUT: usize = 8;
const RESTART_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub id: String,
    pub transport: Transport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_serial: Option<String>,
    pub state: String,
    pub last_seen_ms: i64,
}

struct Cached<T> {
    value: T,
    at: Instant,
}

impl<T> Cached<T> {
    fn fresh(&self) -> bool {
        self.at.elapsed() < CACHE_TTL
    }
}

#[derive(Default)]
struct Caches {
    ids: Option<Cached<Vec<String>>>,
    serials: HashMap<String, Cached<Option<String>>>,
    ips: HashMap<String, Cached<Option<String>>>,
}

struct TrackerInner {
    started: bool,
    refreshing: bool,
    pending: bool,
    caches: Caches,
    snapshot: Arc<Vec<DeviceRecord>>,
}

pub struct DeviceTracker {
    adb: Arc<AdbHost>,
    prefs: Arc<ConnectPreferences>,
    inner: Mutex<TrackerInner>,
    events: broadcast::Sender<Arc<Vec<DeviceRecord>>>,
}

impl DeviceTracker {
    pub fn new(adb: Arc<AdbHost>, prefs: Arc<ConnectPreferences>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            adb,
            prefs,
            inner: Mutex::new(TrackerInner {
                started: false,
                refreshing: false,
                pending: false,
                caches: Caches::default(),
                snapshot: Arc::new(Vec::new()),
            }),
            events,
        }
    }

    /// Current snapshot (possibly stale) plus the refresh stream. Starts the
    /// change-stream consumer on first use and kicks a refresh so the caller
    /// sees a fresh snapshot soon after the cached one.
    pub fn subscribe(
        self: &Arc<Self>,
    ) -> (
        Arc<Vec<DeviceRecord>>,
        broadcast::Receiver<Arc<Vec<DeviceRecord>>>,
    ) {
        self.ensure_started();
        self.trigger_refresh();
        let inner = self.inner.lock().expect("tracker lock");
        (Arc::clone(&inner.snapshot), self.events.subscribe())
    }

    pub fn snapshot(&self) -> Arc<Vec<DeviceRecord>> {
        let inner = self.inner.lock().expect("tracker lock");
        Arc::clone(&inner.snapshot)
    }

    pub fn record_of(&self, id: &str) -> Option<DeviceRecord> {
        self.snapshot().iter().find(|r| r.id == id).cloned()
    }

    fn ensure_started(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().expect("tracker lock");
            if inner.started {
                return;
            }
            inner.started = true;
        }
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            tracker.track_loop().await;
        });
    }

    /// Consume the ADB change stream, restarting with a fixed backoff on
    /// error or end so the view survives ADB server restarts.
    async fn track_loop(self: Arc<Self>) {
        loop {
            let host = self.adb.host();
            let stream = host.track_devices();
            tokio::pin!(stream);
            info!("device track stream started");
            loop {
                match stream.next().await {
                    Some(Ok(_briefs)) => {
                        self.invalidate();
                        self.trigger_refresh();
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "device track stream error, restarting");
                        break;
                    }
                    None => {
                        warn!("device track stream ended, restarting");
                        break;
                    }
                }
            }
            self.invalidate();
            self.trigger_refresh();
            tokio::time::sleep(RESTART_BACKOFF).await;
        }
    }

    fn invalidate(&self) {
        let mut inner = self.inner.lock().expect("tracker lock");
        inner.caches = Caches::default();
    }

    /// Single-flight refresh: a second trigger while one runs folds into a
    /// `pending` flag, further triggers are dropped.
    pub fn trigger_refresh(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().expect("tracker lock");
            if inner.refreshing {
                inner.pending = true;
                return;
            }
            inner.refreshing = true;
        }
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let snapshot = Arc::new(tracker.collect().await);
                let again = {
                    let mut inner = tracker.inner.lock().expect("tracker lock");
                    inner.snapshot = Arc::clone(&snapshot);
                    if inner.pending {
                        inner.pending = false;
                        true
                    } else {
                        inner.refreshing = false;
                        false
                    }
                };
                let _ = tracker.events.send(snapshot);
                if !again {
                    break;
                }
            }
        });
    }

    /// One collection pass: list ids, resolve each record with bounded
    /// fan-out, then group by hardware serial and pick one per group.
    async fn collect(&self) -> Vec<DeviceRecord> {
        let ids = self.device_ids_cached().await;
        // `buffered` keeps the listing order, so the per-group fallback
        // below really is first-seen.
        let records: Vec<DeviceRecord> = futures_util::stream::iter(ids)
            .map(|id| self.resolve_record(id))
            .buffered(RESOLVE_FANOUT)
            .collect()
            .await;
        pick_per_hardware_serial(records, &self.prefs)
    }

    async fn device_ids_cached(&self) -> Vec<String> {
        {
            let inner = self.inner.lock().expect("tracker lock");
            if let Some(cached) = &inner.caches.ids {
                if cached.fresh() {
                    return cached.value.clone();
                }
            }
        }
        let ids = match self.adb.device_ids().await {
            Ok(ids) if !ids.is_empty() => ids,
            Ok(_) => {
                debug!("library device list empty, falling back to adb binary");
                self.adb.device_ids_fallback().await.unwrap_or_default()
            }
            Err(e) => {
                // Collection failures never fail subscribers.
                warn!(error = %e, "device listing failed");
                self.adb.device_ids_fallback().await.unwrap_or_default()
            }
        };
        let mut inner = self.inner.lock().expect("tracker lock");
        inner.caches.ids = Some(Cached {
            value: ids.clone(),
            at: Instant::now(),
        });
        ids
    }

    async fn resolve_record(&self, id: String) -> DeviceRecord {
        let state = self.adb.device_state(&id).await;
        let hardware_serial = self.hardware_serial_cached(&id).await;
        let ipv4 = self.ip_cached(&id).await;
        DeviceRecord {
            transport: transport_of(&id),
            id,
            ipv4,
            hardware_serial,
            state,
            last_seen_ms: Utc::now().timestamp_millis(),
        }
    }

    async fn hardware_serial_cached(&self, id: &str) -> Option<String> {
        {
            let inner = self.inner.lock().expect("tracker lock");
            if let Some(cached) = inner.caches.serials.get(id) {
                if cached.fresh() {
                    return cached.value.clone();
                }
            }
        }
        let serial = match self.adb.shell(id, "getprop ro.serialno").await {
            Ok(out) => {
                let trimmed = out.trim().to_string();
                (!trimmed.is_empty()).then_some(trimmed)
            }
            Err(e) => {
                debug!(id, error = %e, "hardware serial lookup failed");
                None
            }
        };
        let mut inner = self.inner.lock().expect("tracker lock");
        inner.caches.serials.insert(
            id.to_string(),
            Cached {
                value: serial.clone(),
                at: Instant::now(),
            },
        );
        serial
    }

    async fn ip_cached(&self, id: &str) -> Option<String> {
        {
            let inner = self.inner.lock().expect("tracker lock");
            if let Some(cached) = inner.caches.ips.get(id) {
                if cached.fresh() {
                    return cached.value.clone();
                }
            }
        }
        let ip = net::resolve_ip(&self.adb, id).await.map(|ip| ip.to_string());
        let mut inner = self.inner.lock().expect("tracker lock");
        inner.caches.ips.insert(
            id.to_string(),
            Cached {
                value: ip.clone(),
                at: Instant::now(),
            },
        );
        ip
    }
}

/// When one piece of hardware is attached over both transports, present one
/// record per hardware serial, honoring the connect preference and falling
/// back to first-seen.
fn pick_per_hardware_serial(
    records: Vec<DeviceRecord>,
    prefs: &ConnectPreferences,
) -> Vec<DeviceRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<DeviceRecord>> = HashMap::new();
    for record in records {
        let key = record
            .hardware_serial
            .clone()
            .unwrap_or_else(|| record.id.clone());
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(record);
    }

    order
        .into_iter()
        .map(|key| {
            let mut group = groups.remove(&key).expect("group present");
            if group.len() == 1 {
                return group.remove(0);
            }
            match prefs.preferred(&key) {
                Some(transport) => group
                    .iter()
                    .position(|r| r.transport == transport)
                    .map(|i| group.remove(i))
                    .unwrap_or_else(|| group.remove(0)),
                None => group.remove(0),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, hw: Option<&str>) -> DeviceRecord {
        DeviceRecord {
            id: id.to_string(),
            transport: transport_of(id),
            ipv4: None,
            hardware_serial: hw.map(str::to_string),
            state: "device".to_string(),
            last_seen_ms: 0,
        }
    }

    #[test_deadline::timeout]
    fn one_record_per_hardware_serial() {
        let prefs = ConnectPreferences::default();
        let records = vec![
            record("SER1", Some("HW1")),
            record("192.168.1.40:5555", Some("HW1")),
            record("SER2", Some("HW2")),
        ];
        let picked = pick_per_hardware_serial(records, &prefs);
        assert_eq!(picked.len(), 2);
        // No preference recorded: first-seen wins.
        assert_eq!(picked[0].id, "SER1");
        assert_eq!(picked[1].id, "SER2");
    }

    #[test_deadline::timeout]
    fn fallback_is_first_seen_not_first_by_id() {
        let prefs = ConnectPreferences::default();
        // The wifi twin sorts before "SER9" lexically but was seen second.
        let records = vec![
            record("SER9", Some("HW1")),
            record("192.168.1.40:5555", Some("HW1")),
        ];
        let picked = pick_per_hardware_serial(records, &prefs);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "SER9");
    }

    #[test_deadline::timeout]
    fn preference_selects_transport_within_group() {
        let prefs = ConnectPreferences::default();
        prefs.set("HW1", Transport::Wifi);
        let records = vec![
            record("SER1", Some("HW1")),
            record("192.168.1.40:5555", Some("HW1")),
        ];
        let picked = pick_per_hardware_serial(records, &prefs);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "192.168.1.40:5555");
    }

    #[test_deadline::timeout]
    fn unknown_hardware_serial_groups_by_id() {
        let prefs = ConnectPreferences::default();
        let records = vec![record("SER1", None), record("SER2", None)];
        assert_eq!(pick_per_hardware_serial(records, &prefs).len(), 2);
    }

    #[test_deadline::timeout]
    fn no_two_records_share_id_and_transport() {
        let prefs = ConnectPreferences::default();
        let picked = pick_per_hardware_serial(
            vec![
                record("SER1", Some("HW1")),
                record("10.0.0.2:5555", Some("HW2")),
                record("SER3", None),
            ],
            &prefs,
        );
        for (i, a) in picked.iter().enumerate() {
            for b in picked.iter().skip(i + 1) {
                assert!(a.id != b.id || a.transport != b.transport);
            }
        }
    }
}
