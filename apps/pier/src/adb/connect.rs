//! Connection-mode control: USB↔Wi-Fi switching, the per-hardware
//! transport preference the tracker consults, and the keep-awake timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::tracker::DeviceTracker;
use super::{net, transport_of, AdbHost, Transport};
use crate::error::{GatewayError, Result};

const DEFAULT_WIFI_PORT: u16 = 5555;
const SWITCH_DEADLINE: Duration = Duration::from_secs(10);
const TCPIP_SETTLE: Duration = Duration::from_millis(400);
const CONNECT_ATTEMPTS: usize = 3;
const CONNECT_SPACING: Duration = Duration::from_millis(200);
const ADB_CMD_DEADLINE: Duration = Duration::from_secs(10);

/// Memory-only map `hardware_serial → transport` biasing the tracker's
/// per-group pick.
#[derive(Debug, Default)]
pub struct ConnectPreferences {
    map: Mutex<HashMap<String, Transport>>,
}

impl ConnectPreferences {
    pub fn set(&self, hardware_serial: &str, transport: Transport) {
        self.map
            .lock()
            .expect("prefs lock")
            .insert(hardware_serial.to_string(), transport);
    }

    pub fn preferred(&self, hardware_serial: &str) -> Option<Transport> {
        self.map
            .lock()
            .expect("prefs lock")
            .get(hardware_serial)
            .copied()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectRequest {
    pub device: String,
    pub connect: Transport,
    #[serde(default)]
    pub port: Option<u16>,
}

pub struct ConnectionController {
    adb: Arc<AdbHost>,
    tracker: Arc<DeviceTracker>,
    prefs: Arc<ConnectPreferences>,
}

impl ConnectionController {
    pub fn new(
        adb: Arc<AdbHost>,
        tracker: Arc<DeviceTracker>,
        prefs: Arc<ConnectPreferences>,
    ) -> Self {
        Self { adb, tracker, prefs }
    }

    /// Switch one device's connection mode. The Wi-Fi path is bounded by a
    /// hard deadline covering `tcpip`, the settle wait and every `connect`
    /// retry.
    pub async fn switch(&self, request: &ConnectRequest) -> Result<String> {
        match request.connect {
            Transport::Usb => self.switch_usb(&request.device).await,
            Transport::Wifi => {
                tokio::time::timeout(
                    SWITCH_DEADLINE,
                    self.switch_wifi(&request.device, request.port),
                )
                .await
                .map_err(|_| {
                    GatewayError::Timeout(format!(
                        "wifi switch for {} exceeded {}s",
                        request.device,
                        SWITCH_DEADLINE.as_secs()
                    ))
                })?
            }
        }
    }

    async fn switch_usb(&self, device: &str) -> Result<String> {
        let output = self
            .adb
            .run_adb(&["-s", device, "usb"], ADB_CMD_DEADLINE)
            .await?;
        if !output.success {
            return Err(GatewayError::Upstream(output.combined()));
        }

        // Drop Wi-Fi twins of the same hardware so one record remains.
        let hardware = self.hardware_serial_of(device).await;
        if let Some(hardware) = &hardware {
            for record in self.tracker.snapshot().iter() {
                if record.transport == Transport::Wifi
                    && record.id != device
                    && record.hardware_serial.as_deref() == Some(hardware)
                {
                    info!(peer = %record.id, "disconnecting wifi twin");
                    let _ = self
                        .adb
                        .run_adb(&["disconnect", &record.id], ADB_CMD_DEADLINE)
                        .await;
                }
            }
            self.prefs.set(hardware, Transport::Usb);
        }
        Ok(output.combined())
    }

    async fn switch_wifi(&self, device: &str, port: Option<u16>) -> Result<String> {
        let port = port.unwrap_or(DEFAULT_WIFI_PORT);
        let host = self.resolve_wifi_host(device).await?;
        let target = format!("{host}:{port}");

        let tcpip = self
            .adb
            .run_adb(&["-s", device, "tcpip", &port.to_string()], ADB_CMD_DEADLINE)
            .await?;
        if !tcpip.success {
            return Err(GatewayError::Upstream(tcpip.combined()));
        }
        tokio::time::sleep(TCPIP_SETTLE).await;

        let mut last = String::new();
        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(CONNECT_SPACING).await;
            }
            let output = self
                .adb
                .run_adb(&["connect", &target], ADB_CMD_DEADLINE)
                .await?;
            last = output.combined();
            let lowered = last.to_lowercase();
            if lowered.contains("connected to") || lowered.contains("already connected") {
                if let Some(hardware) = self.hardware_serial_of(device).await {
                    self.prefs.set(&hardware, Transport::Wifi);
                }
                return Ok(last);
            }
            warn!(device, attempt, output = %last, "adb connect not accepted");
        }
        Err(GatewayError::Upstream(format!(
            "adb connect {target} failed: {last}"
        )))
    }

    /// The connect target host: taken from a `host:port` id, else the
    /// tracker's cached address, else a fresh lookup ladder.
    async fn resolve_wifi_host(&self, device: &str) -> Result<String> {
        if transport_of(device) == Transport::Wifi {
            let host = device.split(':').next().unwrap_or(device);
            return Ok(host.to_string());
        }
        if let Some(record) = self.tracker.record_of(device) {
            if let Some(ip) = record.ipv4 {
                return Ok(ip);
            }
        }
        net::resolve_ip(&self.adb, device)
            .await
            .map(|ip| ip.to_string())
            .ok_or_else(|| {
                GatewayError::Upstream(format!("no wifi address resolved for {device}"))
            })
    }

    async fn hardware_serial_of(&self, device: &str) -> Option<String> {
        if let Some(record) = self.tracker.record_of(device) {
            if record.hardware_serial.is_some() {
                return record.hardware_serial;
            }
        }
        match self.adb.shell(device, "getprop ro.serialno").await {
            Ok(out) => {
                let trimmed = out.trim().to_string();
                (!trimmed.is_empty()).then_some(trimmed)
            }
            Err(_) => None,
        }
    }
}

const KEEP_AWAKE_DEFAULT: Duration = Duration::from_secs(30);
const KEEP_AWAKE_MIN: Duration = Duration::from_secs(1);
/// KEYCODE_WAKEUP
const WAKEUP_KEYCODE: u32 = 224;

/// Holds devices awake for a bounded time, reverting `stayon` on expiry.
/// Re-invoking for a device restarts its timer.
pub struct KeepAwakeService {
    adb: Arc<AdbHost>,
    timers: Arc<DashMap<String, JoinHandle<()>>>,
}

impl KeepAwakeService {
    pub fn new(adb: Arc<AdbHost>) -> Self {
        Self {
            adb,
            timers: Arc::new(DashMap::new()),
        }
    }

    pub async fn keep_awake(&self, device: &str, seconds: Option<u64>) -> Result<u64> {
        let duration = seconds
            .map(Duration::from_secs)
            .unwrap_or(KEEP_AWAKE_DEFAULT)
            .max(KEEP_AWAKE_MIN);

        self.adb.shell(device, "svc power stayon true").await?;
        self.adb
            .shell(device, &format!("input keyevent {WAKEUP_KEYCODE}"))
            .await?;

        if let Some((_, old)) = self.timers.remove(device) {
            old.abort();
        }
        let adb = Arc::clone(&self.adb);
        let timers = Arc::clone(&self.timers);
        let id = device.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Err(e) = adb.shell(&id, "svc power stayon false").await {
                warn!(device = %id, error = %e, "keep-awake revert failed");
            }
            timers.remove(&id);
        });
        self.timers.insert(device.to_string(), handle);
        Ok(duration.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::timeout]
    fn preferences_remember_last_transport() {
        let prefs = ConnectPreferences::default();
        assert_eq!(prefs.preferred("HW1"), None);
        prefs.set("HW1", Transport::Wifi);
        assert_eq!(prefs.preferred("HW1"), Some(Transport::Wifi));
        prefs.set("HW1", Transport::Usb);
        assert_eq!(prefs.preferred("HW1"), Some(Transport::Usb));
    }

    #[test_deadline::timeout]
    fn connect_request_accepts_wire_shape() {
        let parsed: ConnectRequest =
            serde_json::from_str(r#"{"device":"SER1","connect":"wifi","port":5557}"#).unwrap();
        assert_eq!(parsed.connect, Transport::Wifi);
        assert_eq!(parsed.port, Some(5557));

        let no_port: ConnectRequest =
            serde_json::from_str(r#"{"device":"SER1","connect":"usb"}"#).unwrap();
        assert_eq!(no_port.port, None);
    }
}
