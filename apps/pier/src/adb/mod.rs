//! ADB host access: the library client, shell helpers, and the few places
//! the gateway shells out to the `adb` binary directly.

pub mod connect;
pub mod net;
pub mod sync;
pub mod tracker;

use std::process::Stdio;
use std::time::Duration;

use forensic_adb::Host;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// How a device is attached. Wi-Fi ids look like `host:port`; USB serials
/// carry no colon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Usb,
    Wifi,
}

pub fn transport_of(id: &str) -> Transport {
    if id.contains(':') {
        Transport::Wifi
    } else {
        Transport::Usb
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// Handle on one ADB server, shared by the tracker, the connection
/// controller and the file channel.
#[derive(Debug, Clone)]
pub struct AdbHost {
    host: Host,
    addr: String,
    port: u16,
}

impl AdbHost {
    pub fn new(addr: &str, port: u16) -> Self {
        Self {
            host: Host {
                host: Some(addr.to_string()),
                port: Some(port),
            },
            addr: addr.to_string(),
            port,
        }
    }

    /// `host:port` of the ADB server socket, for direct protocol clients.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    pub fn host(&self) -> Host {
        self.host.clone()
    }

    /// Device serials the ADB server currently knows about.
    pub async fn device_ids(&self) -> Result<Vec<String>> {
        let devices: Vec<forensic_adb::DeviceInfo> = self
            .host
            .devices::<Vec<_>>()
            .await
            .map_err(|e| GatewayError::Upstream(format!("adb devices: {e}")))?;
        Ok(devices.into_iter().map(|d| d.serial).collect())
    }

    /// Run a shell command on a device via the ADB server.
    pub async fn shell(&self, serial: &str, command: &str) -> Result<String> {
        let device = forensic_adb::Device::new(
            self.host.clone(),
            serial.to_string(),
            forensic_adb::AndroidStorageInput::Auto,
        )
        .await
        .map_err(|e| GatewayError::Upstream(format!("adb transport {serial}: {e}")))?;
        device
            .execute_host_shell_command(command)
            .await
            .map_err(|e| GatewayError::Upstream(format!("adb shell {serial}: {e}")))
    }

    /// Forward a host-side TCP port to a device-side one. `local = 0` lets
    /// the server pick a free port; the bound port comes back.
    pub async fn forward(&self, serial: &str, local: u16, remote: u16) -> Result<u16> {
        let device = forensic_adb::Device::new(
            self.host.clone(),
            serial.to_string(),
            forensic_adb::AndroidStorageInput::Auto,
        )
        .await
        .map_err(|e| GatewayError::Upstream(format!("adb transport {serial}: {e}")))?;
        device
            .forward_port(local, remote)
            .await
            .map_err(|e| GatewayError::Upstream(format!("adb forward {serial}: {e}")))
    }

    /// Shell out to the `adb` binary, pointed at this server, with a hard
    /// deadline. Used where the library has no equivalent (`usb`, `tcpip`,
    /// `connect`, installs) and as the device-list fallback.
    pub async fn run_adb(&self, args: &[&str], deadline: Duration) -> Result<CommandOutput> {
        let port = self.port.to_string();
        let mut command = Command::new("adb");
        command
            .arg("-H")
            .arg(&self.addr)
            .arg("-P")
            .arg(&port)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(?args, "adb exec");

        let output = tokio::time::timeout(deadline, command.output())
            .await
            .map_err(|_| GatewayError::Timeout(format!("adb {}", args.join(" "))))??;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// `adb devices` via the binary; used when the library yields nothing.
    pub async fn device_ids_fallback(&self) -> Result<Vec<String>> {
        let output = self
            .run_adb(&["devices"], Duration::from_secs(10))
            .await?;
        Ok(parse_adb_devices(&output.stdout))
    }

    /// `adb get-state` for one device; `"unknown"` when it cannot be read.
    pub async fn device_state(&self, serial: &str) -> String {
        match self
            .run_adb(&["-s", serial, "get-state"], Duration::from_secs(10))
            .await
        {
            Ok(output) => {
                let state = output.combined();
                if state.is_empty() {
                    "unknown".to_string()
                } else {
                    state.lines().next().unwrap_or("unknown").trim().to_string()
                }
            }
            Err(_) => "unknown".to_string(),
        }
    }
}

/// Parse `adb devices` output into serials in the `device` state.
pub fn parse_adb_devices(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::timeout]
    fn transport_from_id_shape() {
        assert_eq!(transport_of("ce0117115968e432"), Transport::Usb);
        assert_eq!(transport_of("192.168.1.40:5555"), Transport::Wifi);
    }

    #[test_deadline::timeout]
    fn parses_adb_devices_table() {
        let stdout = "List of devices attached\n\
                      ce0117115968e432\tdevice\n\
                      192.168.1.40:5555\tdevice\n\
                      emulator-5554\toffline\n\n";
        assert_eq!(
            parse_adb_devices(stdout),
            vec!["ce0117115968e432", "192.168.1.40:5555"]
        );
        assert!(parse_adb_devices("List of devices attached\n\n").is_empty());
    }

    #[test_deadline::timeout]
    fn combined_output_merges_streams() {
        let output = CommandOutput {
            success: false,
            stdout: "partial\n".into(),
            stderr: "error: device offline\n".into(),
        };
        assert_eq!(output.combined(), "partial\nerror: device offline");
    }
}
