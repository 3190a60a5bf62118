//! On-device IPv4 discovery.
//!
//! Devices report their address through whichever tool their Android build
//! ships, so resolution walks a ladder: `ip route get`, `ip addr show` per
//! interface, `ifconfig` per interface, then a full `ifconfig` dump with
//! per-interface block extraction. Output formats vary per vendor; the
//! extractors accept all the shapes seen in the wild.

use std::net::Ipv4Addr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::AdbHost;

const ATTEMPTS: usize = 3;
const ATTEMPT_SPACING: Duration = Duration::from_millis(300);
const IFACES: [&str; 2] = ["wlan0", "eth0"];

// `ip route get 1.1.1.1` -> "... src 192.168.1.166 ..."
static ROUTE_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bsrc\s+(\d+\.\d+\.\d+\.\d+)\b").expect("route regex"));
// `ip -f inet addr show wlan0` -> "inet 192.168.1.166/24"
static INET_CIDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\binet\s+(\d+\.\d+\.\d+\.\d+)/\d+\b").expect("cidr regex"));
// older ifconfig -> "inet addr:192.168.1.166"
static INET_ADDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\binet\s+addr:\s*(\d+\.\d+\.\d+\.\d+)\b").expect("addr regex"));
// newer ifconfig -> "inet 192.168.1.166"
static INET_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\binet\s+(\d+\.\d+\.\d+\.\d+)\b").expect("inet regex"));

/// First non-loopback IPv4 in `text`, trying the known patterns in order.
pub fn pick_ipv4(text: &str) -> Option<Ipv4Addr> {
    for pattern in [&*ROUTE_SRC, &*INET_CIDR, &*INET_ADDR, &*INET_BARE] {
        if let Some(captures) = pattern.captures(text) {
            if let Ok(ip) = captures[1].parse::<Ipv4Addr>() {
                if !ip.is_loopback() {
                    return Some(ip);
                }
            }
        }
    }
    None
}

/// Extract one interface's block from a full `ifconfig` dump: the header
/// line plus its indented continuation lines.
pub fn iface_block(dump: &str, iface: &str) -> Option<String> {
    let mut block = String::new();
    let mut inside = false;
    for line in dump.lines() {
        if inside {
            if !line.is_empty() && !line.starts_with(char::is_whitespace) {
                break;
            }
            block.push('\n');
            block.push_str(line);
        } else if line.starts_with(iface)
            && line[iface.len()..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_alphanumeric())
        {
            inside = true;
            block.push_str(line);
        }
    }
    inside.then_some(block)
}

/// Resolve a device's IPv4, retrying the whole ladder a few times; adbd can
/// report an empty interface for a moment right after a transport change.
pub async fn resolve_ip(adb: &AdbHost, serial: &str) -> Option<Ipv4Addr> {
    for attempt in 0..ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(ATTEMPT_SPACING).await;
        }
        if let Some(ip) = resolve_once(adb, serial).await {
            return Some(ip);
        }
        debug!(serial, attempt, "device ip not resolved yet");
    }
    None
}

async fn resolve_once(adb: &AdbHost, serial: &str) -> Option<Ipv4Addr> {
    if let Ok(out) = adb.shell(serial, "ip route get 1.1.1.1").await {
        if let Some(ip) = pick_ipv4(&out) {
            return Some(ip);
        }
    }
    for iface in IFACES {
        if let Ok(out) = adb
            .shell(serial, &format!("ip -f inet addr show {iface}"))
            .await
        {
            if let Some(ip) = pick_ipv4(&out) {
                return Some(ip);
            }
        }
    }
    for iface in IFACES {
        if let Ok(out) = adb.shell(serial, &format!("ifconfig {iface}")).await {
            if let Some(ip) = pick_ipv4(&out) {
                return Some(ip);
            }
        }
    }
    if let Ok(dump) = adb.shell(serial, "ifconfig").await {
        for iface in IFACES {
            if let Some(block) = iface_block(&dump, iface) {
                if let Some(ip) = pick_ipv4(&block) {
                    return Some(ip);
                }
            }
        }
    }
    None
}
