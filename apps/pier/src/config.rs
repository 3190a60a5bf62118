use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub adb_host: String,
    pub adb_port: u16,
    /// Log full frame payloads instead of size/kind summaries.
    pub log_payloads: bool,
    pub recordings_dir: PathBuf,
    pub uploads_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PIER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            adb_host: env::var("ADB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            adb_port: env::var("ADB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5037),
            log_payloads: env::var("DEVICE_SOCKET_LOG_PAYLOAD").is_ok(),
            recordings_dir: env::var("RECORDINGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("recordings")),
            uploads_dir: env::var("UPLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("uploads")),
        }
    }

    /// `LOG_LEVEL` maps onto a tracing env-filter directive; `silent` turns
    /// everything off.
    pub fn log_filter() -> String {
        match env::var("LOG_LEVEL").as_deref() {
            Ok("silent") => "off".to_string(),
            Ok(level @ ("error" | "warn" | "info" | "debug")) => level.to_string(),
            _ => "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            adb_host: "127.0.0.1".to_string(),
            adb_port: 5037,
            log_payloads: false,
            recordings_dir: PathBuf::from("recordings"),
            uploads_dir: PathBuf::from("uploads"),
        }
    }
}
