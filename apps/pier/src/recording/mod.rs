//! Control-traffic recordings: the on-disk model and store.
//!
//! A recording is a JSON file under the recordings directory, named by its
//! id. Messages carry a millisecond offset from the recorder's own clock
//! (net of paused time), the payload as UTF-8 or base64, and a binary flag.

pub mod player;
pub mod recorder;
pub mod status;

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Stop,
    Record,
    Run,
    Pause,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedMessage {
    pub at: u64,
    pub data: String,
    pub binary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: String,
    pub remote: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(default)]
    pub messages: Vec<RecordedMessage>,
}

/// Sanitize an externally supplied recording id into a safe file stem. The
/// sentinels `"true"` and `"1"` (and an empty id) mean "generate one".
pub fn normalize_id(raw: &str) -> String {
    match raw {
        "" | "true" | "1" => format!("session-{}", Utc::now().timestamp_millis()),
        other => other
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect(),
    }
}

#[derive(Debug, Clone)]
pub struct RecordingStore {
    dir: PathBuf,
}

impl RecordingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn persist(&self, recording: &Recording) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&recording.id);
        let json = serde_json::to_vec_pretty(recording)
            .map_err(|e| GatewayError::Upstream(format!("serialize recording: {e}")))?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    pub async fn load(&self, id: &str) -> Result<Recording> {
        let path = self.path_for(id);
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|_| GatewayError::NotFound(format!("recording {id}")))?;
        serde_json::from_slice(&raw)
            .map_err(|e| GatewayError::ProtocolViolation(format!("recording {id}: {e}")))
    }

    pub async fn list(&self) -> Result<Vec<Recording>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(out),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(raw) => match serde_json::from_slice::<Recording>(&raw) {
                    Ok(recording) => out.push(recording),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable recording")
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable recording")
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    pub async fn update_name(&self, id: &str, name: Option<String>) -> Result<()> {
        let mut recording = self.load(id).await?;
        recording.name = name;
        self.persist(&recording).await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|_| GatewayError::NotFound(format!("recording {id}")))
    }
}
