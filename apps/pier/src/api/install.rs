//! APK upload/install endpoints and the raw send-binary fan-out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures_util::SinkExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{info, warn};

use crate::error::{GatewayError, Result};
use crate::state::AppState;

/// Hard deadline on `adb push` / `pm install` / `install-multiple`.
const INSTALL_DEADLINE: Duration = Duration::from_secs(120);
const DEFAULT_SEND_REMOTE: u16 = 8886;
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// `POST /api/goog/device/install-apk-binary` — the body is the raw
/// APK/XAPK/ZIP bytes; `X-Filename` names it, `X-File-Size` (optional)
/// guards integrity. The file lands under the uploads directory.
pub async fn upload_apk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let filename = headers
        .get("X-Filename")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::BadParam("X-Filename header is required".into()))?;
    let filename = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| GatewayError::BadParam("bad X-Filename".into()))?
        .to_string();

    if let Some(expected) = headers
        .get("X-File-Size")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if expected != body.len() {
            return Err(GatewayError::BadParam(format!(
                "size mismatch: header says {expected}, body is {}",
                body.len()
            )));
        }
    }
    let udid = headers
        .get("X-UDID")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    tokio::fs::create_dir_all(&state.config.uploads_dir).await?;
    let path = state.config.uploads_dir.join(&filename);
    tokio::fs::write(&path, &body).await?;
    info!(udid, file = %path.display(), size = body.len(), "apk uploaded");

    Ok(Json(json!({
        "success": true,
        "filePath": path.to_string_lossy(),
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallUploadedRequest {
    pub udid: String,
    pub file_path: String,
}

/// `POST /api/goog/device/install-uploaded` — install a previously
/// uploaded file. `.apk` goes through push + `pm install -r`; `.xapk` and
/// `.zip` are split bundles, unpacked and installed together.
pub async fn install_uploaded(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InstallUploadedRequest>,
) -> Result<Json<Value>> {
    let path = resolve_under_uploads(&state.config.uploads_dir, &body.file_path).await?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "apk" => install_single_apk(&state, &body.udid, &path).await?,
        "xapk" | "zip" => install_split_bundle(&state, &body.udid, &path).await?,
        other => {
            return Err(GatewayError::BadParam(format!(
                "unsupported package type: .{other}"
            )))
        }
    }
    Ok(Json(json!({ "success": true })))
}

/// The install source must stay inside the uploads directory.
async fn resolve_under_uploads(uploads: &Path, file_path: &str) -> Result<PathBuf> {
    let requested = PathBuf::from(file_path);
    let joined = if requested.is_absolute() {
        requested
    } else {
        uploads.join(requested)
    };
    let canonical_uploads = tokio::fs::canonicalize(uploads)
        .await
        .map_err(|_| GatewayError::NotFound("uploads directory".into()))?;
    let canonical = tokio::fs::canonicalize(&joined)
        .await
        .map_err(|_| GatewayError::NotFound(format!("no such upload: {file_path}")))?;
    if !canonical.starts_with(&canonical_uploads) {
        return Err(GatewayError::BadParam(
            "file path escapes the uploads directory".into(),
        ));
    }
    Ok(canonical)
}

async fn install_single_apk(state: &AppState, udid: &str, path: &Path) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| GatewayError::BadParam("bad apk name".into()))?;
    let device_path = format!("/data/local/tmp/{name}");
    let local = path.to_string_lossy();

    let push = state
        .adb
        .run_adb(&["-s", udid, "push", &local, &device_path], INSTALL_DEADLINE)
        .await?;
    if !push.success {
        return Err(GatewayError::Upstream(push.combined()));
    }

    let install = state
        .adb
        .run_adb(
            &["-s", udid, "shell", "pm", "install", "-r", &device_path],
            INSTALL_DEADLINE,
        )
        .await?;
    if !install.success || !install.stdout.contains("Success") {
        return Err(GatewayError::Upstream(install.combined()));
    }
    info!(udid, apk = name, "apk installed");
    Ok(())
}

async fn install_split_bundle(state: &AppState, udid: &str, path: &Path) -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let splits = extract_split_apks(path.to_path_buf(), scratch.path().to_path_buf()).await?;
    if splits.is_empty() {
        return Err(GatewayError::BadParam("bundle contains no apks".into()));
    }

    let mut args: Vec<String> = vec![
        "-s".into(),
        udid.into(),
        "install-multiple".into(),
        "-r".into(),
    ];
    args.extend(splits.iter().map(|p| p.to_string_lossy().into_owned()));
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    let install = state.adb.run_adb(&arg_refs, INSTALL_DEADLINE).await?;
    if !install.success || !install.stdout.contains("Success") {
        return Err(GatewayError::Upstream(install.combined()));
    }
    info!(udid, splits = splits.len(), "split bundle installed");
    Ok(())
}

/// Unzip every `.apk` member, flattened, and order them for install:
/// `base*.apk` first, the rest alphabetically.
async fn extract_split_apks(bundle: PathBuf, into: PathBuf) -> Result<Vec<PathBuf>> {
    let extracted = tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
        let file = std::fs::File::open(&bundle)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| GatewayError::BadParam(format!("not a zip archive: {e}")))?;
        let mut out = Vec::new();
        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| GatewayError::BadParam(format!("corrupt archive: {e}")))?;
            if entry.is_dir() {
                continue;
            }
            let Some(name) = entry
                .enclosed_name()
                .and_then(|p| p.file_name().map(|n| n.to_owned()))
            else {
                continue;
            };
            if !name.to_string_lossy().ends_with(".apk") {
                continue;
            }
            let dest = into.join(&name);
            let mut target = std::fs::File::create(&dest)?;
            std::io::copy(&mut entry, &mut target)?;
            out.push(dest);
        }
        Ok(out)
    })
    .await
    .map_err(|e| GatewayError::Upstream(format!("unzip task failed: {e}")))??;

    let mut ordered = extracted;
    ordered.sort_by_key(|path| {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        (!name.starts_with("base"), name)
    });
    Ok(ordered)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBinaryRequest {
    pub udids: Vec<String>,
    #[serde(default)]
    pub remote: Option<String>,
    pub data_base64: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// `POST /api/goog/device/send-binary` — for each device, forward the
/// remote socket, open a throwaway WebSocket, send the blob, close.
pub async fn send_binary(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendBinaryRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    let data = BASE64
        .decode(&body.data_base64)
        .map_err(|e| GatewayError::BadParam(format!("bad dataBase64: {e}")))?;
    let remote_port = body
        .remote
        .as_deref()
        .map(|r| {
            r.strip_prefix("tcp:")
                .unwrap_or(r)
                .parse::<u16>()
                .map_err(|_| GatewayError::BadParam(format!("bad remote: {r}")))
        })
        .transpose()?
        .unwrap_or(DEFAULT_SEND_REMOTE);
    let deadline = body
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_SEND_TIMEOUT);
    let path = body
        .path
        .clone()
        .map(|p| if p.starts_with('/') { p } else { format!("/{p}") })
        .unwrap_or_default();

    let mut results = Vec::with_capacity(body.udids.len());
    let mut all_ok = true;
    for udid in &body.udids {
        let outcome = tokio::time::timeout(
            deadline,
            send_to_device(&state, udid, remote_port, &path, &data),
        )
        .await
        .map_err(|_| GatewayError::Timeout(format!("send-binary to {udid}")))
        .and_then(|r| r);
        match outcome {
            Ok(()) => results.push(json!({ "udid": udid, "success": true })),
            Err(e) => {
                warn!(udid = %udid, error = %e, "send-binary failed");
                all_ok = false;
                results.push(json!({ "udid": udid, "success": false, "error": e.to_string() }));
            }
        }
    }

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    Ok((status, Json(json!({ "success": all_ok, "results": results }))))
}

async fn send_to_device(
    state: &AppState,
    udid: &str,
    remote_port: u16,
    path: &str,
    data: &[u8],
) -> Result<()> {
    let local_port = state.adb.forward(udid, 0, remote_port).await?;
    let url = format!("ws://127.0.0.1:{local_port}{path}");
    let (mut socket, _) = connect_async(&url)
        .await
        .map_err(|e| GatewayError::Upstream(format!("connect {url}: {e}")))?;
    socket
        .send(tungstenite::Message::Binary(data.to_vec()))
        .await
        .map_err(|e| GatewayError::Upstream(format!("send to {udid}: {e}")))?;
    let _ = socket.close(None).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test_deadline::tokio_timeout_test]
    async fn uploads_path_confinement() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        tokio::fs::create_dir_all(&uploads).await.unwrap();
        tokio::fs::write(uploads.join("app.apk"), b"apk").await.unwrap();
        tokio::fs::write(dir.path().join("outside.apk"), b"apk")
            .await
            .unwrap();

        assert!(resolve_under_uploads(&uploads, "app.apk").await.is_ok());
        assert!(matches!(
            resolve_under_uploads(&uploads, "../outside.apk").await,
            Err(GatewayError::BadParam(_))
        ));
        assert!(matches!(
            resolve_under_uploads(&uploads, "missing.apk").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test_deadline::tokio_timeout_test]
    async fn split_bundle_extraction_orders_base_first() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("app.xapk");
        {
            let file = std::fs::File::create(&bundle).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            for name in [
                "config.arm64_v8a.apk",
                "base.apk",
                "icon.png",
                "splits/config.en.apk",
            ] {
                zip.start_file(name, options).unwrap();
                zip.write_all(b"data").unwrap();
            }
            zip.finish().unwrap();
        }

        let scratch = tempfile::tempdir().unwrap();
        let splits = extract_split_apks(bundle, scratch.path().to_path_buf())
            .await
            .unwrap();
        let names: Vec<String> = splits
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["base.apk", "config.arm64_v8a.apk", "config.en.apk"]
        );
    }
}
