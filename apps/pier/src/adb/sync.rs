//! ADB sync-protocol client.
//!
//! File operations talk to the ADB server directly: a TCP connection is
//! switched onto the device transport (`host:transport:<serial>`), put into
//! `sync:` mode, and then speaks the v1 sync protocol — `LIST`/`STAT`/
//! `RECV`/`SEND` requests with 4-byte ids and little-endian lengths. One
//! connection serves one operation; the server closes sync mode on `QUIT`.

use std::time::{SystemTime, UNIX_EPOCH};

use pier_proto::fsls::DirEntry;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{GatewayError, Result};

/// Chunk size for `SEND` payloads, the protocol's maximum.
pub const SEND_CHUNK: usize = 64 * 1024;

const ID_LIST: &[u8; 4] = b"LIST";
const ID_STAT: &[u8; 4] = b"STAT";
const ID_RECV: &[u8; 4] = b"RECV";
const ID_SEND: &[u8; 4] = b"SEND";
const ID_DENT: &[u8; 4] = b"DENT";
const ID_DATA: &[u8; 4] = b"DATA";
const ID_DONE: &[u8; 4] = b"DONE";
const ID_OKAY: &[u8; 4] = b"OKAY";
const ID_FAIL: &[u8; 4] = b"FAIL";
const ID_QUIT: &[u8; 4] = b"QUIT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    pub size: u32,
    pub mtime_s: u32,
}

pub struct AdbSyncClient<S> {
    stream: S,
}

impl AdbSyncClient<TcpStream> {
    /// Open a sync session to `serial` through the ADB server at `addr`.
    pub async fn connect(addr: &str, serial: &str) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| GatewayError::Upstream(format!("adb server {addr}: {e}")))?;
        host_request(&mut stream, &format!("host:transport:{serial}")).await?;
        host_request(&mut stream, "sync:").await?;
        Ok(Self { stream })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AdbSyncClient<S> {
    /// Wrap an established, already sync-mode stream.
    pub fn from_stream(stream: S) -> Self {
        Self { stream }
    }

    pub async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        self.request(ID_LIST, path.as_bytes()).await?;
        let mut entries = Vec::new();
        loop {
            let id = self.read_id().await?;
            match &id {
                ID_DENT => {
                    let mode = self.read_u32().await?;
                    let size = self.read_u32().await?;
                    let mtime_s = self.read_u32().await?;
                    let name_len = self.read_u32().await? as usize;
                    let mut name = vec![0u8; name_len];
                    self.stream.read_exact(&mut name).await?;
                    let name = String::from_utf8_lossy(&name).into_owned();
                    if name != "." && name != ".." {
                        entries.push(DirEntry {
                            mode,
                            size,
                            mtime_s,
                            name,
                        });
                    }
                }
                ID_DONE => {
                    // DONE reuses the dent layout with zeroed fields.
                    let mut rest = [0u8; 16];
                    self.stream.read_exact(&mut rest).await?;
                    break;
                }
                ID_FAIL => return Err(self.read_fail().await?),
                other => {
                    return Err(GatewayError::ProtocolViolation(format!(
                        "unexpected sync id {:?}",
                        String::from_utf8_lossy(other)
                    )))
                }
            }
        }
        self.quit().await;
        Ok(entries)
    }

    pub async fn stat(&mut self, path: &str) -> Result<FileStat> {
        self.request(ID_STAT, path.as_bytes()).await?;
        let id = self.read_id().await?;
        if &id != ID_STAT {
            if &id == ID_FAIL {
                return Err(self.read_fail().await?);
            }
            return Err(GatewayError::ProtocolViolation(
                "stat reply with wrong id".into(),
            ));
        }
        let stat = FileStat {
            mode: self.read_u32().await?,
            size: self.read_u32().await?,
            mtime_s: self.read_u32().await?,
        };
        self.quit().await;
        // The server answers with all-zero fields for a missing path.
        if stat.mode == 0 && stat.size == 0 && stat.mtime_s == 0 {
            return Err(GatewayError::NotFound(format!("no such path: {path}")));
        }
        Ok(stat)
    }

    pub async fn recv(&mut self, path: &str) -> Result<Vec<u8>> {
        self.request(ID_RECV, path.as_bytes()).await?;
        let mut content = Vec::new();
        loop {
            let id = self.read_id().await?;
            match &id {
                ID_DATA => {
                    let len = self.read_u32().await? as usize;
                    let start = content.len();
                    content.resize(start + len, 0);
                    self.stream.read_exact(&mut content[start..]).await?;
                }
                ID_DONE => {
                    let _ = self.read_u32().await?;
                    break;
                }
                ID_FAIL => return Err(self.read_fail().await?),
                other => {
                    return Err(GatewayError::ProtocolViolation(format!(
                        "unexpected sync id {:?}",
                        String::from_utf8_lossy(other)
                    )))
                }
            }
        }
        self.quit().await;
        Ok(content)
    }

    pub async fn send(&mut self, path: &str, mode: u32, data: &[u8]) -> Result<()> {
        let spec = format!("{path},{mode}");
        self.request(ID_SEND, spec.as_bytes()).await?;
        for chunk in data.chunks(SEND_CHUNK) {
            self.stream.write_all(ID_DATA).await?;
            self.stream
                .write_all(&(chunk.len() as u32).to_le_bytes())
                .await?;
            self.stream.write_all(chunk).await?;
        }
        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        self.stream.write_all(ID_DONE).await?;
        self.stream.write_all(&mtime.to_le_bytes()).await?;
        self.stream.flush().await?;

        let id = self.read_id().await?;
        match &id {
            ID_OKAY => {
                let _ = self.read_u32().await?;
                self.quit().await;
                Ok(())
            }
            ID_FAIL => Err(self.read_fail().await?),
            other => Err(GatewayError::ProtocolViolation(format!(
                "unexpected sync id {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    async fn request(&mut self, id: &[u8; 4], payload: &[u8]) -> Result<()> {
        self.stream.write_all(id).await?;
        self.stream
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn quit(&mut self) {
        let _ = self.stream.write_all(ID_QUIT).await;
        let _ = self.stream.write_all(&0u32.to_le_bytes()).await;
        let _ = self.stream.flush().await;
    }

    async fn read_id(&mut self) -> Result<[u8; 4]> {
        let mut id = [0u8; 4];
        self.stream.read_exact(&mut id).await?;
        Ok(id)
    }

    async fn read_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.stream.read_exact(&mut raw).await?;
        Ok(u32::from_le_bytes(raw))
    }

    async fn read_fail(&mut self) -> Result<GatewayError> {
        let len = self.read_u32().await? as usize;
        let mut msg = vec![0u8; len];
        self.stream.read_exact(&mut msg).await?;
        let msg = String::from_utf8_lossy(&msg).into_owned();
        if msg.contains("No such file") || msg.contains("does not exist") {
            Ok(GatewayError::NotFound(msg))
        } else {
            Ok(GatewayError::Upstream(msg))
        }
    }
}

/// Smart-socket request framing used before sync mode: 4 hex digits of
/// length, then the request; `OKAY` or `FAIL` + hex-length + message back.
async fn host_request<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, request: &str) -> Result<()> {
    stream
        .write_all(format!("{:04x}{request}", request.len()).as_bytes())
        .await?;
    stream.flush().await?;
    let mut status = [0u8; 4];
    stream.read_exact(&mut status).await?;
    match &status {
        b"OKAY" => Ok(()),
        b"FAIL" => {
            let mut len_hex = [0u8; 4];
            stream.read_exact(&mut len_hex).await?;
            let len = usize::from_str_radix(&String::from_utf8_lossy(&len_hex), 16)
                .map_err(|_| GatewayError::ProtocolViolation("bad FAIL length".into()))?;
            let mut msg = vec![0u8; len];
            stream.read_exact(&mut msg).await?;
            Err(GatewayError::Upstream(
                String::from_utf8_lossy(&msg).into_owned(),
            ))
        }
        _ => Err(GatewayError::ProtocolViolation(
            "unexpected adb server status".into(),
        )),
    }
}
