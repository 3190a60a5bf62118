//! The FSLS file channel: device file access over the multiplexer.
//!
//! A browser opens an `FSLS` channel naming a device serial; every file
//! operation then runs on its own grandchild channel carrying a 4-byte
//! opcode. The gateway services those ops against the device through the
//! ADB sync protocol. The device side sits behind [`FileStore`] so the
//! protocol machinery tests against an in-memory tree.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pier_proto::fsls::{
    build_channel_init, parse_channel_init, DirEntry, FileFrame, FileOp, PushAck, PushCommand,
    PushRequest, ACK_ERROR, ACK_NEW_ID, ACK_OK,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::adb::sync::AdbSyncClient;
use crate::error::{close, GatewayError, Result};
use crate::mux::{Channel, ChannelEvent, IncomingChannel};

/// Chunk size for RECV data frames and push APPEND requests.
pub const CHUNK: usize = 64 * 1024;
/// Client-side wait per push acknowledgement.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);
/// FINISH covers the device write, so it gets longer.
pub const FINISH_TIMEOUT: Duration = Duration::from_secs(30);

const PUSH_FILE_MODE: u32 = 0o100644;

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn list(&self, path: &str) -> Result<Vec<DirEntry>>;
    async fn stat(&self, path: &str) -> Result<(u32, u32, u32)>;
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, mode: u32, data: Vec<u8>) -> Result<()>;
}

/// Production store: one ADB sync connection per operation.
pub struct AdbFileStore {
    server_addr: String,
    serial: String,
}

impl AdbFileStore {
    pub fn new(server_addr: String, serial: String) -> Self {
        Self {
            server_addr,
            serial,
        }
    }

    async fn client(&self) -> Result<AdbSyncClient<tokio::net::TcpStream>> {
        AdbSyncClient::connect(&self.server_addr, &self.serial).await
    }
}

#[async_trait]
impl FileStore for AdbFileStore {
    async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.client().await?.list(path).await
    }

    async fn stat(&self, path: &str) -> Result<(u32, u32, u32)> {
        let stat = self.client().await?.stat(path).await?;
        Ok((stat.mode, stat.size, stat.mtime_s))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.client().await?.recv(path).await
    }

    async fn write(&self, path: &str, mode: u32, data: Vec<u8>) -> Result<()> {
        self.client().await?.send(path, mode, &data).await
    }
}

// ---------------------------------------------------------------------------
// Server side

/// Service one FSLS session channel: every announced grandchild is a file
/// operation handled on its own task.
pub async fn serve_session(mut session: IncomingChannel, store: Arc<dyn FileStore>) {
    let serial = match parse_channel_init(&session.init) {
        Ok(serial) => serial,
        Err(e) => {
            warn!(error = %e, "bad FSLS init blob");
            let _ = session
                .channel
                .close(close::BAD_PARAMETERS, Some("bad FSLS init"));
            return;
        }
    };
    debug!(serial, "file channel session opened");

    while let Some(event) = session.events.recv().await {
        match event {
            ChannelEvent::Channel(op) => {
                let store = Arc::clone(&store);
                tokio::spawn(handle_op(op, store));
            }
            ChannelEvent::Closed { .. } => break,
            _ => {}
        }
    }
    debug!(serial, "file channel session closed");
}

async fn handle_op(mut op: IncomingChannel, store: Arc<dyn FileStore>) {
    let parsed = match FileOp::decode(&op.init) {
        Ok(parsed) => parsed,
        Err(e) => {
            let _ = op
                .channel
                .close(close::BAD_PARAMETERS, Some(&e.to_string()));
            return;
        }
    };
    match parsed {
        FileOp::Send => serve_push(op, store).await,
        other => {
            let outcome = run_read_op(&op.channel, other, store).await;
            match outcome {
                Ok(()) => {
                    let _ = op.channel.close(0, None);
                }
                Err(e) => {
                    let message = e.to_string();
                    let _ = op.channel.send(FileFrame::Fail(message.clone()).encode());
                    let _ = op.channel.close(e.close_code(), Some(&message));
                }
            }
        }
    }
}

async fn run_read_op(channel: &Channel, op: FileOp, store: Arc<dyn FileStore>) -> Result<()> {
    match op {
        FileOp::List { path } => {
            for entry in store.list(&path).await? {
                channel.send(FileFrame::Dent(entry).encode())?;
            }
            Ok(())
        }
        FileOp::Stat { path } => {
            let (mode, size, mtime_s) = store.stat(&path).await?;
            channel.send(
                FileFrame::Stat {
                    mode,
                    size,
                    mtime_s,
                }
                .encode(),
            )?;
            Ok(())
        }
        FileOp::Recv { path } => {
            let content = store.read(&path).await?;
            for chunk in content.chunks(CHUNK) {
                channel.send(FileFrame::Data(chunk.to_vec()).encode())?;
            }
            channel.send(FileFrame::Done.encode())?;
            Ok(())
        }
        FileOp::Send => unreachable!("push handled separately"),
    }
}

#[derive(Default)]
struct Transfer {
    path: Option<String>,
    buffer: Vec<u8>,
}

/// The lock-step push server: every request is acknowledged before the
/// client may send the next chunk. The buffered file reaches the device in
/// one sync-protocol push when FINISH arrives.
async fn serve_push(mut op: IncomingChannel, store: Arc<dyn FileStore>) {
    let mut next_id: i16 = 1;
    let mut transfers: HashMap<i16, Transfer> = HashMap::new();

    fn ack(channel: &Channel, id: i16, status: i8) {
        let _ = channel.send(PushAck { id, status }.encode());
    }

    while let Some(event) = op.events.recv().await {
        let payload = match event {
            ChannelEvent::Binary(payload) => payload,
            ChannelEvent::Closed { .. } => return,
            _ => continue,
        };
        let request = match PushRequest::decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                let _ = op
                    .channel
                    .close(close::BAD_PARAMETERS, Some(&e.to_string()));
                return;
            }
        };
        match request.command {
            PushCommand::New => {
                let id = next_id;
                next_id = next_id.wrapping_add(1).max(1);
                transfers.insert(id, Transfer::default());
                ack(&op.channel, id, ACK_NEW_ID);
            }
            PushCommand::Start { size, name } => match transfers.get_mut(&request.id) {
                Some(transfer) => {
                    transfer.path = Some(name);
                    transfer.buffer.reserve(size.max(0) as usize);
                    ack(&op.channel, request.id, ACK_OK);
                }
                None => ack(&op.channel, request.id, ACK_ERROR),
            },
            PushCommand::Append(data) => match transfers.get_mut(&request.id) {
                Some(transfer) => {
                    transfer.buffer.extend_from_slice(&data);
                    ack(&op.channel, request.id, ACK_OK);
                }
                None => ack(&op.channel, request.id, ACK_ERROR),
            },
            PushCommand::Finish => {
                let transfer = transfers.remove(&request.id);
                let result = match transfer.and_then(|t| t.path.map(|p| (p, t.buffer))) {
                    Some((path, buffer)) => store.write(&path, PUSH_FILE_MODE, buffer).await,
                    None => Err(GatewayError::InvalidState("finish before start")),
                };
                match result {
                    Ok(()) => {
                        ack(&op.channel, request.id, ACK_OK);
                        let _ = op.channel.close(0, None);
                    }
                    Err(e) => {
                        ack(&op.channel, request.id, ACK_ERROR);
                        let _ = op.channel.close(e.close_code(), Some(&e.to_string()));
                    }
                }
                return;
            }
            PushCommand::Cancel => {
                transfers.remove(&request.id);
                let _ = op.channel.close(0, None);
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client side

/// Client handle over an open FSLS session channel.
pub struct FslsClient {
    channel: Channel,
}

impl FslsClient {
    /// Open an FSLS session as a child of `root`.
    pub fn open(root: &Channel, serial: &str) -> Result<Self> {
        let (channel, _events) = root.open_child(build_channel_init(serial))?;
        Ok(Self { channel })
    }

    pub async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (_channel, mut events) = self.channel.open_child(
            FileOp::List {
                path: path.to_string(),
            }
            .encode(),
        )?;
        let mut entries = Vec::new();
        collect_frames(&mut events, |frame| {
            match frame {
                FileFrame::Dent(entry) => entries.push(entry),
                FileFrame::Fail(message) => return Err(GatewayError::NotFound(message)),
                _ => return Err(unexpected_frame()),
            }
            Ok(())
        })
        .await?;
        Ok(entries)
    }

    pub async fn stat(&self, path: &str) -> Result<(u32, u32, u32)> {
        let (_channel, mut events) = self.channel.open_child(
            FileOp::Stat {
                path: path.to_string(),
            }
            .encode(),
        )?;
        let mut stat = None;
        collect_frames(&mut events, |frame| {
            match frame {
                FileFrame::Stat {
                    mode,
                    size,
                    mtime_s,
                } => stat = Some((mode, size, mtime_s)),
                FileFrame::Fail(message) => return Err(GatewayError::NotFound(message)),
                _ => return Err(unexpected_frame()),
            }
            Ok(())
        })
        .await?;
        stat.ok_or_else(|| GatewayError::ProtocolViolation("stat reply missing".into()))
    }

    pub async fn recv(&self, path: &str) -> Result<Vec<u8>> {
        let (_channel, mut events) = self.channel.open_child(
            FileOp::Recv {
                path: path.to_string(),
            }
            .encode(),
        )?;
        let mut content = Vec::new();
        collect_frames(&mut events, |frame| {
            match frame {
                FileFrame::Data(chunk) => content.extend_from_slice(&chunk),
                FileFrame::Done => {}
                FileFrame::Fail(message) => return Err(GatewayError::NotFound(message)),
                _ => return Err(unexpected_frame()),
            }
            Ok(())
        })
        .await?;
        Ok(content)
    }

    /// Push a file through the lock-step sub-protocol: NEW for an id, START,
    /// acked APPEND chunks, FINISH. Each step waits for its ack under a
    /// deadline.
    pub async fn push(&self, path: &str, data: &[u8]) -> Result<()> {
        let (channel, mut events) = self.channel.open_child(FileOp::Send.encode())?;

        channel.send(
            PushRequest {
                id: -1,
                command: PushCommand::New,
            }
            .encode(),
        )?;
        let ack = wait_ack(&mut events, ACK_TIMEOUT).await?;
        if ack.status != ACK_NEW_ID {
            return Err(GatewayError::Upstream("push id not allocated".into()));
        }
        let id = ack.id;

        channel.send(
            PushRequest {
                id,
                command: PushCommand::Start {
                    size: data.len() as i32,
                    name: path.to_string(),
                },
            }
            .encode(),
        )?;
        expect_ok(wait_ack(&mut events, ACK_TIMEOUT).await?)?;

        for chunk in data.chunks(CHUNK) {
            channel.send(
                PushRequest {
                    id,
                    command: PushCommand::Append(chunk.to_vec()),
                }
                .encode(),
            )?;
            expect_ok(wait_ack(&mut events, ACK_TIMEOUT).await?)?;
        }

        channel.send(
            PushRequest {
                id,
                command: PushCommand::Finish,
            }
            .encode(),
        )?;
        expect_ok(wait_ack(&mut events, FINISH_TIMEOUT).await?)?;
        Ok(())
    }
}

fn unexpected_frame() -> GatewayError {
    GatewayError::ProtocolViolation("unexpected file frame".into())
}

fn expect_ok(ack: PushAck) -> Result<()> {
    if ack.status == ACK_OK {
        Ok(())
    } else {
        Err(GatewayError::Upstream(format!(
            "push step rejected with status {}",
            ack.status
        )))
    }
}

/// Drain an op channel until it closes; `on_frame` sees every binary frame.
async fn collect_frames(
    events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    mut on_frame: impl FnMut(FileFrame) -> Result<()>,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Binary(payload) => on_frame(FileFrame::decode(&payload)?)?,
            ChannelEvent::Closed { code: 0, .. } => return Ok(()),
            ChannelEvent::Closed { code, reason } => {
                return Err(GatewayError::Upstream(format!(
                    "file op failed ({code}): {}",
                    reason.unwrap_or_default()
                )))
            }
            _ => {}
        }
    }
    Err(GatewayError::PeerClosed)
}

async fn wait_ack(
    events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    deadline: Duration,
) -> Result<PushAck> {
    let ack = tokio::time::timeout(deadline, async {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Binary(payload) => return Some(PushAck::decode(&payload)),
                ChannelEvent::Closed { .. } => return None,
                _ => {}
            }
        }
        None
    })
    .await
    .map_err(|_| GatewayError::Timeout("push ack".into()))?;
    match ack {
        Some(Ok(ack)) => Ok(ack),
        Some(Err(e)) => Err(e.into()),
        None => Err(GatewayError::PeerClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{Multiplexer, RawOut};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory device filesystem for protocol tests.
    #[derive(Default)]
    struct MemFileStore {
        files: Mutex<BTreeMap<String, (u32, u32, Vec<u8>)>>,
    }

    impl MemFileStore {
        fn with_file(self, path: &str, mode: u32, mtime: u32, data: &[u8]) -> Self {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), (mode, mtime, data.to_vec()));
            self
        }
    }

    #[async_trait]
    impl FileStore for MemFileStore {
        async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            let files = self.files.lock().unwrap();
            let entries: Vec<DirEntry> = files
                .iter()
                .filter(|(p, _)| {
                    p.starts_with(&prefix) && !p[prefix.len()..].contains('/')
                })
                .map(|(p, (mode, mtime, data))| DirEntry {
                    mode: *mode,
                    size: data.len() as u32,
                    mtime_s: *mtime,
                    name: p[prefix.len()..].to_string(),
                })
                .collect();
            if entries.is_empty() {
                return Err(GatewayError::NotFound(format!("no such dir: {path}")));
            }
            Ok(entries)
        }

        async fn stat(&self, path: &str) -> Result<(u32, u32, u32)> {
            let files = self.files.lock().unwrap();
            files
                .get(path)
                .map(|(mode, mtime, data)| (*mode, data.len() as u32, *mtime))
                .ok_or_else(|| GatewayError::NotFound(format!("no such path: {path}")))
        }

        async fn read(&self, path: &str) -> Result<Vec<u8>> {
            let files = self.files.lock().unwrap();
            files
                .get(path)
                .map(|(_, _, data)| data.clone())
                .ok_or_else(|| GatewayError::NotFound(format!("no such path: {path}")))
        }

        async fn write(&self, path: &str, mode: u32, data: Vec<u8>) -> Result<()> {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), (mode, 1_700_000_000, data));
            Ok(())
        }
    }

    /// Wire a client root to a served FSLS session over an in-process loop.
    fn loopback(store: Arc<dyn FileStore>) -> Channel {
        let (client_root, _client_events, mut client_out) = Multiplexer::new();
        let (server_root, mut server_events, mut server_out) = Multiplexer::new();

        let to_server = server_root.clone();
        tokio::spawn(async move {
            while let Some(out) = client_out.recv().await {
                if let RawOut::Frame(bytes) = out {
                    let _ = to_server.feed(&bytes);
                }
            }
        });
        let to_client = client_root.clone();
        tokio::spawn(async move {
            while let Some(out) = server_out.recv().await {
                if let RawOut::Frame(bytes) = out {
                    let _ = to_client.feed(&bytes);
                }
            }
        });
        tokio::spawn(async move {
            while let Some(event) = server_events.recv().await {
                if let ChannelEvent::Channel(incoming) = event {
                    tokio::spawn(serve_session(incoming, Arc::clone(&store)));
                }
            }
        });
        client_root
    }

    #[test_deadline::tokio_timeout_test]
    async fn list_streams_dents_and_closes_clean() {
        let store = Arc::new(
            MemFileStore::default()
                .with_file("/sdcard/a.txt", 0o100644, 1_700_000_000, b"aaa")
                .with_file("/sdcard/b.bin", 0o100600, 1_700_000_001, b"bbbb"),
        );
        let root = loopback(store);
        let client = FslsClient::open(&root, "SERIAL1").unwrap();

        let mut entries = client.list("/sdcard").await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].size, 3);
        assert_eq!(entries[1].name, "b.bin");
    }

    #[test_deadline::tokio_timeout_test]
    async fn list_missing_path_surfaces_not_found() {
        let root = loopback(Arc::new(MemFileStore::default()));
        let client = FslsClient::open(&root, "SERIAL1").unwrap();
        assert!(matches!(
            client.list("/nope").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test_deadline::tokio_timeout_test]
    async fn recv_reassembles_chunked_content() {
        let content: Vec<u8> = (0..(CHUNK + 1234)).map(|i| (i % 251) as u8).collect();
        let store = Arc::new(MemFileStore::default().with_file(
            "/data/big.bin",
            0o100644,
            1_700_000_000,
            &content,
        ));
        let root = loopback(store);
        let client = FslsClient::open(&root, "SERIAL1").unwrap();
        assert_eq!(client.recv("/data/big.bin").await.unwrap(), content);
    }

    #[test_deadline::tokio_timeout_test]
    async fn push_round_trip_then_stat_reports_the_size() {
        let store = Arc::new(MemFileStore::default());
        let root = loopback(Arc::clone(&store) as Arc<dyn FileStore>);
        let client = FslsClient::open(&root, "SERIAL1").unwrap();

        let payload = vec![0x5A; 200 * 1024];
        client
            .push("/data/local/tmp/x.bin", &payload)
            .await
            .unwrap();

        let (mode, size, mtime) = client.stat("/data/local/tmp/x.bin").await.unwrap();
        assert_eq!(size, 204_800);
        assert_eq!(mode, PUSH_FILE_MODE);
        assert!(mtime > 0);
    }

    #[test_deadline::tokio_timeout_test]
    async fn push_ack_timeout_fires() {
        tokio::time::pause();
        // A root with no server behind it: requests go nowhere.
        let (client_root, _events, _out) = Multiplexer::new();
        let client = FslsClient::open(&client_root, "SERIAL1").unwrap();

        let push = tokio::spawn(async move { client.push("/x", b"data").await });
        tokio::time::advance(ACK_TIMEOUT + Duration::from_secs(1)).await;
        let result = push.await.unwrap();
        assert!(matches!(result, Err(GatewayError::Timeout(_))));
    }

    #[test_deadline::tokio_timeout_test]
    async fn stat_after_failed_op_keeps_session_usable() {
        let store = Arc::new(MemFileStore::default().with_file(
            "/a",
            0o100644,
            1_700_000_000,
            b"x",
        ));
        let root = loopback(store);
        let client = FslsClient::open(&root, "SERIAL1").unwrap();

        assert!(client.stat("/missing").await.is_err());
        // The failed grandchild closed; the session channel still works.
        assert_eq!(client.stat("/a").await.unwrap().1, 1);
    }
}
