//! Channel multiplexer runtime.
//!
//! One raw WebSocket carries many logical channels; a channel can itself
//! host children, nested to any depth via `Data` frames. The tree of channel
//! registries lives behind a single mutex so inbound dispatch stays
//! sequential per frame, and all sends funnel through one writer queue —
//! the raw socket has exactly one writer.
//!
//! The runtime is transport-agnostic: outgoing frames surface on an mpsc
//! receiver and inbound frames are pushed through [`Channel::feed`]. The
//! WebSocket glue lives in `ws`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pier_proto::mux::MuxFrame;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{close, GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A channel announced by the peer, handed to whoever listens on the parent.
pub struct IncomingChannel {
    pub channel: Channel,
    pub init: Vec<u8>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

pub enum ChannelEvent {
    Open,
    Binary(Vec<u8>),
    Text(String),
    Channel(IncomingChannel),
    Closed { code: u16, reason: Option<String> },
}

impl std::fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelEvent::Open => write!(f, "Open"),
            ChannelEvent::Binary(b) => write!(f, "Binary({} bytes)", b.len()),
            ChannelEvent::Text(t) => write!(f, "Text({t:?})"),
            ChannelEvent::Channel(c) => write!(f, "Channel(id={})", c.channel.id()),
            ChannelEvent::Closed { code, reason } => write!(f, "Closed({code}, {reason:?})"),
        }
    }
}

/// Frames leaving the multiplexer toward the raw socket.
#[derive(Debug, PartialEq, Eq)]
pub enum RawOut {
    Frame(Vec<u8>),
    Close { code: u16, reason: String },
}

struct Node {
    state: ReadyState,
    next_id: u32,
    children: HashMap<u32, Node>,
    /// Frames encoded against this channel's own id, parked until OPEN.
    pending: Vec<MuxFrame>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Node {
    fn new(state: ReadyState, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            state,
            next_id: 1,
            children: HashMap::new(),
            pending: Vec::new(),
            events,
        }
    }

    /// Recursively mark this subtree closed and notify every listener.
    fn close_subtree(&mut self, code: u16, reason: Option<&str>) {
        self.state = ReadyState::Closed;
        let _ = self.events.send(ChannelEvent::Closed {
            code,
            reason: reason.map(str::to_owned),
        });
        for (_, mut child) in self.children.drain() {
            child.close_subtree(code, reason);
        }
    }
}

struct MuxCore {
    out: mpsc::UnboundedSender<RawOut>,
    root: Mutex<Node>,
}

impl MuxCore {
    fn node<'a>(root: &'a mut Node, path: &[u32]) -> Option<&'a mut Node> {
        let mut node = root;
        for id in path {
            node = node.children.get_mut(id)?;
        }
        Some(node)
    }

    /// Write a frame produced by the channel at `path`, wrapping it in `Data`
    /// frames for every intermediate ancestor.
    fn write_wrapped(&self, path: &[u32], frame: &MuxFrame) {
        let mut bytes = frame.encode();
        for ancestor in path.iter().rev().skip(1) {
            bytes = MuxFrame::Nested {
                channel: *ancestor,
                frame: bytes,
            }
            .encode();
        }
        let _ = self.out.send(RawOut::Frame(bytes));
    }
}

pub struct Multiplexer;

impl Multiplexer {
    /// Build a root channel. The caller pumps `RawOut` frames into the raw
    /// socket and feeds inbound frames through [`Channel::feed`].
    pub fn new() -> (
        Channel,
        mpsc::UnboundedReceiver<ChannelEvent>,
        mpsc::UnboundedReceiver<RawOut>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let core = Arc::new(MuxCore {
            out: out_tx,
            root: Mutex::new(Node::new(ReadyState::Open, event_tx)),
        });
        let root = Channel {
            core,
            path: Arc::from(Vec::new().into_boxed_slice()),
        };
        (root, event_rx, out_rx)
    }
}

#[derive(Clone)]
pub struct Channel {
    core: Arc<MuxCore>,
    path: Arc<[u32]>,
}

impl Channel {
    pub fn id(&self) -> u32 {
        self.path.last().copied().unwrap_or(0)
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    pub fn ready_state(&self) -> ReadyState {
        let mut root = self.core.root.lock().expect("mux lock");
        match MuxCore::node(&mut root, &self.path) {
            Some(node) => node.state,
            None => ReadyState::Closed,
        }
    }

    pub fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.write(MuxFrame::Binary {
            channel: self.id(),
            payload,
        })
    }

    pub fn send_text(&self, payload: String) -> Result<()> {
        self.write(MuxFrame::Text {
            channel: self.id(),
            payload,
        })
    }

    fn write(&self, frame: MuxFrame) -> Result<()> {
        let mut root = self.core.root.lock().expect("mux lock");
        let node = MuxCore::node(&mut root, &self.path)
            .ok_or(GatewayError::InvalidState("channel is closed"))?;
        match node.state {
            ReadyState::Connecting => {
                node.pending.push(frame);
                Ok(())
            }
            ReadyState::Open => {
                self.core.write_wrapped(&self.path, &frame);
                Ok(())
            }
            ReadyState::Closing | ReadyState::Closed => {
                Err(GatewayError::InvalidState("write on closing channel"))
            }
        }
    }

    /// Create a child channel. The child is CONNECTING until this channel is
    /// OPEN, then opens on a later scheduler turn; queued writes drain then.
    pub fn open_child(
        &self,
        init: Vec<u8>,
    ) -> Result<(Channel, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let child_path: Arc<[u32]>;
        let parent_open;
        {
            let mut root = self.core.root.lock().expect("mux lock");
            let node = MuxCore::node(&mut root, &self.path)
                .ok_or(GatewayError::InvalidState("channel is closed"))?;
            if matches!(node.state, ReadyState::Closing | ReadyState::Closed) {
                return Err(GatewayError::InvalidState("parent is closing"));
            }
            let id = allocate_id(node)?;
            parent_open = node.state == ReadyState::Open;

            let mut child = Node::new(ReadyState::Connecting, event_tx);
            child.pending.push(MuxFrame::Create { channel: id, init });
            node.children.insert(id, child);

            let mut path = self.path.to_vec();
            path.push(id);
            child_path = Arc::from(path.into_boxed_slice());
        }

        let channel = Channel {
            core: Arc::clone(&self.core),
            path: child_path,
        };
        if parent_open {
            schedule_open(Arc::clone(&self.core), Arc::clone(&channel.path));
        }
        Ok((channel, event_rx))
    }

    /// Close this channel and every descendant. Closing an already-closed
    /// channel is a no-op.
    pub fn close(&self, code: u16, reason: Option<&str>) -> Result<()> {
        let mut root = self.core.root.lock().expect("mux lock");
        if self.is_root() {
            if root.state == ReadyState::Closed {
                return Ok(());
            }
            let _ = self.core.out.send(RawOut::Close {
                code,
                reason: reason.unwrap_or_default().to_string(),
            });
            root.close_subtree(code, reason);
            return Ok(());
        }

        let (parent_path, own_id) = (&self.path[..self.path.len() - 1], self.id());
        let Some(parent) = MuxCore::node(&mut root, parent_path) else {
            return Ok(());
        };
        let Some(node) = parent.children.get_mut(&own_id) else {
            return Ok(());
        };
        match node.state {
            ReadyState::Closed => Ok(()),
            ReadyState::Connecting | ReadyState::Closing => {
                // The close travels with the queued frames once the channel
                // would have opened; locally the subtree dies now.
                node.pending.push(MuxFrame::Close {
                    channel: own_id,
                    code,
                    reason: reason.map(str::to_owned),
                });
                node.state = ReadyState::Closing;
                Ok(())
            }
            ReadyState::Open => {
                self.core.write_wrapped(
                    &self.path,
                    &MuxFrame::Close {
                        channel: own_id,
                        code,
                        reason: reason.map(str::to_owned),
                    },
                );
                if let Some(mut removed) = parent.children.remove(&own_id) {
                    removed.close_subtree(code, reason);
                }
                Ok(())
            }
        }
    }

    /// Dispatch one inbound raw frame. Only meaningful on the root channel.
    pub fn feed(&self, bytes: &[u8]) -> Result<()> {
        let frame = MuxFrame::decode(bytes)?;
        let mut root = self.core.root.lock().expect("mux lock");
        let path = self.path.to_vec();
        dispatch(&self.core, &mut root, path, frame)
    }

    /// The peer closed the raw socket: tear down the whole tree.
    pub fn raw_socket_closed(&self, code: u16, reason: Option<&str>) {
        let mut root = self.core.root.lock().expect("mux lock");
        if root.state != ReadyState::Closed {
            root.close_subtree(code, reason);
        }
    }
}

fn allocate_id(node: &mut Node) -> Result<u32> {
    let start = node.next_id;
    loop {
        let candidate = node.next_id;
        node.next_id = bump(node.next_id);
        if !node.children.contains_key(&candidate) {
            return Ok(candidate);
        }
        if node.next_id == start {
            return Err(GatewayError::CapacityExhausted);
        }
    }
}

/// Advance an id, wrapping around and skipping 0 (the container itself).
fn bump(id: u32) -> u32 {
    match id.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Flip a locally created channel to OPEN on a later scheduler turn, then
/// drain its queue in order and cascade to children created in the meantime.
fn schedule_open(core: Arc<MuxCore>, path: Arc<[u32]>) {
    tokio::spawn(async move {
        let mut cascade = Vec::new();
        {
            let mut root = core.root.lock().expect("mux lock");
            let Some(node) = MuxCore::node(&mut root, &path) else {
                return;
            };
            match node.state {
                ReadyState::Connecting => {
                    node.state = ReadyState::Open;
                    let queued = std::mem::take(&mut node.pending);
                    let closing = queued
                        .iter()
                        .any(|f| matches!(f, MuxFrame::Close { .. }));
                    for frame in &queued {
                        core.write_wrapped(&path, frame);
                    }
                    if closing {
                        // close() was called while still CONNECTING.
                        let (parent_path, own_id) =
                            (&path[..path.len() - 1], path[path.len() - 1]);
                        if let Some(parent) = MuxCore::node(&mut root, parent_path) {
                            if let Some(mut removed) = parent.children.remove(&own_id) {
                                removed.close_subtree(close::NORMAL, None);
                            }
                        }
                        return;
                    }
                    let _ = node.events.send(ChannelEvent::Open);
                    for (id, child) in &node.children {
                        if matches!(child.state, ReadyState::Connecting | ReadyState::Closing) {
                            let mut child_path = path.to_vec();
                            child_path.push(*id);
                            cascade.push(Arc::from(child_path.into_boxed_slice()));
                        }
                    }
                }
                ReadyState::Closing => {
                    let queued = std::mem::take(&mut node.pending);
                    for frame in &queued {
                        core.write_wrapped(&path, frame);
                    }
                    let (parent_path, own_id) = (&path[..path.len() - 1], path[path.len() - 1]);
                    if let Some(parent) = MuxCore::node(&mut root, parent_path) {
                        if let Some(mut removed) = parent.children.remove(&own_id) {
                            removed.close_subtree(close::NORMAL, None);
                        }
                    }
                }
                _ => {}
            }
        }
        for child in cascade {
            schedule_open(Arc::clone(&core), child);
        }
    });
}

/// Route one decoded frame into the registry under `container_path`.
fn dispatch(
    core: &Arc<MuxCore>,
    root: &mut Node,
    container_path: Vec<u32>,
    frame: MuxFrame,
) -> Result<()> {
    let container = MuxCore::node(root, &container_path)
        .ok_or(GatewayError::InvalidState("container channel is closed"))?;
    match frame {
        MuxFrame::Create { channel: id, init } => {
            // Peer announcement: the channel is live immediately. Advance our
            // allocator past the announced id so the two sides cannot collide.
            if id >= container.next_id {
                container.next_id = bump(id);
            }
            if let Some(mut stale) = container.children.remove(&id) {
                stale.close_subtree(close::NORMAL, Some("superseded by peer announcement"));
            }
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            container
                .children
                .insert(id, Node::new(ReadyState::Open, event_tx));
            let mut child_path = container_path.clone();
            child_path.push(id);
            let incoming = IncomingChannel {
                channel: Channel {
                    core: Arc::clone(core),
                    path: Arc::from(child_path.into_boxed_slice()),
                },
                init,
                events: event_rx,
            };
            let _ = container.events.send(ChannelEvent::Channel(incoming));
            Ok(())
        }
        MuxFrame::Close {
            channel: id,
            code,
            reason,
        } => {
            // Unknown ids are a silent no-op.
            if let Some(mut node) = container.children.remove(&id) {
                node.close_subtree(code, reason.as_deref());
            }
            Ok(())
        }
        MuxFrame::Binary {
            channel: id,
            payload,
        } => {
            deliver(container, id, ChannelEvent::Binary(payload));
            Ok(())
        }
        MuxFrame::Text {
            channel: id,
            payload,
        } => {
            deliver(container, id, ChannelEvent::Text(payload));
            Ok(())
        }
        MuxFrame::Nested { channel: id, frame } => {
            if !container.children.contains_key(&id) {
                debug!(channel = id, "nested frame for unknown channel dropped");
                return Ok(());
            }
            let inner = MuxFrame::decode(&frame)?;
            let mut inner_path = container_path;
            inner_path.push(id);
            dispatch(core, root, inner_path, inner)
        }
    }
}

fn deliver(container: &mut Node, id: u32, event: ChannelEvent) {
    if id == 0 {
        let _ = container.events.send(event);
    } else if let Some(child) = container.children.get_mut(&id) {
        let _ = child.events.send(event);
    } else {
        debug!(channel = id, "frame for unknown channel dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::yield_now;

    async fn settle() {
        // Channel opens happen "on the next turn"; give the scheduler a few.
        for _ in 0..8 {
            yield_now().await;
        }
    }

    fn recv_frame(out: &mut mpsc::UnboundedReceiver<RawOut>) -> Vec<u8> {
        match out.try_recv().expect("expected an outgoing frame") {
            RawOut::Frame(bytes) => bytes,
            RawOut::Close { code, .. } => panic!("unexpected raw close {code}"),
        }
    }

    #[test_deadline::tokio_timeout_test]
    async fn root_send_produces_channel_zero_frame() {
        let (root, _events, mut out) = Multiplexer::new();
        root.send(vec![1, 2, 3]).unwrap();
        let frame = MuxFrame::decode(&recv_frame(&mut out)).unwrap();
        assert_eq!(
            frame,
            MuxFrame::Binary {
                channel: 0,
                payload: vec![1, 2, 3]
            }
        );
    }

    #[test_deadline::tokio_timeout_test]
    async fn child_create_then_queued_writes_drain_in_order() {
        let (root, _events, mut out) = Multiplexer::new();
        let (child, mut child_events) = root.open_child(b"SHEL".to_vec()).unwrap();
        assert_eq!(child.ready_state(), ReadyState::Connecting);
        child.send(vec![9]).unwrap();
        child.send_text("hello".into()).unwrap();

        settle().await;
        assert_eq!(child.ready_state(), ReadyState::Open);
        assert!(matches!(
            child_events.try_recv().unwrap(),
            ChannelEvent::Open
        ));

        let first = MuxFrame::decode(&recv_frame(&mut out)).unwrap();
        assert_eq!(
            first,
            MuxFrame::Create {
                channel: child.id(),
                init: b"SHEL".to_vec()
            }
        );
        let second = MuxFrame::decode(&recv_frame(&mut out)).unwrap();
        assert_eq!(
            second,
            MuxFrame::Binary {
                channel: child.id(),
                payload: vec![9]
            }
        );
        let third = MuxFrame::decode(&recv_frame(&mut out)).unwrap();
        assert_eq!(
            third,
            MuxFrame::Text {
                channel: child.id(),
                payload: "hello".into()
            }
        );
    }

    #[test_deadline::tokio_timeout_test]
    async fn grandchild_frames_are_wrapped_in_data() {
        let (root, _events, mut out) = Multiplexer::new();
        let (child, _child_events) = root.open_child(Vec::new()).unwrap();
        settle().await;
        let (grandchild, _gc_events) = child.open_child(Vec::new()).unwrap();
        settle().await;
        let _ = recv_frame(&mut out); // child create
        let _ = recv_frame(&mut out); // grandchild create (wrapped)
        grandchild.send(b"deep".to_vec()).unwrap();

        let outer = MuxFrame::decode(&recv_frame(&mut out)).unwrap();
        let MuxFrame::Nested { channel, frame } = outer else {
            panic!("expected Data wrapper, got {outer:?}");
        };
        assert_eq!(channel, child.id());
        assert_eq!(
            MuxFrame::decode(&frame).unwrap(),
            MuxFrame::Binary {
                channel: grandchild.id(),
                payload: b"deep".to_vec()
            }
        );
    }

    #[test_deadline::tokio_timeout_test]
    async fn peer_announced_channel_fires_event_and_advances_next_id() {
        let (root, mut events, _out) = Multiplexer::new();
        root.feed(
            &MuxFrame::Create {
                channel: 40,
                init: b"FSLS".to_vec(),
            }
            .encode(),
        )
        .unwrap();

        let ChannelEvent::Channel(incoming) = events.try_recv().unwrap() else {
            panic!("expected channel event");
        };
        assert_eq!(incoming.channel.id(), 40);
        assert_eq!(incoming.init, b"FSLS");
        assert_eq!(incoming.channel.ready_state(), ReadyState::Open);

        // Our next allocation must land beyond the announced id.
        let (child, _rx) = root.open_child(Vec::new()).unwrap();
        assert_eq!(child.id(), 41);
    }

    #[test_deadline::tokio_timeout_test]
    async fn inbound_data_routes_to_the_right_channel() {
        let (root, mut events, _out) = Multiplexer::new();
        root.feed(&MuxFrame::Create { channel: 7, init: vec![] }.encode())
            .unwrap();
        let ChannelEvent::Channel(mut incoming) = events.try_recv().unwrap() else {
            panic!("expected channel event");
        };
        root.feed(
            &MuxFrame::Binary {
                channel: 7,
                payload: vec![5, 5],
            }
            .encode(),
        )
        .unwrap();
        assert!(matches!(
            incoming.events.try_recv().unwrap(),
            ChannelEvent::Binary(p) if p == vec![5, 5]
        ));

        // Frames for the root itself travel on id 0.
        root.feed(
            &MuxFrame::Text {
                channel: 0,
                payload: "root".into(),
            }
            .encode(),
        )
        .unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            ChannelEvent::Text(t) if t == "root"
        ));
    }

    #[test_deadline::tokio_timeout_test]
    async fn close_unknown_id_is_silent() {
        let (root, _events, _out) = Multiplexer::new();
        root.feed(
            &MuxFrame::Close {
                channel: 999,
                code: 1000,
                reason: None,
            }
            .encode(),
        )
        .unwrap();
    }

    #[test_deadline::tokio_timeout_test]
    async fn closing_a_parent_closes_descendants() {
        let (root, _events, mut out) = Multiplexer::new();
        let (child, _child_rx) = root.open_child(Vec::new()).unwrap();
        settle().await;
        let (grandchild, mut gc_rx) = child.open_child(Vec::new()).unwrap();
        settle().await;
        let _ = recv_frame(&mut out);
        let _ = recv_frame(&mut out);

        child.close(1000, Some("done")).unwrap();
        settle().await;
        // Grandchild saw Open then Closed.
        assert!(matches!(gc_rx.try_recv().unwrap(), ChannelEvent::Open));
        assert!(matches!(
            gc_rx.try_recv().unwrap(),
            ChannelEvent::Closed { code: 1000, .. }
        ));
        assert_eq!(grandchild.ready_state(), ReadyState::Closed);
        assert!(grandchild.send(vec![1]).is_err());

        let close_frame = MuxFrame::decode(&recv_frame(&mut out)).unwrap();
        assert_eq!(
            close_frame,
            MuxFrame::Close {
                channel: child.id(),
                code: 1000,
                reason: Some("done".into())
            }
        );
    }

    #[test_deadline::tokio_timeout_test]
    async fn writes_after_close_fail_with_invalid_state() {
        let (root, _events, _out) = Multiplexer::new();
        let (child, _rx) = root.open_child(Vec::new()).unwrap();
        settle().await;
        child.close(1000, None).unwrap();
        assert!(matches!(
            child.send(vec![0]),
            Err(GatewayError::InvalidState(_))
        ));
        // Closing again is a no-op.
        child.close(1000, None).unwrap();
    }

    #[test_deadline::tokio_timeout_test]
    async fn root_close_emits_raw_close() {
        let (root, _events, mut out) = Multiplexer::new();
        root.close(1000, Some("bye")).unwrap();
        match out.try_recv().unwrap() {
            RawOut::Close { code, reason } => {
                assert_eq!(code, 1000);
                assert_eq!(reason, "bye");
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert!(root.send(vec![1]).is_err());
    }

    #[test_deadline::tokio_timeout_test]
    async fn writer_round_trip_through_parser() {
        // Whatever the writer produces, feeding it to a second multiplexer
        // recovers the same channel topology and payloads.
        let (left, _left_events, mut left_out) = Multiplexer::new();
        let (right, mut right_events, _right_out) = Multiplexer::new();

        let (child, _child_rx) = left.open_child(b"FSLS".to_vec()).unwrap();
        child.send(b"payload".to_vec()).unwrap();
        settle().await;
        while let Ok(raw) = left_out.try_recv() {
            if let RawOut::Frame(bytes) = raw {
                right.feed(&bytes).unwrap();
            }
        }

        let ChannelEvent::Channel(mut incoming) = right_events.try_recv().unwrap() else {
            panic!("expected announced channel");
        };
        assert_eq!(incoming.channel.id(), child.id());
        assert_eq!(incoming.init, b"FSLS");
        assert!(matches!(
            incoming.events.try_recv().unwrap(),
            ChannelEvent::Binary(p) if p == b"payload".to_vec()
        ));
    }

    #[test_deadline::timeout]
    fn id_allocation_skips_occupied_and_wraps() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut node = Node::new(ReadyState::Open, tx);
        node.next_id = u32::MAX;
        let (tx2, _rx2) = mpsc::unbounded_channel();
        node.children.insert(u32::MAX, Node::new(ReadyState::Open, tx2));
        // u32::MAX occupied; wrap-around skips 0 and lands on 1.
        assert_eq!(allocate_id(&mut node).unwrap(), 1);
        assert_eq!(allocate_id(&mut node).unwrap(), 2);
    }
}
