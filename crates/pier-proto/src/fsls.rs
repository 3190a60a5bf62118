//! File-sync channel framing.
//!
//! An `FSLS` session is a multiplexer channel whose init blob names the
//! device serial. Each file operation is a grandchild channel whose init
//! blob starts with a 4-byte ASCII opcode. Server responses reuse the ADB
//! sync protocol's 4-byte ids (`DENT`, `STAT`, `DATA`, `DONE`, `FAIL`) so a
//! reader can tell frames apart without out-of-band state.

use crate::buf::{self, Cursor};
use crate::WireError;

pub const CHANNEL_TAG: &[u8; 4] = b"FSLS";

pub const OP_LIST: &[u8; 4] = b"LIST";
pub const OP_STAT: &[u8; 4] = b"STAT";
pub const OP_RECV: &[u8; 4] = b"RECV";
pub const OP_SEND: &[u8; 4] = b"SEND";

const ID_DENT: &[u8; 4] = b"DENT";
const ID_STAT: &[u8; 4] = b"STAT";
const ID_DATA: &[u8; 4] = b"DATA";
const ID_DONE: &[u8; 4] = b"DONE";
const ID_FAIL: &[u8; 4] = b"FAIL";

/// POSIX file-type test: directory bit within the `S_IFMT` mask.
pub fn is_dir(mode: u32) -> bool {
    (mode & 0o170000) == 0o040000
}

/// Init blob for the FSLS parent channel: `"FSLS" | u32-LE len | serial`.
pub fn build_channel_init(serial: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + serial.len());
    out.extend_from_slice(CHANNEL_TAG);
    buf::write_u32_le(&mut out, serial.len() as u32);
    out.extend_from_slice(serial.as_bytes());
    out
}

pub fn parse_channel_init(init: &[u8]) -> Result<String, WireError> {
    let mut cur = Cursor::new(init);
    if cur.take(4)? != CHANNEL_TAG {
        return Err(WireError::InvalidData("not an FSLS init blob"));
    }
    let len = cur.read_u32_le()? as usize;
    buf::decode_utf8(cur.take(len)?)
}

/// A file operation, as carried in a grandchild channel's init blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    List { path: String },
    Stat { path: String },
    Recv { path: String },
    Send,
}

impl FileOp {
    pub fn encode(&self) -> Vec<u8> {
        fn with_path(op: &[u8; 4], path: &str) -> Vec<u8> {
            let mut out = Vec::with_capacity(8 + path.len());
            out.extend_from_slice(op);
            buf::write_u32_le(&mut out, path.len() as u32);
            out.extend_from_slice(path.as_bytes());
            out
        }
        match self {
            FileOp::List { path } => with_path(OP_LIST, path),
            FileOp::Stat { path } => with_path(OP_STAT, path),
            FileOp::Recv { path } => with_path(OP_RECV, path),
            FileOp::Send => OP_SEND.to_vec(),
        }
    }

    pub fn decode(init: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(init);
        let op: [u8; 4] = cur.take(4)?.try_into().expect("4-byte slice");
        let mut path = || -> Result<String, WireError> {
            let len = cur.read_u32_le()? as usize;
            buf::decode_utf8(cur.take(len)?)
        };
        match &op {
            OP_LIST => Ok(FileOp::List { path: path()? }),
            OP_STAT => Ok(FileOp::Stat { path: path()? }),
            OP_RECV => Ok(FileOp::Recv { path: path()? }),
            OP_SEND => Ok(FileOp::Send),
            _ => Err(WireError::InvalidData("unknown file op")),
        }
    }
}

/// One directory entry streamed in response to `LIST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub mode: u32,
    pub size: u32,
    pub mtime_s: u32,
    pub name: String,
}

/// Server-to-client frames on a file-operation channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileFrame {
    Dent(DirEntry),
    Stat { mode: u32, size: u32, mtime_s: u32 },
    Data(Vec<u8>),
    Done,
    Fail(String),
}

impl FileFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            FileFrame::Dent(entry) => {
                out.extend_from_slice(ID_DENT);
                buf::write_u32_le(&mut out, entry.mode);
                buf::write_u32_le(&mut out, entry.size);
                buf::write_u32_le(&mut out, entry.mtime_s);
                buf::write_u32_le(&mut out, entry.name.len() as u32);
                out.extend_from_slice(entry.name.as_bytes());
            }
            FileFrame::Stat {
                mode,
                size,
                mtime_s,
            } => {
                out.extend_from_slice(ID_STAT);
                buf::write_u32_le(&mut out, *mode);
                buf::write_u32_le(&mut out, *size);
                buf::write_u32_le(&mut out, *mtime_s);
            }
            FileFrame::Data(chunk) => {
                out.extend_from_slice(ID_DATA);
                out.extend_from_slice(chunk);
            }
            FileFrame::Done => out.extend_from_slice(ID_DONE),
            FileFrame::Fail(message) => {
                out.extend_from_slice(ID_FAIL);
                buf::write_u32_le(&mut out, message.len() as u32);
                out.extend_from_slice(message.as_bytes());
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(bytes);
        let id: [u8; 4] = cur.take(4)?.try_into().expect("4-byte slice");
        match &id {
            ID_DENT => {
                let mode = cur.read_u32_le()?;
                let size = cur.read_u32_le()?;
                let mtime_s = cur.read_u32_le()?;
                let len = cur.read_u32_le()? as usize;
                let name = buf::decode_utf8(cur.take(len)?)?;
                Ok(FileFrame::Dent(DirEntry {
                    mode,
                    size,
                    mtime_s,
                    name,
                }))
            }
            ID_STAT => Ok(FileFrame::Stat {
                mode: cur.read_u32_le()?,
                size: cur.read_u32_le()?,
                mtime_s: cur.read_u32_le()?,
            }),
            ID_DATA => Ok(FileFrame::Data(cur.rest().to_vec())),
            ID_DONE => Ok(FileFrame::Done),
            ID_FAIL => {
                let len = cur.read_u32_le()? as usize;
                Ok(FileFrame::Fail(buf::decode_utf8(cur.take(len)?)?))
            }
            _ => Err(WireError::InvalidData("unknown file frame")),
        }
    }
}

// ---------------------------------------------------------------------------
// Push sub-protocol, spoken over an opened SEND channel.

pub const PUSH_TYPE: u8 = 102;

pub const PUSH_NEW: i8 = 0;
pub const PUSH_START: i8 = 1;
pub const PUSH_APPEND: i8 = 2;
pub const PUSH_FINISH: i8 = 3;
pub const PUSH_CANCEL: i8 = 4;

/// Ack status: the requested step completed.
pub const ACK_OK: i8 = 0;
/// Ack status for `NEW`: a transfer id was allocated; the client must use the
/// returned id for the rest of the transfer.
pub const ACK_NEW_ID: i8 = 1;
/// Ack status: the step failed and the transfer is dead.
pub const ACK_ERROR: i8 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushCommand {
    New,
    Start { size: i32, name: String },
    Append(Vec<u8>),
    Finish,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    pub id: i16,
    pub command: PushCommand,
}

impl PushRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(PUSH_TYPE);
        buf::write_i16_be(&mut out, self.id);
        match &self.command {
            PushCommand::New => buf::write_i8(&mut out, PUSH_NEW),
            PushCommand::Start { size, name } => {
                buf::write_i8(&mut out, PUSH_START);
                buf::write_i32_be(&mut out, *size);
                buf::write_u16_be(&mut out, name.len() as u16);
                out.extend_from_slice(name.as_bytes());
            }
            PushCommand::Append(data) => {
                buf::write_i8(&mut out, PUSH_APPEND);
                buf::write_i32_be(&mut out, data.len() as i32);
                out.extend_from_slice(data);
            }
            PushCommand::Finish => buf::write_i8(&mut out, PUSH_FINISH),
            PushCommand::Cancel => buf::write_i8(&mut out, PUSH_CANCEL),
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(bytes);
        if cur.read_u8()? != PUSH_TYPE {
            return Err(WireError::InvalidData("not a push frame"));
        }
        let id = cur.read_i16_be()?;
        let command = match cur.read_i8()? {
            PUSH_NEW => PushCommand::New,
            PUSH_START => {
                let size = cur.read_i32_be()?;
                let len = cur.read_u16_be()? as usize;
                PushCommand::Start {
                    size,
                    name: buf::decode_utf8(cur.take(len)?)?,
                }
            }
            PUSH_APPEND => {
                let len = cur.read_i32_be()?;
                if len < 0 {
                    return Err(WireError::InvalidData("negative append length"));
                }
                PushCommand::Append(cur.take(len as usize)?.to_vec())
            }
            PUSH_FINISH => PushCommand::Finish,
            PUSH_CANCEL => PushCommand::Cancel,
            _ => return Err(WireError::InvalidData("unknown push state")),
        };
        Ok(Self { id, command })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushAck {
    pub id: i16,
    pub status: i8,
}

impl PushAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3);
        buf::write_i16_be(&mut out, self.id);
        buf::write_i8(&mut out, self.status);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(bytes);
        Ok(Self {
            id: cur.read_i16_be()?,
            status: cur.read_i8()?,
        })
    }
}
