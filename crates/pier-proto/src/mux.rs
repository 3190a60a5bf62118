//! Outer frame format of the channel multiplexer.
//!
//! Every frame on the raw WebSocket is `[type: u8][channel_id: u32-LE]`
//! followed by a type-specific payload. `Data` frames carry a complete
//! nested frame, which is how a channel hosts its own children.

use crate::buf::{self, Cursor};
use crate::WireError;

pub const CREATE_CHANNEL: u8 = 4;
pub const CLOSE_CHANNEL: u8 = 8;
pub const RAW_BINARY_DATA: u8 = 16;
pub const RAW_STRING_DATA: u8 = 32;
pub const DATA: u8 = 64;

/// Default close code when a `CloseChannel` arrives with an empty payload.
pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxFrame {
    /// `channel` is the *new* child's id; `init` tells the peer what the
    /// child is for.
    Create { channel: u32, init: Vec<u8> },
    Close {
        channel: u32,
        code: u16,
        reason: Option<String>,
    },
    Binary { channel: u32, payload: Vec<u8> },
    Text { channel: u32, payload: String },
    /// A nested frame addressed inside `channel`'s own id space. Kept as raw
    /// bytes so dispatch can recurse one level at a time.
    Nested { channel: u32, frame: Vec<u8> },
}

impl MuxFrame {
    pub fn channel(&self) -> u32 {
        match self {
            MuxFrame::Create { channel, .. }
            | MuxFrame::Close { channel, .. }
            | MuxFrame::Binary { channel, .. }
            | MuxFrame::Text { channel, .. }
            | MuxFrame::Nested { channel, .. } => *channel,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (kind, channel) = match self {
            MuxFrame::Create { channel, .. } => (CREATE_CHANNEL, *channel),
            MuxFrame::Close { channel, .. } => (CLOSE_CHANNEL, *channel),
            MuxFrame::Binary { channel, .. } => (RAW_BINARY_DATA, *channel),
            MuxFrame::Text { channel, .. } => (RAW_STRING_DATA, *channel),
            MuxFrame::Nested { channel, .. } => (DATA, *channel),
        };
        let mut out = Vec::with_capacity(5);
        out.push(kind);
        buf::write_u32_le(&mut out, channel);
        match self {
            MuxFrame::Create { init, .. } => out.extend_from_slice(init),
            MuxFrame::Close { code, reason, .. } => {
                buf::write_u16_le(&mut out, *code);
                let reason = reason.as_deref().unwrap_or("");
                buf::write_u32_le(&mut out, reason.len() as u32);
                out.extend_from_slice(reason.as_bytes());
            }
            MuxFrame::Binary { payload, .. } => out.extend_from_slice(payload),
            MuxFrame::Text { payload, .. } => out.extend_from_slice(payload.as_bytes()),
            MuxFrame::Nested { frame, .. } => out.extend_from_slice(frame),
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(bytes);
        let kind = cur.read_u8()?;
        let channel = cur.read_u32_le()?;
        match kind {
            CREATE_CHANNEL => Ok(MuxFrame::Create {
                channel,
                init: cur.rest().to_vec(),
            }),
            CLOSE_CHANNEL => {
                if cur.remaining() == 0 {
                    return Ok(MuxFrame::Close {
                        channel,
                        code: CLOSE_NORMAL,
                        reason: None,
                    });
                }
                let code = cur.read_u16_le()?;
                let reason = if cur.remaining() >= 4 {
                    let len = cur.read_u32_le()? as usize;
                    let raw = cur.take(len)?;
                    if raw.is_empty() {
                        None
                    } else {
                        Some(buf::decode_utf8(raw)?)
                    }
                } else {
                    None
                };
                Ok(MuxFrame::Close {
                    channel,
                    code,
                    reason,
                })
            }
            RAW_BINARY_DATA => Ok(MuxFrame::Binary {
                channel,
                payload: cur.rest().to_vec(),
            }),
            RAW_STRING_DATA => Ok(MuxFrame::Text {
                channel,
                payload: buf::decode_utf8(cur.rest())?,
            }),
            DATA => Ok(MuxFrame::Nested {
                channel,
                frame: cur.rest().to_vec(),
            }),
            other => Err(WireError::UnknownFrameType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::timeout]
    fn every_frame_kind_round_trips() {
        let frames = vec![
            MuxFrame::Create {
                channel: 1,
                init: b"FSLS\x03\x00\x00\x00abc".to_vec(),
            },
            MuxFrame::Close {
                channel: 7,
                code: 4003,
                reason: Some("bad parameters".into()),
            },
            MuxFrame::Close {
                channel: 8,
                code: 1000,
                reason: None,
            },
            MuxFrame::Binary {
                channel: 0,
                payload: vec![0, 1, 2, 255],
            },
            MuxFrame::Text {
                channel: 3,
                payload: "ping".into(),
            },
            MuxFrame::Nested {
                channel: 2,
                frame: MuxFrame::Binary {
                    channel: 5,
                    payload: b"deep".to_vec(),
                }
                .encode(),
            },
        ];
        for frame in frames {
            let wire = frame.encode();
            assert_eq!(MuxFrame::decode(&wire).unwrap(), frame, "{frame:?}");
        }
    }

    #[test_deadline::timeout]
    fn header_layout_is_type_then_le_id() {
        let wire = MuxFrame::Binary {
            channel: 0x0102_0304,
            payload: vec![9],
        }
        .encode();
        assert_eq!(wire, vec![RAW_BINARY_DATA, 0x04, 0x03, 0x02, 0x01, 9]);
    }

    #[test_deadline::timeout]
    fn close_without_payload_defaults_to_normal() {
        let wire = vec![CLOSE_CHANNEL, 1, 0, 0, 0];
        assert_eq!(
            MuxFrame::decode(&wire).unwrap(),
            MuxFrame::Close {
                channel: 1,
                code: CLOSE_NORMAL,
                reason: None
            }
        );
    }

    #[test_deadline::timeout]
    fn nested_frames_recurse() {
        let inner = MuxFrame::Text {
            channel: 9,
            payload: "hi".into(),
        };
        let outer = MuxFrame::Nested {
            channel: 4,
            frame: inner.encode(),
        };
        let MuxFrame::Nested { frame, .. } = MuxFrame::decode(&outer.encode()).unwrap() else {
            panic!("expected nested frame");
        };
        assert_eq!(MuxFrame::decode(&frame).unwrap(), inner);
    }

    #[test_deadline::timeout]
    fn unknown_type_rejected() {
        assert_eq!(
            MuxFrame::decode(&[3, 0, 0, 0, 0]),
            Err(WireError::UnknownFrameType(3))
        );
        assert_eq!(MuxFrame::decode(&[16, 0, 0]), Err(WireError::UnexpectedEof));
    }
}
