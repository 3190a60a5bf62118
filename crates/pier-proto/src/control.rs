//! Typed scrcpy control messages.
//!
//! These are the upstream-bound injection messages a browser produces. All
//! multi-byte integers are big-endian on the wire. The gateway itself treats
//! them as opaque bytes; the typed forms exist for the replay tooling and for
//! tests that assert exact wire layouts.

use crate::buf::{self, Cursor};
use crate::WireError;

pub const TYPE_KEY: u8 = 0;
pub const TYPE_TEXT: u8 = 1;
pub const TYPE_TOUCH: u8 = 2;
pub const TYPE_SCROLL: u8 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// `[type=0][action][keycode][repeat][meta]`
    Key {
        action: u8,
        keycode: u32,
        repeat: u32,
        meta: u32,
    },
    /// `[type=1][utf-8 bytes][0x00]`
    Text(String),
    /// `[type=2][action][pointer_id: u64][x][y][screen_w][screen_h][pressure][buttons]`
    Touch {
        action: u8,
        pointer_id: u64,
        x: u32,
        y: u32,
        screen_width: u16,
        screen_height: u16,
        /// Fixed-point on the wire: `round(pressure * 65535)`.
        pressure: f32,
        buttons: u32,
    },
    /// `[type=3][x][y][w][h][h_scroll][v_scroll]`
    Scroll {
        x: u32,
        y: u32,
        width: u16,
        height: u16,
        h_scroll: i32,
        v_scroll: i32,
    },
}

impl ControlMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlMessage::Key {
                action,
                keycode,
                repeat,
                meta,
            } => {
                let mut out = Vec::with_capacity(14);
                out.push(TYPE_KEY);
                out.push(*action);
                buf::write_u32_be(&mut out, *keycode);
                buf::write_u32_be(&mut out, *repeat);
                buf::write_u32_be(&mut out, *meta);
                out
            }
            ControlMessage::Text(text) => {
                let mut out = Vec::with_capacity(text.len() + 2);
                out.push(TYPE_TEXT);
                out.extend_from_slice(text.as_bytes());
                out.push(0);
                out
            }
            ControlMessage::Touch {
                action,
                pointer_id,
                x,
                y,
                screen_width,
                screen_height,
                pressure,
                buttons,
            } => {
                let mut out = Vec::with_capacity(28);
                out.push(TYPE_TOUCH);
                out.push(*action);
                out.extend_from_slice(&pointer_id.to_be_bytes());
                buf::write_u32_be(&mut out, *x);
                buf::write_u32_be(&mut out, *y);
                buf::write_u16_be(&mut out, *screen_width);
                buf::write_u16_be(&mut out, *screen_height);
                let fixed = (pressure.clamp(0.0, 1.0) * 65535.0).round() as u16;
                buf::write_u16_be(&mut out, fixed);
                buf::write_u32_be(&mut out, *buttons);
                out
            }
            ControlMessage::Scroll {
                x,
                y,
                width,
                height,
                h_scroll,
                v_scroll,
            } => {
                let mut out = Vec::with_capacity(21);
                out.push(TYPE_SCROLL);
                buf::write_u32_be(&mut out, *x);
                buf::write_u32_be(&mut out, *y);
                buf::write_u16_be(&mut out, *width);
                buf::write_u16_be(&mut out, *height);
                buf::write_i32_be(&mut out, *h_scroll);
                buf::write_i32_be(&mut out, *v_scroll);
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(bytes);
        match cur.read_u8()? {
            TYPE_KEY => Ok(ControlMessage::Key {
                action: cur.read_u8()?,
                keycode: cur.read_u32_be()?,
                repeat: cur.read_u32_be()?,
                meta: cur.read_u32_be()?,
            }),
            TYPE_TEXT => {
                let body = cur.rest();
                let text = match body.split_last() {
                    Some((0, utf8)) => buf::decode_utf8(utf8)?,
                    _ => return Err(WireError::InvalidData("text message missing terminator")),
                };
                Ok(ControlMessage::Text(text))
            }
            TYPE_TOUCH => {
                let action = cur.read_u8()?;
                let hi = cur.read_u32_be()?;
                let lo = cur.read_u32_be()?;
                let x = cur.read_u32_be()?;
                let y = cur.read_u32_be()?;
                let screen_width = cur.read_u16_be()?;
                let screen_height = cur.read_u16_be()?;
                let pressure = f32::from(cur.read_u16_be()?) / 65535.0;
                let buttons = cur.read_u32_be()?;
                Ok(ControlMessage::Touch {
                    action,
                    pointer_id: (u64::from(hi) << 32) | u64::from(lo),
                    x,
                    y,
                    screen_width,
                    screen_height,
                    pressure,
                    buttons,
                })
            }
            TYPE_SCROLL => Ok(ControlMessage::Scroll {
                x: cur.read_u32_be()?,
                y: cur.read_u32_be()?,
                width: cur.read_u16_be()?,
                height: cur.read_u16_be()?,
                h_scroll: cur.read_i32_be()?,
                v_scroll: cur.read_i32_be()?,
            }),
            other => Err(WireError::UnknownFrameType(other)),
        }
    }
}
