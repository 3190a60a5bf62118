//! The 36-byte stream configuration blob a browser sends as the first frame
//! on a scrcpy stream.

use crate::buf::Cursor;
use crate::WireError;

pub const STREAM_PARAMS_LEN: usize = 36;
pub const STREAM_PARAMS_MAGIC: u8 = 0x65;

/// Bitrate travels in KiB units to fit the field.
const BITRATE_UNIT: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub bitrate: u32,
    pub max_fps: u8,
    pub i_frame_interval: u8,
    pub width: u16,
    pub height: u16,
    pub send_frame_meta: bool,
    /// `-1` means "not locked"; encoded as `0xFF` on the wire.
    pub locked_video_orientation: i8,
    pub display_id: u32,
}

impl StreamParams {
    pub fn build(&self) -> [u8; STREAM_PARAMS_LEN] {
        let mut out = [0u8; STREAM_PARAMS_LEN];
        out[0] = STREAM_PARAMS_MAGIC;
        out[1..5].copy_from_slice(&(self.bitrate / BITRATE_UNIT).to_le_bytes());
        out[8] = self.max_fps;
        out[9] = self.i_frame_interval;
        out[10..12].copy_from_slice(&self.width.to_be_bytes());
        out[12..14].copy_from_slice(&self.height.to_be_bytes());
        out[22] = u8::from(self.send_frame_meta);
        out[23] = self.locked_video_orientation as u8;
        out[24..28].copy_from_slice(&self.display_id.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != STREAM_PARAMS_LEN {
            return Err(WireError::InvalidData("stream params must be 36 bytes"));
        }
        let mut cur = Cursor::new(bytes);
        if cur.read_u8()? != STREAM_PARAMS_MAGIC {
            return Err(WireError::InvalidData("bad stream params magic"));
        }
        let bitrate = cur.read_u32_le()? * BITRATE_UNIT;
        cur.take(3)?;
        let max_fps = cur.read_u8()?;
        let i_frame_interval = cur.read_u8()?;
        let width = cur.read_u16_be()?;
        let height = cur.read_u16_be()?;
        cur.take(8)?;
        let send_frame_meta = cur.read_u8()? != 0;
        let locked_video_orientation = cur.read_i8()?;
        let display_id = cur.read_u32_le()?;
        Ok(Self {
            bitrate,
            max_fps,
            i_frame_interval,
            width,
            height,
            send_frame_meta,
            locked_video_orientation,
            display_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::timeout]
    fn known_wire_image() {
        let params = StreamParams {
            bitrate: 8_388_608,
            max_fps: 25,
            i_frame_interval: 5,
            width: 500,
            height: 500,
            send_frame_meta: false,
            locked_video_orientation: -1,
            display_id: 0,
        };
        let wire = params.build();
        assert_eq!(
            &wire[..14],
            &[0x65, 0x00, 0x20, 0x00, 0x00, 0, 0, 0, 0x19, 0x05, 0x01, 0xF4, 0x01, 0xF4]
        );
        assert_eq!(wire[23], 0xFF);
        assert_eq!(StreamParams::parse(&wire).unwrap(), params);
    }

    #[test_deadline::timeout]
    fn round_trip_law() {
        let cases = [
            StreamParams {
                bitrate: 2_097_152,
                max_fps: 60,
                i_frame_interval: 10,
                width: 1080,
                height: 2340,
                send_frame_meta: true,
                locked_video_orientation: 0,
                display_id: 2,
            },
            StreamParams {
                bitrate: 524_288,
                max_fps: 15,
                i_frame_interval: 1,
                width: 320,
                height: 240,
                send_frame_meta: false,
                locked_video_orientation: 3,
                display_id: 0,
            },
        ];
        for params in cases {
            assert_eq!(StreamParams::parse(&params.build()).unwrap(), params);
        }
    }

    #[test_deadline::timeout]
    fn rejects_bad_length_and_magic() {
        assert!(StreamParams::parse(&[0u8; 35]).is_err());
        let mut wire = [0u8; 36];
        wire[0] = 0x66;
        assert!(StreamParams::parse(&wire).is_err());
    }
}
