//! Message framing on the stream sockets.
//!
//! ```text
//! offset  size  field
//!      0     4  payload length, u32 LE
//!      4     8  presentation timestamp in microseconds, u64 LE
//!     12     1  stream tag (0 snapshot, 1 MJPEG, 2 H264)
//!     13     1  flags (bit 0 key frame)
//!     14     n  payload
//! ```

use bytes::{Buf, BufMut};

use crate::frame::{EncodedFrame, FrameFlags, StreamType};

pub const HEADER_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub len: u32,
    pub pts_us: u64,
    pub stream: StreamType,
    pub flags: FrameFlags,
}

impl Header {
    pub fn for_frame(frame: &EncodedFrame) -> Self {
        Self {
            len: frame.payload.len() as u32,
            pts_us: frame.pts_us,
            stream: frame.stream,
            flags: frame.flags,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.len);
        buf.put_u64_le(self.pts_us);
        buf.put_u8(self.stream.as_u8());
        buf.put_u8(self.flags.0);
        out
    }

    /// `None` when `bytes` is short or carries an unknown stream tag
    pub fn decode(mut bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let len = bytes.get_u32_le();
        let pts_us = bytes.get_u64_le();
        let stream = StreamType::from_u8(bytes.get_u8())?;
        let flags = FrameFlags(bytes.get_u8());
        Some(Self {
            len,
            pts_us,
            stream,
            flags,
        })
    }
}
