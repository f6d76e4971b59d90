//! Finished frames as they leave the codec stage

use std::fmt;

use bytes::Bytes;

/// The three representations consumers can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    /// One JPEG per connection
    Snapshot,
    /// Continuous JPEG frames
    Mjpeg,
    /// Continuous H264 access units
    H264,
}

impl StreamType {
    pub const ALL: [StreamType; 3] = [StreamType::Snapshot, StreamType::Mjpeg, StreamType::H264];

    /// Wire tag
    pub fn as_u8(self) -> u8 {
        match self {
            StreamType::Snapshot => 0,
            StreamType::Mjpeg => 1,
            StreamType::H264 => 2,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(StreamType::Snapshot),
            1 => Some(StreamType::Mjpeg),
            2 => Some(StreamType::H264),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self.as_u8() as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamType::Snapshot => "snapshot",
            StreamType::Mjpeg => "mjpeg",
            StreamType::H264 => "h264",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame flags as carried on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub const KEYFRAME: u8 = 0b0000_0001;

    pub fn keyframe() -> Self {
        Self(Self::KEYFRAME)
    }

    pub fn is_keyframe(&self) -> bool {
        self.0 & Self::KEYFRAME != 0
    }
}

/// One completed frame; immutable once published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub stream: StreamType,
    pub payload: Bytes,
    /// Presentation timestamp in microseconds
    pub pts_us: u64,
    pub flags: FrameFlags,
    /// Strictly increasing per stream type
    pub sequence: u64,
}

impl EncodedFrame {
    pub fn new(stream: StreamType, payload: Bytes, pts_us: u64, key_frame: bool, sequence: u64) -> Self {
        // Only H264 distinguishes key frames; every JPEG stands alone
        let key_frame = key_frame || stream != StreamType::H264;
        Self {
            stream,
            payload,
            pts_us,
            flags: if key_frame {
                FrameFlags::keyframe()
            } else {
                FrameFlags::default()
            },
            sequence,
        }
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.is_keyframe()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Hands out per-stream sequence numbers starting at 1
#[derive(Debug, Default)]
pub struct Sequencer {
    next: [u64; 3],
}

impl Sequencer {
    pub fn next(&mut self, stream: StreamType) -> u64 {
        let slot = &mut self.next[stream.index()];
        *slot += 1;
        *slot
    }

    /// Build a frame with the next sequence number for `stream`
    pub fn frame(&mut self, stream: StreamType, payload: Bytes, pts_us: u64, key_frame: bool) -> EncodedFrame {
        let sequence = self.next(stream);
        EncodedFrame::new(stream, payload, pts_us, key_frame, sequence)
    }
}
