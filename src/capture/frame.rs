use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use v4l::FourCC;

/// Pixel and compressed formats moving through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Motion JPEG from USB cameras, also the JPEG encoder output
    Mjpeg,
    /// Packed 4:2:2
    Yuyv,
    /// Semi-planar 4:2:0, the usual ISP and decoder output
    Nv12,
    /// Planar 4:2:0
    Yuv420,
    /// H264 Annex-B access units
    H264,
}

impl PixelFormat {
    pub fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Nv12 => FourCC::new(b"NV12"),
            PixelFormat::Yuv420 => FourCC::new(b"YU12"),
            PixelFormat::H264 => FourCC::new(b"H264"),
        }
    }

    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YU12" => Some(PixelFormat::Yuv420),
            b"H264" => Some(PixelFormat::H264),
            _ => None,
        }
    }

    /// Compressed formats carry a variable number of bytes per frame
    pub fn is_compressed(self) -> bool {
        matches!(self, PixelFormat::Mjpeg | PixelFormat::H264)
    }

    /// Bytes needed for one frame of a raw format with the given line stride
    pub fn frame_size(self, width: u32, height: u32, stride: u32) -> usize {
        let (w, h, s) = (width as usize, height as usize, stride.max(width) as usize);
        match self {
            PixelFormat::Yuyv => s.max(w * 2) * h,
            PixelFormat::Nv12 | PixelFormat::Yuv420 => s * h * 3 / 2,
            // Worst case for compressed data
            PixelFormat::Mjpeg | PixelFormat::H264 => w * h * 3 / 2,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::H264 => "H264",
        };
        f.write_str(name)
    }
}

/// Format actually agreed with the driver after `start()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    /// Bytes per line of the first plane
    pub stride: u32,
    pub format: PixelFormat,
    /// Bytes per buffer as reported by the driver
    pub frame_size: usize,
    pub fps: u32,
}

/// One filled capture slot held by the application.
///
/// This is an ownership token: the bytes stay in the source's buffer pool and
/// are read through [`CaptureSource::data`](super::CaptureSource::data). The
/// token must be handed back with
/// [`CaptureSource::release`](super::CaptureSource::release) exactly once.
#[must_use = "capture buffers must be released back to their source"]
#[derive(Debug)]
pub struct CaptureBuffer {
    pub(crate) index: usize,
    pub bytes_used: usize,
    pub format: PixelFormat,
    /// Per-source sequence, counting dropped frames too
    pub sequence: u64,
    /// Driver timestamp (monotonic clock)
    pub timestamp: Duration,
    pub captured_at: Instant,
}

impl CaptureBuffer {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp.as_micros() as u64
    }
}
