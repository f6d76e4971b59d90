pub mod frame;
pub mod pool;
pub mod synthetic;
pub mod v4l2;

use std::os::fd::BorrowedFd;
use std::time::Duration;

pub use frame::{CaptureBuffer, NegotiatedFormat, PixelFormat};
pub use pool::BufferPool;
pub use synthetic::SyntheticCapture;
pub use v4l2::V4l2Capture;

use crate::error::Result;
use crate::CaptureConfig;

/// Device paths with this prefix select the built-in test pattern source
pub const SYNTHETIC_PREFIX: &str = "synthetic://";

/// Frame counters kept by every source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    /// Frames the driver dropped before we dequeued
    pub skipped: u64,
    pub timeouts: u64,
    pub held: usize,
}

/// A camera: a fixed pool of buffers cycling between driver and application.
///
/// Every buffer returned by [`next_frame`](Self::next_frame) has to come back
/// through [`release`](Self::release). The source refuses to hand out the
/// last free buffer so the driver always has one to fill.
pub trait CaptureSource: Send {
    /// Start streaming and report the format the driver agreed to
    fn start(&mut self) -> Result<NegotiatedFormat>;

    fn format(&self) -> NegotiatedFormat;

    /// Block until a filled buffer is available or `timeout` elapses
    fn next_frame(&mut self, timeout: Duration) -> Result<CaptureBuffer>;

    /// Bytes of a held buffer
    fn data(&self, buffer: &CaptureBuffer) -> &[u8];

    /// DMA-BUF handle of a held buffer, when exported
    fn dmabuf(&self, _buffer: &CaptureBuffer) -> Option<BorrowedFd<'_>> {
        None
    }

    /// Whether held buffers carry a DMA-BUF; known after `start`
    fn exports_dmabuf(&self) -> bool {
        false
    }

    fn release(&mut self, buffer: CaptureBuffer) -> Result<()>;

    /// Stop streaming, reclaiming buffers still held downstream
    fn stop(&mut self) -> Result<()>;

    fn stats(&self) -> CaptureStats;
}

/// Open the source named by `config.device`
pub fn open(config: &CaptureConfig) -> Result<Box<dyn CaptureSource>> {
    if config.device.starts_with(SYNTHETIC_PREFIX) {
        Ok(Box::new(SyntheticCapture::new(config.clone())?))
    } else {
        Ok(Box::new(V4l2Capture::open(config.clone())?))
    }
}
