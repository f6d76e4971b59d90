//! Test pattern source with the same buffer discipline as a real camera

use std::thread;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::{debug, info};

use crate::capture::frame::{CaptureBuffer, NegotiatedFormat, PixelFormat};
use crate::capture::pool::BufferPool;
use crate::capture::{CaptureSource, CaptureStats};
use crate::error::{Error, Result};
use crate::CaptureConfig;

const BAR_WIDTH: u32 = 32;

/// Moving colour bars, paced at the configured frame rate
pub struct SyntheticCapture {
    config: CaptureConfig,
    format: NegotiatedFormat,
    slots: Vec<Vec<u8>>,
    pool: BufferPool,
    running: bool,
    interval: Duration,
    epoch: Instant,
    next_due: Instant,
    sequence: u64,
    stats: CaptureStats,
    fault_after: Option<u64>,
}

impl SyntheticCapture {
    pub fn new(config: CaptureConfig) -> Result<Self> {
        if config.format == PixelFormat::H264 {
            return Err(Error::UnsupportedFormat(
                "synthetic source cannot produce H264".into(),
            ));
        }
        let stride = match config.format {
            PixelFormat::Yuyv => config.width * 2,
            _ => config.width,
        };
        let format = NegotiatedFormat {
            width: config.width,
            height: config.height,
            stride,
            format: config.format,
            frame_size: config.format.frame_size(config.width, config.height, stride),
            fps: config.fps.max(1),
        };
        info!(
            "Synthetic capture {}x{} {} @ {} fps",
            format.width, format.height, format.format, format.fps
        );

        let now = Instant::now();
        Ok(Self {
            pool: BufferPool::new(config.buffer_count as usize),
            interval: Duration::from_secs(1) / format.fps,
            config,
            format,
            slots: Vec::new(),
            running: false,
            epoch: now,
            next_due: now,
            sequence: 0,
            stats: CaptureStats::default(),
            fault_after: None,
        })
    }

    /// Fail `next_frame` once with a streaming fault after `frames` frames
    pub fn with_stream_fault_after(mut self, frames: u64) -> Self {
        self.fault_after = Some(frames);
        self
    }

    fn render(&mut self, index: usize) -> Result<usize> {
        let NegotiatedFormat { width, height, .. } = self.format;
        let offset = (self.sequence as u32).wrapping_mul(4);
        let slot = &mut self.slots[index];
        slot.clear();

        match self.format.format {
            PixelFormat::Mjpeg => {
                let mut rgb = Vec::with_capacity((width * height * 3) as usize);
                for _y in 0..height {
                    for x in 0..width {
                        rgb.extend_from_slice(&bar_rgb(x + offset));
                    }
                }
                JpegEncoder::new_with_quality(&mut *slot, 75)
                    .encode(&rgb, width, height, ExtendedColorType::Rgb8)
                    .map_err(|e| Error::Stream(format!("test pattern: {}", e)))?;
            }
            PixelFormat::Nv12 | PixelFormat::Yuv420 => {
                for _y in 0..height {
                    for x in 0..width {
                        slot.push(bar_luma(x + offset));
                    }
                }
                // Neutral chroma; the layout differs but the size does not
                slot.resize(self.format.frame_size, 128);
            }
            PixelFormat::Yuyv => {
                for _y in 0..height {
                    for x in (0..width).step_by(2) {
                        let luma = bar_luma(x + offset);
                        slot.extend_from_slice(&[luma, 128, luma, 128]);
                    }
                }
            }
            PixelFormat::H264 => {
                return Err(Error::UnsupportedFormat("H264 test pattern".into()));
            }
        }
        Ok(slot.len())
    }
}

fn bar_luma(x: u32) -> u8 {
    ((x / BAR_WIDTH) % 8 * 32) as u8
}

fn bar_rgb(x: u32) -> [u8; 3] {
    let bar = (x / BAR_WIDTH) % 8;
    let on = |bit: u32| if bar & bit != 0 { 0xc0 } else { 0x10 };
    [on(4), on(2), on(1)]
}

impl CaptureSource for SyntheticCapture {
    fn start(&mut self) -> Result<NegotiatedFormat> {
        if self.running {
            return Ok(self.format);
        }
        let count = self.config.buffer_count as usize;
        self.slots = vec![Vec::with_capacity(self.format.frame_size); count];
        self.pool = BufferPool::new(count);
        self.next_due = Instant::now();
        self.running = true;
        debug!(buffers = count, "Synthetic stream started");
        Ok(self.format)
    }

    fn format(&self) -> NegotiatedFormat {
        self.format
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<CaptureBuffer> {
        if !self.running {
            return Err(Error::Stream("capture not started".into()));
        }
        self.pool.ensure_available()?;

        if self.fault_after.is_some_and(|n| self.stats.frames >= n) {
            self.fault_after = None;
            return Err(Error::Stream("synthetic stream fault".into()));
        }

        let now = Instant::now();
        if self.next_due > now {
            let wait = self.next_due - now;
            if wait > timeout {
                thread::sleep(timeout);
                self.stats.timeouts += 1;
                return Err(Error::Timeout(timeout));
            }
            thread::sleep(wait);
        }
        // Don't burst to catch up after a stall
        self.next_due = (self.next_due + self.interval).max(Instant::now());

        let index = self
            .pool
            .first_queued()
            .ok_or(Error::PoolExhausted {
                held: self.pool.held(),
                capacity: self.pool.capacity(),
            })?;
        self.sequence += 1;
        let bytes_used = self.render(index)?;
        self.pool.checkout(index)?;
        self.stats.frames += 1;
        self.stats.held = self.pool.held();

        let captured_at = Instant::now();
        Ok(CaptureBuffer {
            index,
            bytes_used,
            format: self.format.format,
            sequence: self.sequence,
            timestamp: captured_at - self.epoch,
            captured_at,
        })
    }

    fn data(&self, buffer: &CaptureBuffer) -> &[u8] {
        match self.slots.get(buffer.index) {
            Some(slot) => &slot[..buffer.bytes_used.min(slot.len())],
            None => &[],
        }
    }

    fn release(&mut self, buffer: CaptureBuffer) -> Result<()> {
        self.pool.checkin(buffer.index)?;
        self.stats.held = self.pool.held();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let outstanding = self.pool.reclaim_all();
        if outstanding > 0 {
            debug!(outstanding, "Reclaimed held synthetic buffers");
        }
        self.stats.held = 0;
        self.running = false;
        Ok(())
    }

    fn stats(&self) -> CaptureStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(format: PixelFormat, buffers: u32) -> CaptureConfig {
        CaptureConfig {
            device: "synthetic://".into(),
            width: 64,
            height: 48,
            fps: 500,
            format,
            buffer_count: buffers,
            ..Default::default()
        }
    }

    #[test]
    fn mjpeg_frames_are_complete_jpegs() {
        let mut cam = SyntheticCapture::new(config(PixelFormat::Mjpeg, 4)).unwrap();
        cam.start().unwrap();
        let buf = cam.next_frame(Duration::from_secs(1)).unwrap();
        let data = cam.data(&buf);
        assert_eq!(&data[..2], &[0xff, 0xd8]);
        assert_eq!(&data[data.len() - 2..], &[0xff, 0xd9]);
        cam.release(buf).unwrap();
    }

    #[test]
    fn raw_frames_fill_the_negotiated_size() {
        let mut cam = SyntheticCapture::new(config(PixelFormat::Nv12, 4)).unwrap();
        let format = cam.start().unwrap();
        assert_eq!(format.frame_size, 64 * 48 * 3 / 2);
        let buf = cam.next_frame(Duration::from_secs(1)).unwrap();
        assert_eq!(cam.data(&buf).len(), format.frame_size);
        cam.release(buf).unwrap();
    }

    #[test]
    fn refuses_the_last_free_buffer() {
        let mut cam = SyntheticCapture::new(config(PixelFormat::Nv12, 3)).unwrap();
        cam.start().unwrap();
        let a = cam.next_frame(Duration::from_secs(1)).unwrap();
        let b = cam.next_frame(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            cam.next_frame(Duration::from_secs(1)),
            Err(Error::PoolExhausted { held: 2, capacity: 3 })
        ));
        cam.release(a).unwrap();
        let c = cam.next_frame(Duration::from_secs(1)).unwrap();
        assert!(c.sequence > b.sequence);
        cam.release(b).unwrap();
        cam.release(c).unwrap();
        assert_eq!(cam.stats().held, 0);
    }

    #[test]
    fn short_timeout_reports_timeout() {
        let mut cfg = config(PixelFormat::Nv12, 4);
        cfg.fps = 1;
        let mut cam = SyntheticCapture::new(cfg).unwrap();
        cam.start().unwrap();
        let first = cam.next_frame(Duration::from_millis(10)).unwrap();
        cam.release(first).unwrap();
        assert!(matches!(
            cam.next_frame(Duration::from_millis(10)),
            Err(Error::Timeout(_))
        ));
        assert_eq!(cam.stats().timeouts, 1);
    }

    #[test]
    fn injected_fault_fires_once() {
        let mut cam = SyntheticCapture::new(config(PixelFormat::Yuyv, 4))
            .unwrap()
            .with_stream_fault_after(1);
        cam.start().unwrap();
        let buf = cam.next_frame(Duration::from_secs(1)).unwrap();
        cam.release(buf).unwrap();
        assert!(matches!(
            cam.next_frame(Duration::from_secs(1)),
            Err(Error::Stream(_))
        ));
        let buf = cam.next_frame(Duration::from_secs(1)).unwrap();
        cam.release(buf).unwrap();
    }

    #[test]
    fn stop_reclaims_held_buffers() {
        let mut cam = SyntheticCapture::new(config(PixelFormat::Nv12, 4)).unwrap();
        cam.start().unwrap();
        let held = cam.next_frame(Duration::from_secs(1)).unwrap();
        cam.stop().unwrap();
        assert_eq!(cam.stats().held, 0);
        assert!(cam.next_frame(Duration::from_secs(1)).is_err());
        drop(held);
    }
}
