//! V4L2 camera capture with explicit buffer ownership and DMA-BUF export

use std::io;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::poll::PollFlags;
use tracing::{debug, info, instrument, warn};
use v4l::capability::Flags as CapFlags;
use v4l::device::Handle;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::capture::frame::{CaptureBuffer, NegotiatedFormat, PixelFormat};
use crate::capture::pool::BufferPool;
use crate::capture::{CaptureSource, CaptureStats};
use crate::error::{Error, Result};
use crate::v4l2::{self, KernelQueue, QueueKind};
use crate::CaptureConfig;

/// Camera capture on a single-planar V4L2 node
pub struct V4l2Capture {
    handle: Arc<Handle>,
    config: CaptureConfig,
    format: NegotiatedFormat,
    queue: Option<KernelQueue>,
    pool: BufferPool,
    last_driver_sequence: Option<u32>,
    sequence: u64,
    stats: CaptureStats,
}

impl V4l2Capture {
    /// Open the device and negotiate format and frame rate
    pub fn open(config: CaptureConfig) -> Result<Self> {
        info!("Initializing V4L2 capture: {}", config.device);
        let path = config.device.clone();

        let device = Device::with_path(&path).map_err(|e| Error::device(&path, e))?;

        let caps = device.query_caps().map_err(|e| Error::device(&path, e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::device(&path, "device doesn't support video capture"));
        }
        if !caps.capabilities.contains(CapFlags::STREAMING) {
            return Err(Error::device(&path, "device doesn't support streaming I/O"));
        }

        let mut fmt = device.format().map_err(|e| Error::device(&path, e))?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = config.format.fourcc();
        let actual = device
            .set_format(&fmt)
            .map_err(|e| Error::device(&path, e))?;

        // A substituted pixel format needs operator action, not a silent fallback
        if PixelFormat::from_fourcc(actual.fourcc) != Some(config.format) {
            return Err(Error::device(
                &path,
                format!(
                    "requested {} but driver negotiated {}",
                    config.format, actual.fourcc
                ),
            ));
        }
        if actual.width.abs_diff(config.width) > config.size_tolerance
            || actual.height.abs_diff(config.height) > config.size_tolerance
        {
            return Err(Error::device(
                &path,
                format!(
                    "requested {}x{} but driver negotiated {}x{}",
                    config.width, config.height, actual.width, actual.height
                ),
            ));
        }

        let fps = match device.set_params(&Parameters::with_fps(config.fps)) {
            Ok(params) if params.interval.numerator > 0 => {
                params.interval.denominator / params.interval.numerator
            }
            Ok(_) => config.fps,
            Err(e) => {
                warn!("Device ignored frame rate {}: {}", config.fps, e);
                config.fps
            }
        };

        let format = NegotiatedFormat {
            width: actual.width,
            height: actual.height,
            stride: actual.stride,
            format: config.format,
            frame_size: actual.size as usize,
            fps,
        };
        info!(
            "Negotiated {}x{} {} stride={} @ {} fps",
            format.width, format.height, format.format, format.stride, format.fps
        );

        let handle = device.handle();
        Ok(Self {
            handle,
            pool: BufferPool::new(config.buffer_count as usize),
            config,
            format,
            queue: None,
            last_driver_sequence: None,
            sequence: 0,
            stats: CaptureStats::default(),
        })
    }

    /// ENODEV and friends mean the camera is gone; anything else is a stream fault
    fn classify(&self, e: io::Error) -> Error {
        match e.raw_os_error() {
            Some(libc::ENODEV) | Some(libc::ENXIO) => Error::device(&self.config.device, e),
            _ => Error::Stream(format!("{}: {}", self.config.device, e)),
        }
    }

    fn start_queue(&mut self) -> io::Result<KernelQueue> {
        let mut queue = KernelQueue::mmap(
            self.handle.clone(),
            QueueKind::Capture,
            self.config.buffer_count,
        )?;
        if self.config.use_dmabuf {
            if let Err(e) = queue.export() {
                warn!("DMA-BUF export unsupported, codec input will be copied: {}", e);
            }
        }
        for index in 0..queue.len() {
            queue.queue(index, 0, Duration::ZERO)?;
        }
        queue.stream_on()?;
        Ok(queue)
    }
}

impl CaptureSource for V4l2Capture {
    fn start(&mut self) -> Result<NegotiatedFormat> {
        if self.queue.is_some() {
            return Ok(self.format);
        }
        let queue = self.start_queue().map_err(|e| self.classify(e))?;
        self.pool = BufferPool::new(queue.len());
        self.last_driver_sequence = None;
        info!("Capture stream started with {} buffers", queue.len());
        self.queue = Some(queue);
        Ok(self.format)
    }

    fn format(&self) -> NegotiatedFormat {
        self.format
    }

    #[instrument(skip(self), level = "trace")]
    fn next_frame(&mut self, timeout: Duration) -> Result<CaptureBuffer> {
        if self.queue.is_none() {
            return Err(Error::Stream("capture not started".into()));
        }
        self.pool.ensure_available()?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let ready = v4l2::wait(&self.handle, PollFlags::POLLIN, remaining)
                .map_err(|e| self.classify(e))?;
            if ready.contains(PollFlags::POLLERR) {
                return Err(Error::Stream(format!("{}: poll error", self.config.device)));
            }
            if !ready.contains(PollFlags::POLLIN) {
                if remaining.is_zero() || Instant::now() >= deadline {
                    self.stats.timeouts += 1;
                    return Err(Error::Timeout(timeout));
                }
                continue;
            }

            let Some(queue) = self.queue.as_mut() else {
                return Err(Error::Stream("capture not started".into()));
            };
            let dequeued = match queue.dequeue() {
                Ok(d) => d,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(self.classify(e)),
            };

            if dequeued.is_error() {
                // Corrupted frame: straight back to the driver
                debug!(index = dequeued.index, "Driver flagged buffer error");
                self.stats.skipped += 1;
                queue
                    .queue(dequeued.index, 0, Duration::ZERO)
                    .map_err(|e| Error::Stream(e.to_string()))?;
                continue;
            }

            let gap = match self.last_driver_sequence {
                Some(last) => u64::from(dequeued.sequence.wrapping_sub(last).saturating_sub(1)),
                None => 0,
            };
            self.last_driver_sequence = Some(dequeued.sequence);
            if gap > 0 {
                self.stats.skipped += gap;
                metrics::counter!("capture_frames_skipped_total").increment(gap);
                debug!(gap, "Driver dropped frames");
            }
            self.sequence += gap + 1;
            self.stats.frames += 1;

            self.pool.checkout(dequeued.index)?;
            self.stats.held = self.pool.held();

            return Ok(CaptureBuffer {
                index: dequeued.index,
                bytes_used: dequeued.bytes_used,
                format: self.format.format,
                sequence: self.sequence,
                timestamp: dequeued.timestamp,
                captured_at: Instant::now(),
            });
        }
    }

    fn data(&self, buffer: &CaptureBuffer) -> &[u8] {
        match &self.queue {
            Some(queue) => queue.data(buffer.index, buffer.bytes_used),
            None => &[],
        }
    }

    fn dmabuf(&self, buffer: &CaptureBuffer) -> Option<BorrowedFd<'_>> {
        self.queue.as_ref()?.exported(buffer.index)
    }

    fn exports_dmabuf(&self) -> bool {
        self.queue.as_ref().is_some_and(|q| q.exported(0).is_some())
    }

    fn release(&mut self, buffer: CaptureBuffer) -> Result<()> {
        self.pool.checkin(buffer.index)?;
        self.stats.held = self.pool.held();
        if let Some(queue) = self.queue.as_mut() {
            if let Err(e) = queue.queue(buffer.index, 0, Duration::ZERO) {
                return Err(self.classify(e));
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let outstanding = self.pool.reclaim_all();
        if outstanding > 0 {
            warn!(outstanding, "Stopping capture with buffers still held downstream");
        }
        self.stats.held = 0;
        if let Some(mut queue) = self.queue.take() {
            queue.stream_off().map_err(|e| self.classify(e))?;
            info!(
                frames = self.stats.frames,
                skipped = self.stats.skipped,
                "Capture stream stopped"
            );
        }
        Ok(())
    }

    fn stats(&self) -> CaptureStats {
        self.stats
    }
}
