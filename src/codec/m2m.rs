//! V4L2 stateful memory-to-memory codec.
//!
//! The unit is a device node with two queues: OUTPUT takes input frames,
//! CAPTURE returns results. Per-frame sequence numbers ride through the
//! driver in the buffer timestamp, which M2M drivers copy across.

use std::collections::VecDeque;
use std::io;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

use nix::poll::PollFlags;
use tracing::{debug, info, warn};
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::device::Handle;
use v4l::video::{Capture, Output};
use v4l::Device;

use crate::capture::PixelFormat;
use crate::codec::{
    h264, CodecBackend, CodecOutput, FrameInfo, InputFrame, InputUse, OutputLayout, Polled,
    SessionParams,
};
use crate::error::{Error, Result};
use crate::v4l2::{self, raw, KernelQueue, QueueKind};

pub struct M2mCodec {
    path: String,
    device: Device,
    handle: Arc<Handle>,
    params: Option<SessionParams>,
    /// OUTPUT queue, frames going into the unit
    input: Option<KernelQueue>,
    /// CAPTURE queue, results coming out
    output: Option<KernelQueue>,
    free_inputs: VecDeque<usize>,
    /// Sequence of the caller buffer each imported slot still reads
    borrowed: Vec<Option<u64>>,
    released: Vec<u64>,
    timestamps: VecDeque<(u64, u64)>,
    leased: Vec<bool>,
    in_flight: usize,
    draining: bool,
    stop_sent: bool,
    drained: bool,
    exports: bool,
}

impl M2mCodec {
    pub fn open(path: &str) -> Result<Self> {
        let device = Device::with_path(path).map_err(|e| Error::device(path, e))?;
        let caps = device.query_caps().map_err(|e| Error::device(path, e))?;
        let m2m = caps.capabilities.contains(CapFlags::VIDEO_M2M)
            || caps
                .capabilities
                .contains(CapFlags::VIDEO_CAPTURE | CapFlags::VIDEO_OUTPUT);
        if !m2m || !caps.capabilities.contains(CapFlags::STREAMING) {
            return Err(Error::device(
                path,
                "not a single-planar memory-to-memory device",
            ));
        }
        info!("Codec device {}: {} ({})", path, caps.card, caps.driver);

        let handle = device.handle();
        Ok(Self {
            path: path.to_string(),
            device,
            handle,
            params: None,
            input: None,
            output: None,
            free_inputs: VecDeque::new(),
            borrowed: Vec::new(),
            released: Vec::new(),
            timestamps: VecDeque::new(),
            leased: Vec::new(),
            in_flight: 0,
            draining: false,
            stop_sent: false,
            drained: false,
            exports: false,
        })
    }

    fn fault(&self, e: impl ToString) -> Error {
        Error::codec(&self.path, e)
    }

    fn set_control(&self, id: u32, value: i64, what: &str) {
        let control = Control {
            id,
            value: Value::Integer(value),
        };
        if let Err(e) = self.device.set_control(control) {
            warn!(device = %self.path, "Driver rejected {} = {}: {}", what, value, e);
        }
    }

    fn apply_controls(&self, params: &SessionParams) {
        match params.output {
            PixelFormat::H264 => {
                self.set_control(
                    raw::CID_MPEG_VIDEO_BITRATE,
                    i64::from(params.bitrate_kbps) * 1000,
                    "bitrate",
                );
                self.set_control(
                    raw::CID_MPEG_VIDEO_GOP_SIZE,
                    i64::from(params.gop_size),
                    "GOP size",
                );
                self.set_control(
                    raw::CID_MPEG_VIDEO_H264_I_PERIOD,
                    i64::from(params.gop_size),
                    "I-frame period",
                );
                // Late joiners need SPS/PPS with every IDR
                self.set_control(raw::CID_MPEG_VIDEO_REPEAT_SEQ_HEADER, 1, "repeat sequence header");
            }
            PixelFormat::Mjpeg if !params.input.is_compressed() => {
                self.set_control(
                    raw::CID_JPEG_COMPRESSION_QUALITY,
                    i64::from(params.quality),
                    "JPEG quality",
                );
            }
            _ => {}
        }
    }

    fn negotiate(&self, params: &SessionParams) -> Result<OutputLayout> {
        let unsupported = |side: &str, e: io::Error| {
            Error::UnsupportedFormat(format!("{} {}: {}", self.path, side, e))
        };

        let mut fmt = Output::format(&self.device).map_err(|e| unsupported("input", e))?;
        fmt.width = params.width;
        fmt.height = params.height;
        fmt.fourcc = params.input.fourcc();
        if params.input.is_compressed() {
            fmt.size = params.input.frame_size(params.width, params.height, 0) as u32;
        } else {
            fmt.stride = params.stride;
        }
        let input = Output::set_format(&self.device, &fmt).map_err(|e| unsupported("input", e))?;
        if PixelFormat::from_fourcc(input.fourcc) != Some(params.input) {
            return Err(Error::UnsupportedFormat(format!(
                "{} takes {} instead of {}",
                self.path, input.fourcc, params.input
            )));
        }

        let mut fmt = Capture::format(&self.device).map_err(|e| unsupported("output", e))?;
        fmt.width = params.width;
        fmt.height = params.height;
        fmt.fourcc = params.output.fourcc();
        if params.output.is_compressed() {
            fmt.size = params.output.frame_size(params.width, params.height, 0) as u32;
        }
        let output =
            Capture::set_format(&self.device, &fmt).map_err(|e| unsupported("output", e))?;
        if PixelFormat::from_fourcc(output.fourcc) != Some(params.output) {
            return Err(Error::UnsupportedFormat(format!(
                "{} produces {} instead of {}",
                self.path, output.fourcc, params.output
            )));
        }

        Ok(OutputLayout {
            width: output.width,
            height: output.height,
            stride: if params.output.is_compressed() { 0 } else { output.stride },
        })
    }

    /// Collect OUTPUT buffers the unit has finished reading
    fn reclaim_inputs(&mut self) -> Result<()> {
        let Some(input) = self.input.as_mut() else {
            return Ok(());
        };
        loop {
            match input.dequeue() {
                Ok(done) => {
                    if let Some(seq) = self.borrowed.get_mut(done.index).and_then(Option::take) {
                        self.released.push(seq);
                    }
                    self.free_inputs.push_back(done.index);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                // Nothing queued
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => return Ok(()),
                Err(e) => return Err(Error::codec(&self.path, e)),
            }
        }
    }

    fn send_stop(&mut self) -> bool {
        let fd = self.handle.fd();
        let result = match self.params {
            Some(p) if p.is_decoder() => {
                let mut cmd = raw::DecoderCmd {
                    cmd: raw::DEC_CMD_STOP,
                    ..Default::default()
                };
                unsafe { raw::vidioc_decoder_cmd(fd, &mut cmd) }.map(drop)
            }
            _ => {
                let mut cmd = raw::EncoderCmd {
                    cmd: raw::ENC_CMD_STOP,
                    ..Default::default()
                };
                unsafe { raw::vidioc_encoder_cmd(fd, &mut cmd) }.map(drop)
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(device = %self.path, "Stop command unsupported ({}), draining by count", e);
                false
            }
        }
    }

    fn timestamp_for(&mut self, sequence: u64) -> u64 {
        while let Some(&(seq, ts)) = self.timestamps.front() {
            if seq > sequence {
                break;
            }
            self.timestamps.pop_front();
            if seq == sequence {
                return ts;
            }
        }
        0
    }
}

impl CodecBackend for M2mCodec {
    fn name(&self) -> &str {
        "m2m"
    }

    fn configure(&mut self, params: &SessionParams) -> Result<OutputLayout> {
        self.close();
        let layout = self.negotiate(params)?;
        self.apply_controls(params);

        let count = params.buffer_count.max(2);
        let input = if params.zero_copy {
            KernelQueue::dmabuf(self.handle.clone(), QueueKind::Output, count)
        } else {
            KernelQueue::mmap(self.handle.clone(), QueueKind::Output, count)
        }
        .map_err(|e| self.fault(e))?;
        let mut output = KernelQueue::mmap(self.handle.clone(), QueueKind::Capture, count)
            .map_err(|e| self.fault(e))?;

        self.exports = !params.output.is_compressed() && output.export().is_ok();
        self.free_inputs = (0..input.len()).collect();
        self.borrowed = vec![None; input.len()];
        self.leased = vec![false; output.len()];
        debug!(
            device = %self.path,
            inputs = input.len(),
            outputs = output.len(),
            zero_copy = input.imports_dmabuf(),
            exports = self.exports,
            "Codec queues ready"
        );
        self.input = Some(input);
        self.output = Some(output);
        self.params = Some(*params);
        Ok(layout)
    }

    fn start(&mut self) -> Result<()> {
        let (Some(input), Some(output)) = (self.input.as_mut(), self.output.as_mut()) else {
            return Err(Error::codec(&self.path, "not configured"));
        };
        let started = (0..output.len())
            .try_for_each(|i| output.queue(i, 0, Duration::ZERO))
            .and_then(|_| output.stream_on())
            .and_then(|_| input.stream_on());
        started.map_err(|e| Error::codec(&self.path, e))
    }

    fn submit(&mut self, frame: &InputFrame<'_>) -> Result<InputUse> {
        if self.draining {
            return Err(self.fault("submit while draining"));
        }
        self.reclaim_inputs()?;
        let Some(index) = self.free_inputs.pop_front() else {
            return Err(Error::Backpressure);
        };
        let Some(input) = self.input.as_mut() else {
            return Err(Error::codec(&self.path, "not configured"));
        };

        let tag = v4l2::tag_timestamp(frame.sequence);
        let len = frame.data.len();
        let used = if input.imports_dmabuf() {
            let Some(fd) = frame.dmabuf else {
                self.free_inputs.push_front(index);
                return Err(Error::codec(&self.path, "zero-copy input without a DMA-BUF"));
            };
            input
                .queue_dmabuf(index, fd, len, tag)
                .map_err(|e| Error::codec(&self.path, e))?;
            self.borrowed[index] = Some(frame.sequence);
            InputUse::Borrowed
        } else {
            let buf = input.data_mut(index);
            if buf.len() < len {
                let capacity = buf.len();
                self.free_inputs.push_front(index);
                return Err(Error::codec(
                    &self.path,
                    format!("{} byte frame exceeds {} byte input buffer", len, capacity),
                ));
            }
            buf[..len].copy_from_slice(frame.data);
            input
                .queue(index, len, tag)
                .map_err(|e| Error::codec(&self.path, e))?;
            InputUse::Copied
        };

        self.timestamps.push_back((frame.sequence, frame.timestamp_us));
        self.in_flight += 1;
        Ok(used)
    }

    fn poll(&mut self, timeout: Duration) -> Result<Polled> {
        if self.drained {
            return Ok(Polled::Drained);
        }
        let ready = v4l2::wait(&self.handle, PollFlags::POLLIN, timeout)
            .map_err(|e| self.fault(e))?;
        self.reclaim_inputs()?;

        if !ready.contains(PollFlags::POLLIN) {
            // POLLERR here means every result buffer is leased out
            if self.draining && (!self.stop_sent && self.in_flight == 0) {
                self.drained = true;
                return Ok(Polled::Drained);
            }
            return Ok(Polled::Pending);
        }

        let Some(output) = self.output.as_mut() else {
            return Err(Error::codec(&self.path, "not configured"));
        };
        let done = match output.dequeue() {
            Ok(done) => done,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Polled::Pending),
            Err(e) => return Err(Error::codec(&self.path, e)),
        };

        if done.is_last() {
            self.drained = true;
        }
        if done.is_error() || done.bytes_used == 0 {
            output
                .queue(done.index, 0, Duration::ZERO)
                .map_err(|e| Error::codec(&self.path, e))?;
            if done.is_error() {
                warn!(device = %self.path, "Codec flagged a corrupt frame");
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            return Ok(if self.drained {
                Polled::Drained
            } else {
                Polled::Pending
            });
        }

        let sequence = v4l2::untag_timestamp(done.timestamp);
        let key_frame = match self.params.map(|p| p.output) {
            Some(PixelFormat::H264) => {
                done.is_key_frame() || h264::is_key_frame(output.data(done.index, done.bytes_used))
            }
            _ => true,
        };
        self.in_flight = self.in_flight.saturating_sub(1);
        self.leased[done.index] = true;
        let info = FrameInfo {
            key_frame,
            timestamp_us: self.timestamp_for(sequence),
            sequence,
            bytes_used: done.bytes_used,
        };
        Ok(Polled::Frame(CodecOutput::new(done.index, info)))
    }

    fn output_data(&self, output: &CodecOutput) -> &[u8] {
        match &self.output {
            Some(queue) => queue.data(output.slot, output.info.bytes_used),
            None => &[],
        }
    }

    fn output_dmabuf(&self, output: &CodecOutput) -> Option<BorrowedFd<'_>> {
        self.output.as_ref()?.exported(output.slot)
    }

    fn recycle(&mut self, output: CodecOutput) -> Result<()> {
        match self.leased.get_mut(output.slot) {
            Some(leased) if *leased => *leased = false,
            _ => {
                return Err(Error::codec(
                    &self.path,
                    format!("output slot {} not leased", output.slot),
                ))
            }
        }
        if let Some(queue) = self.output.as_mut() {
            queue
                .queue(output.slot, 0, Duration::ZERO)
                .map_err(|e| Error::codec(&self.path, e))?;
        }
        Ok(())
    }

    fn released_inputs(&mut self, released: &mut Vec<u64>) -> Result<()> {
        self.reclaim_inputs()?;
        released.append(&mut self.released);
        Ok(())
    }

    fn imports_dmabuf(&self) -> bool {
        self.input.as_ref().is_some_and(KernelQueue::imports_dmabuf)
    }

    fn exports_dmabuf(&self) -> bool {
        self.exports
    }

    fn begin_drain(&mut self) -> Result<()> {
        self.draining = true;
        self.stop_sent = self.send_stop();
        Ok(())
    }

    fn request_key_frame(&mut self) -> Result<bool> {
        let control = Control {
            id: raw::CID_MPEG_VIDEO_FORCE_KEY_FRAME,
            value: Value::Integer(1),
        };
        match self.device.set_control(control) {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!(device = %self.path, "Forced key frame unsupported: {}", e);
                Ok(false)
            }
        }
    }

    fn close(&mut self) {
        // Dropping a queue stops it and frees its buffers
        self.input.take();
        self.output.take();
        self.free_inputs.clear();
        self.borrowed.clear();
        self.released.clear();
        self.timestamps.clear();
        self.leased.clear();
        self.in_flight = 0;
        self.draining = false;
        self.stop_sent = false;
        self.drained = false;
        self.exports = false;
    }
}
