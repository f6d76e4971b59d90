//! Hardware codec sessions.
//!
//! A [`CodecSession`] drives one codec direction (decode or encode) through
//! its lifecycle and checks every call against the state machine. The work
//! itself is done by a [`CodecBackend`]: the V4L2 memory-to-memory unit, a
//! CPU fallback, or a test double.

pub mod convert;
pub mod h264;
pub mod m2m;
pub mod mock;
pub mod software;

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::capture::PixelFormat;
use crate::error::{Error, Result};
use crate::{CodecBackendKind, CodecConfig};

pub use mock::{MockCodec, MockConfig, MockStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    Unconfigured,
    Configured,
    Running,
    Draining,
    Closed,
    Error,
}

impl fmt::Display for CodecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodecState::Unconfigured => "unconfigured",
            CodecState::Configured => "configured",
            CodecState::Running => "running",
            CodecState::Draining => "draining",
            CodecState::Closed => "closed",
            CodecState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Everything a backend needs to set up one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub input: PixelFormat,
    pub output: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Bytes per line of raw input, 0 when compressed
    pub stride: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub gop_size: u32,
    pub quality: u8,
    /// Import input as DMA-BUF instead of copying
    pub zero_copy: bool,
    pub buffer_count: u32,
}

impl SessionParams {
    /// Session defaults from the codec section of the configuration
    pub fn from_config(
        config: &CodecConfig,
        input: PixelFormat,
        output: PixelFormat,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Self {
        Self {
            input,
            output,
            width,
            height,
            stride: if input.is_compressed() { 0 } else { width },
            fps,
            bitrate_kbps: config.bitrate_kbps,
            gop_size: config.gop_size,
            quality: config.jpeg_quality,
            zero_copy: false,
            buffer_count: config.buffer_count,
        }
    }

    pub fn is_decoder(&self) -> bool {
        self.input.is_compressed() && !self.output.is_compressed()
    }
}

/// Geometry of the frames a session emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLayout {
    pub width: u32,
    pub height: u32,
    /// Bytes per line, 0 for compressed output
    pub stride: u32,
}

/// One input buffer handed to a session
#[derive(Debug, Clone, Copy)]
pub struct InputFrame<'a> {
    pub format: PixelFormat,
    pub data: &'a [u8],
    /// Same bytes as a DMA-BUF, when the producer exported them
    pub dmabuf: Option<BorrowedFd<'a>>,
    pub timestamp_us: u64,
    pub sequence: u64,
}

/// What the backend did with an input buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputUse {
    /// Bytes were copied; the caller may reuse its buffer right away
    Copied,
    /// The backend reads the caller's memory until the sequence shows up in
    /// [`CodecSession::released_inputs`]
    Borrowed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub key_frame: bool,
    pub timestamp_us: u64,
    /// Sequence of the input this output came from
    pub sequence: u64,
    pub bytes_used: usize,
}

/// A filled output slot leased from the backend.
///
/// The bytes stay in the backend's buffer; read them with
/// [`CodecSession::data`] and hand the lease back with
/// [`CodecSession::recycle`].
#[must_use = "codec outputs must be recycled"]
#[derive(Debug)]
pub struct CodecOutput {
    pub(crate) slot: usize,
    pub info: FrameInfo,
}

impl CodecOutput {
    pub fn new(slot: usize, info: FrameInfo) -> Self {
        Self { slot, info }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[derive(Debug)]
pub enum Polled {
    Frame(CodecOutput),
    /// Nothing finished within the timeout
    Pending,
    /// Draining and every buffered frame has been emitted
    Drained,
}

/// Capability interface of one codec unit
pub trait CodecBackend: Send {
    fn name(&self) -> &str;

    /// Allocate buffers for `params`; `UnsupportedFormat` when the unit can't
    fn configure(&mut self, params: &SessionParams) -> Result<OutputLayout>;

    fn start(&mut self) -> Result<()>;

    /// Queue one input; `Backpressure` when the input queue is full
    fn submit(&mut self, frame: &InputFrame<'_>) -> Result<InputUse>;

    fn poll(&mut self, timeout: Duration) -> Result<Polled>;

    fn output_data(&self, output: &CodecOutput) -> &[u8];

    fn output_dmabuf(&self, _output: &CodecOutput) -> Option<BorrowedFd<'_>> {
        None
    }

    /// Give an output slot back to the unit
    fn recycle(&mut self, output: CodecOutput) -> Result<()>;

    /// Sequences of borrowed inputs the unit no longer reads
    fn released_inputs(&mut self, _released: &mut Vec<u64>) -> Result<()> {
        Ok(())
    }

    /// Whether inputs with a DMA-BUF are imported instead of copied
    fn imports_dmabuf(&self) -> bool {
        false
    }

    /// Whether outputs carry a DMA-BUF for the next stage
    fn exports_dmabuf(&self) -> bool {
        false
    }

    /// Stop accepting input and flush; `poll` reports `Drained` when done
    fn begin_drain(&mut self) -> Result<()>;

    /// Ask for an intra frame next; `false` when the unit can't
    fn request_key_frame(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn close(&mut self);
}

/// Session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub submitted: u64,
    pub emitted: u64,
    pub backpressure: u64,
    pub key_frames: u64,
}

/// State machine around one backend
pub struct CodecSession {
    name: String,
    backend: Box<dyn CodecBackend>,
    state: CodecState,
    params: Option<SessionParams>,
    layout: Option<OutputLayout>,
    borrowed: VecDeque<u64>,
    /// Borrowed inputs given up by a close, reported on the next release query
    orphaned: Vec<u64>,
    stats: SessionStats,
}

impl CodecSession {
    pub fn new(name: impl Into<String>, backend: Box<dyn CodecBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            state: CodecState::Unconfigured,
            params: None,
            layout: None,
            borrowed: VecDeque::new(),
            orphaned: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn state(&self) -> CodecState {
        self.state
    }

    pub fn params(&self) -> Option<&SessionParams> {
        self.params.as_ref()
    }

    pub fn output_layout(&self) -> Option<OutputLayout> {
        self.layout
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn imports_dmabuf(&self) -> bool {
        self.backend.imports_dmabuf()
    }

    pub fn exports_dmabuf(&self) -> bool {
        self.backend.exports_dmabuf()
    }

    /// Frames submitted but not yet emitted
    pub fn in_flight(&self) -> u64 {
        self.stats.submitted.saturating_sub(self.stats.emitted)
    }

    fn invalid(&self, op: &'static str) -> Error {
        Error::InvalidState {
            session: self.name.clone(),
            op,
            state: self.state,
        }
    }

    /// Hardware failures poison the session
    fn fail(&mut self, e: Error) -> Error {
        if e.is_fatal() || matches!(e, Error::Stream(_) | Error::Io(_)) {
            warn!(session = %self.name, "Codec session failed: {}", e);
            self.state = CodecState::Error;
        }
        e
    }

    pub fn configure(&mut self, params: SessionParams) -> Result<()> {
        if !matches!(self.state, CodecState::Unconfigured | CodecState::Closed) {
            return Err(self.invalid("configure"));
        }
        let layout = self.backend.configure(&params)?;
        info!(
            session = %self.name,
            backend = self.backend.name(),
            "Configured {} -> {} {}x{} @ {} fps, {} kbps, gop {}",
            params.input,
            params.output,
            params.width,
            params.height,
            params.fps,
            params.bitrate_kbps,
            params.gop_size
        );
        self.params = Some(params);
        self.layout = Some(layout);
        self.state = CodecState::Configured;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state != CodecState::Configured {
            return Err(self.invalid("start"));
        }
        self.backend.start().map_err(|e| self.fail(e))?;
        self.state = CodecState::Running;
        Ok(())
    }

    pub fn submit(&mut self, frame: &InputFrame<'_>) -> Result<InputUse> {
        if self.state != CodecState::Running {
            return Err(self.invalid("submit"));
        }
        if let Some(params) = &self.params {
            if frame.format != params.input {
                return Err(Error::FormatMismatch {
                    expected: params.input,
                    actual: frame.format,
                });
            }
        }
        match self.backend.submit(frame) {
            Ok(used) => {
                self.stats.submitted += 1;
                if used == InputUse::Borrowed {
                    self.borrowed.push_back(frame.sequence);
                }
                Ok(used)
            }
            Err(Error::Backpressure) => {
                self.stats.backpressure += 1;
                Err(Error::Backpressure)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Next finished frame, `None` when nothing completed within `timeout`
    pub fn poll(&mut self, timeout: Duration) -> Result<Option<CodecOutput>> {
        if !matches!(self.state, CodecState::Running | CodecState::Draining) {
            return Err(self.invalid("poll"));
        }
        match self.backend.poll(timeout) {
            Ok(Polled::Frame(output)) => {
                self.stats.emitted += 1;
                if output.info.key_frame {
                    self.stats.key_frames += 1;
                }
                Ok(Some(output))
            }
            Ok(Polled::Pending) | Ok(Polled::Drained) => Ok(None),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn data(&self, output: &CodecOutput) -> &[u8] {
        self.backend.output_data(output)
    }

    pub fn dmabuf(&self, output: &CodecOutput) -> Option<BorrowedFd<'_>> {
        self.backend.output_dmabuf(output)
    }

    pub fn recycle(&mut self, output: CodecOutput) -> Result<()> {
        self.backend.recycle(output).map_err(|e| self.fail(e))
    }

    /// Borrowed inputs that may now be reused by their producer
    pub fn released_inputs(&mut self) -> Result<Vec<u64>> {
        let mut released = std::mem::take(&mut self.orphaned);
        if self.borrowed.is_empty()
            || !matches!(self.state, CodecState::Running | CodecState::Draining)
        {
            return Ok(released);
        }
        let start = released.len();
        self.backend
            .released_inputs(&mut released)
            .map_err(|e| self.fail(e))?;
        let fresh = &released[start..];
        self.borrowed.retain(|seq| !fresh.contains(seq));
        Ok(released)
    }

    pub fn request_key_frame(&mut self) -> Result<bool> {
        if self.state != CodecState::Running {
            return Err(self.invalid("request a key frame"));
        }
        self.backend.request_key_frame().map_err(|e| self.fail(e))
    }

    /// Flush everything still inside the unit through `sink`.
    ///
    /// Fails with a codec error if the unit doesn't finish within `timeout`.
    pub fn drain<F>(&mut self, timeout: Duration, mut sink: F) -> Result<u64>
    where
        F: FnMut(&[u8], &FrameInfo) -> Result<()>,
    {
        match self.state {
            CodecState::Running => {}
            CodecState::Configured | CodecState::Draining => return Ok(0),
            _ => return Err(self.invalid("drain")),
        }
        self.state = CodecState::Draining;
        self.backend.begin_drain().map_err(|e| self.fail(e))?;

        let deadline = Instant::now() + timeout;
        let mut flushed = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.backend.poll(remaining.min(Duration::from_millis(100))) {
                Ok(Polled::Frame(output)) => {
                    self.stats.emitted += 1;
                    flushed += 1;
                    let result = sink(self.backend.output_data(&output), &output.info);
                    self.recycle(output)?;
                    result?;
                }
                Ok(Polled::Drained) => break,
                Ok(Polled::Pending) if remaining.is_zero() => {
                    self.state = CodecState::Error;
                    return Err(Error::codec(
                        &self.name,
                        format!("drain incomplete after {:?}", timeout),
                    ));
                }
                Ok(Polled::Pending) => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
        debug!(session = %self.name, flushed, "Drained");
        Ok(flushed)
    }

    /// Release hardware resources; valid from any state
    pub fn close(&mut self) {
        if self.state == CodecState::Closed {
            return;
        }
        self.backend.close();
        self.orphaned.extend(self.borrowed.drain(..));
        debug!(
            session = %self.name,
            submitted = self.stats.submitted,
            emitted = self.stats.emitted,
            "Closed"
        );
        self.state = CodecState::Closed;
    }

    /// Drain, close and come back up with new parameters
    pub fn reconfigure<F>(&mut self, params: SessionParams, timeout: Duration, sink: F) -> Result<()>
    where
        F: FnMut(&[u8], &FrameInfo) -> Result<()>,
    {
        if self.state == CodecState::Running {
            self.drain(timeout, sink)?;
        }
        self.close();
        self.configure(params)?;
        self.start()
    }
}

impl Drop for CodecSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builds the backend for each session the pipeline opens
pub type BackendFactory = Box<dyn FnMut(&SessionParams) -> Result<Box<dyn CodecBackend>> + Send>;

/// Factory for the backend kind named in the configuration
pub fn factory(config: CodecConfig) -> BackendFactory {
    Box::new(move |params: &SessionParams| -> Result<Box<dyn CodecBackend>> {
        Ok(match config.backend {
            CodecBackendKind::M2m => {
                let device = if params.is_decoder() {
                    &config.decoder_device
                } else if params.output == PixelFormat::H264 {
                    &config.h264_device
                } else {
                    &config.jpeg_device
                };
                Box::new(m2m::M2mCodec::open(device)?)
            }
            CodecBackendKind::Software => Box::new(software::SoftwareCodec::new()),
            CodecBackendKind::Mock => Box::new(MockCodec::new(MockConfig::default())),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_params() -> SessionParams {
        SessionParams {
            input: PixelFormat::Nv12,
            output: PixelFormat::H264,
            width: 64,
            height: 48,
            stride: 64,
            fps: 30,
            bitrate_kbps: 1000,
            gop_size: 10,
            quality: 80,
            zero_copy: false,
            buffer_count: 4,
        }
    }

    fn session(config: MockConfig) -> CodecSession {
        CodecSession::new("h264", Box::new(MockCodec::new(config)))
    }

    fn frame(data: &[u8], sequence: u64) -> InputFrame<'_> {
        InputFrame {
            format: PixelFormat::Nv12,
            data,
            dmabuf: None,
            timestamp_us: sequence * 33_333,
            sequence,
        }
    }

    /// Submit, collecting outputs whenever the unit pushes back
    fn feed(session: &mut CodecSession, n: u64, out: &mut Vec<FrameInfo>) {
        let plane = vec![0u8; 64 * 48 * 3 / 2];
        for seq in 1..=n {
            loop {
                match session.submit(&frame(&plane, seq)) {
                    Ok(_) => break,
                    Err(Error::Backpressure) => {
                        let output = session.poll(Duration::ZERO).unwrap().unwrap();
                        out.push(output.info);
                        session.recycle(output).unwrap();
                    }
                    Err(e) => panic!("submit failed: {e}"),
                }
            }
            while let Some(output) = session.poll(Duration::ZERO).unwrap() {
                out.push(output.info);
                session.recycle(output).unwrap();
            }
        }
    }

    #[test]
    fn lifecycle_is_enforced() {
        let mut s = session(MockConfig::default());
        assert_eq!(s.state(), CodecState::Unconfigured);
        assert!(matches!(
            s.submit(&frame(&[], 1)),
            Err(Error::InvalidState { op: "submit", .. })
        ));
        assert!(s.start().is_err());

        s.configure(h264_params()).unwrap();
        assert_eq!(s.state(), CodecState::Configured);
        assert!(s.configure(h264_params()).is_err());
        s.start().unwrap();
        assert_eq!(s.state(), CodecState::Running);

        s.drain(Duration::from_secs(1), |_, _| Ok(())).unwrap();
        assert_eq!(s.state(), CodecState::Draining);
        assert!(s.submit(&frame(&[], 1)).is_err());

        s.close();
        assert_eq!(s.state(), CodecState::Closed);
        s.configure(h264_params()).unwrap();
    }

    #[test]
    fn rejects_mismatched_input_format() {
        let mut s = session(MockConfig::default());
        s.configure(h264_params()).unwrap();
        s.start().unwrap();
        let mut f = frame(&[1, 2, 3], 1);
        f.format = PixelFormat::Yuyv;
        assert!(matches!(
            s.submit(&f),
            Err(Error::FormatMismatch {
                expected: PixelFormat::Nv12,
                actual: PixelFormat::Yuyv
            })
        ));
        assert_eq!(s.state(), CodecState::Running);
        assert_eq!(s.stats().submitted, 0);
    }

    #[test]
    fn drain_flushes_every_buffered_frame() {
        for lookahead in [0, 1, 3] {
            let mut s = session(MockConfig {
                lookahead,
                input_capacity: 2,
                ..Default::default()
            });
            s.configure(h264_params()).unwrap();
            s.start().unwrap();

            let mut out = Vec::new();
            feed(&mut s, 25, &mut out);
            assert_eq!(out.len() as u64, 25 - lookahead as u64);

            let flushed = s
                .drain(Duration::from_secs(1), |data, info| {
                    assert!(!data.is_empty());
                    out.push(*info);
                    Ok(())
                })
                .unwrap();
            s.close();

            assert_eq!(flushed, lookahead as u64);
            assert_eq!(out.len(), 25);
            let sequences: Vec<u64> = out.iter().map(|i| i.sequence).collect();
            assert_eq!(sequences, (1..=25).collect::<Vec<_>>());
        }
    }

    #[test]
    fn backpressure_is_transient() {
        let mut s = session(MockConfig {
            lookahead: 0,
            input_capacity: 1,
            ..Default::default()
        });
        s.configure(h264_params()).unwrap();
        s.start().unwrap();

        s.submit(&frame(&[0; 8], 1)).unwrap();
        assert!(matches!(s.submit(&frame(&[0; 8], 2)), Err(Error::Backpressure)));
        assert_eq!(s.state(), CodecState::Running);

        let output = s.poll(Duration::ZERO).unwrap().unwrap();
        s.recycle(output).unwrap();
        s.submit(&frame(&[0; 8], 2)).unwrap();
        assert_eq!(s.stats().backpressure, 1);
    }

    #[test]
    fn key_frames_follow_gop_and_requests() {
        let mut s = session(MockConfig::default());
        s.configure(h264_params()).unwrap();
        s.start().unwrap();

        let mut out = Vec::new();
        feed(&mut s, 12, &mut out);
        let keys: Vec<u64> = out.iter().filter(|i| i.key_frame).map(|i| i.sequence).collect();
        assert_eq!(keys, vec![1, 11]);

        assert!(s.request_key_frame().unwrap());
        let plane = vec![0u8; 64 * 48 * 3 / 2];
        s.submit(&frame(&plane, 13)).unwrap();
        let output = s.poll(Duration::ZERO).unwrap().unwrap();
        assert!(output.info.key_frame);
        assert!(h264::is_key_frame(s.data(&output)));
        s.recycle(output).unwrap();
    }

    #[test]
    fn fault_moves_session_to_error() {
        let mut s = session(MockConfig {
            fail_after: Some(2),
            ..Default::default()
        });
        s.configure(h264_params()).unwrap();
        s.start().unwrap();
        let mut out = Vec::new();
        feed(&mut s, 2, &mut out);
        assert!(matches!(
            s.submit(&frame(&[0; 8], 3)),
            Err(Error::Codec { .. })
        ));
        assert_eq!(s.state(), CodecState::Error);
        assert!(s.poll(Duration::ZERO).is_err());

        s.close();
        s.configure(h264_params()).unwrap();
    }

    #[test]
    fn reconfigure_keeps_frames() {
        let stats = MockStats::shared();
        let mut s = CodecSession::new(
            "h264",
            Box::new(MockCodec::with_stats(
                MockConfig {
                    lookahead: 2,
                    ..Default::default()
                },
                stats.clone(),
            )),
        );
        s.configure(h264_params()).unwrap();
        s.start().unwrap();

        let mut out = Vec::new();
        feed(&mut s, 5, &mut out);
        let mut params = h264_params();
        params.bitrate_kbps = 4000;
        s.reconfigure(params, Duration::from_secs(1), |_, info| {
            out.push(*info);
            Ok(())
        })
        .unwrap();

        assert_eq!(out.len(), 5);
        assert_eq!(s.state(), CodecState::Running);
        assert_eq!(s.params().map(|p| p.bitrate_kbps), Some(4000));
        assert_eq!(stats.bitrate_kbps(), 4000);
        assert_eq!(stats.configures(), 2);
    }

    #[test]
    fn close_hands_back_borrowed_inputs() {
        let mut s = session(MockConfig {
            lookahead: 2,
            borrow_inputs: true,
            ..Default::default()
        });
        s.configure(h264_params()).unwrap();
        s.start().unwrap();
        for seq in 1..=3 {
            assert_eq!(s.submit(&frame(&[0; 8], seq)).unwrap(), InputUse::Borrowed);
        }
        let output = s.poll(Duration::ZERO).unwrap().unwrap();
        s.recycle(output).unwrap();
        assert_eq!(s.released_inputs().unwrap(), vec![1]);

        // Restarting the unit forgets the rest; the producer gets them back
        let mut params = h264_params();
        params.bitrate_kbps = 3000;
        s.close();
        s.configure(params).unwrap();
        s.start().unwrap();
        assert_eq!(s.released_inputs().unwrap(), vec![2, 3]);
        assert!(s.released_inputs().unwrap().is_empty());
    }

    #[test]
    fn rejected_configure_leaves_session_unconfigured() {
        let mut s = session(MockConfig {
            reject_configure: 1,
            ..Default::default()
        });
        assert!(matches!(
            s.configure(h264_params()),
            Err(Error::UnsupportedFormat(_))
        ));
        assert_eq!(s.state(), CodecState::Unconfigured);
        s.configure(h264_params()).unwrap();
    }
}
