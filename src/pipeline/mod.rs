//! The capture/codec run loop.
//!
//! One sequential loop per process: dequeue a frame, push it through the
//! codec sessions, publish whatever came out. Buffers lent to a codec that
//! imports DMA-BUFs are tracked as loans and only given back to their owner
//! once every borrowing session has let go.

mod sink;
mod stages;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureBuffer, CaptureSource, CaptureStats, NegotiatedFormat};
use crate::codec::{BackendFactory, InputFrame};
use crate::error::{Error, Result};
use crate::frame::{Sequencer, StreamType};
use crate::router::FrameRouter;
use crate::{utils, Config};

use sink::Sink;
use stages::{open_chain, Chain, Loan, Stages};

/// Requests from the server side and the signal handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Make the next H264 frame an intra frame
    ForceKeyFrame,
    /// Re-target the H264 encoder, in kbps
    SetBitrate(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub captured: u64,
    /// Dropped by the driver before we saw them
    pub skipped: u64,
    pub timeouts: u64,
    /// Dropped inside the pipeline: codec full after every retry, or lost in a drain
    pub dropped: u64,
    pub restarts: u32,
    pub published: [u64; 3],
}


pub struct Pipeline {
    config: Config,
    source: Box<dyn CaptureSource>,
    factory: BackendFactory,
    stages: Stages,
    commands: flume::Receiver<Command>,
    held: Vec<Loan<CaptureBuffer>>,
    format: Option<NegotiatedFormat>,
    restarts_left: u32,
    stalls: u32,
    /// Sessions were rebuilt after a codec fault and no frame has made it through since
    reopened: bool,
}

impl Pipeline {
    pub fn new(
        config: Config,
        source: Box<dyn CaptureSource>,
        factory: BackendFactory,
        router: Arc<FrameRouter>,
        commands: flume::Receiver<Command>,
    ) -> Self {
        let enabled = StreamType::ALL.map(|s| config.server.enabled(s));
        Self {
            stages: Stages {
                chain: Chain::Direct {
                    jpeg: None,
                    h264: None,
                },
                sink: Sink {
                    router,
                    sequencer: Sequencer::default(),
                    enabled,
                    stats: PipelineStats::default(),
                },
                released: Vec::new(),
                retries: config.pipeline.submit_retries,
                poll_timeout: config.codec.poll_timeout(),
            },
            restarts_left: config.pipeline.restart_attempts,
            config,
            source,
            factory,
            commands,
            held: Vec::new(),
            format: None,
            stalls: 0,
            reopened: false,
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            skipped: self.source.stats().skipped,
            ..self.stages.sink.stats
        }
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.source.stats()
    }

    pub fn format(&self) -> Option<NegotiatedFormat> {
        self.format
    }

    /// Start streaming and open the codec sessions for the negotiated format
    pub fn start(&mut self) -> Result<()> {
        let format = self.source.start()?;
        info!(
            "Capturing {} {}x{} @ {} fps, stride {}",
            format.format, format.width, format.height, format.fps, format.stride
        );
        self.stages.chain = open_chain(
            &self.config,
            &mut self.factory,
            &format,
            self.source.exports_dmabuf(),
        )?;
        self.format = Some(format);
        Ok(())
    }

    /// One turn of the loop: commands, one captured frame, codec outputs
    pub fn step(&mut self) -> Result<()> {
        self.handle_commands()?;
        self.reclaim()?;

        let poll_timeout = self.config.codec.poll_timeout();
        let buffer = match self.source.next_frame(self.config.capture.timeout()) {
            Ok(buffer) => buffer,
            Err(Error::Timeout(after)) => {
                self.stages.sink.stats.timeouts += 1;
                metrics::counter!("pipeline_capture_timeouts_total").increment(1);
                warn!("No frame from the camera within {:?}", after);
                self.stages.service(Duration::ZERO)?;
                return self.reclaim();
            }
            Err(e @ Error::PoolExhausted { .. }) => {
                if self.stalls >= self.config.pipeline.submit_retries {
                    return self.restart(e);
                }
                // Wait for the codec to give some buffers back
                self.stalls += 1;
                debug!("{}, waiting on the codec", e);
                self.stages.service(poll_timeout)?;
                return self.reclaim();
            }
            Err(e @ Error::Stream(_)) => return self.restart(e),
            Err(e) => return Err(e),
        };
        self.stalls = 0;
        self.restarts_left = self.config.pipeline.restart_attempts;
        self.stages.sink.stats.captured += 1;
        metrics::counter!("pipeline_frames_captured_total").increment(1);

        let fed = {
            let frame = InputFrame {
                format: buffer.format,
                data: self.source.data(&buffer),
                dmabuf: if self.config.codec.zero_copy {
                    self.source.dmabuf(&buffer)
                } else {
                    None
                },
                timestamp_us: buffer.timestamp_us(),
                sequence: buffer.sequence,
            };
            self.stages.feed(&frame)
        };
        match fed {
            Ok(0) => self.source.release(buffer)?,
            Ok(borrowers) => self.held.push(Loan {
                sequence: buffer.sequence,
                item: buffer,
                borrowers,
            }),
            Err(e) => {
                // The sessions may have imported this buffer; close them first
                let reopened = self.reopen(e);
                self.source.release(buffer)?;
                return reopened;
            }
        }

        if let Err(e) = self.stages.service(poll_timeout) {
            return self.reopen(e);
        }
        self.reopened = false;
        self.reclaim()
    }

    /// Rebuild the codec sessions after a codec fault. A second fault before
    /// any frame gets through is fatal.
    fn reopen(&mut self, cause: Error) -> Result<()> {
        if self.reopened || !matches!(cause, Error::Codec { .. } | Error::UnsupportedFormat(_)) {
            return Err(cause);
        }
        let Some(format) = self.format else {
            return Err(cause);
        };
        warn!("Codec failed, reopening sessions: {}", cause);
        self.reopened = true;
        metrics::counter!("pipeline_codec_reopens_total").increment(1);

        // Closed sessions read nothing more, so every loan comes back
        self.stages.close();
        for loan in std::mem::take(&mut self.held) {
            self.source.release(loan.item)?;
        }
        self.stages.chain = open_chain(
            &self.config,
            &mut self.factory,
            &format,
            self.source.exports_dmabuf(),
        )?;
        Ok(())
    }

    /// Return capture buffers no session reads anymore
    fn reclaim(&mut self) -> Result<()> {
        for (sequence, bit) in std::mem::take(&mut self.stages.released) {
            let Some(pos) = self.held.iter().position(|l| l.sequence == sequence) else {
                continue;
            };
            self.held[pos].borrowers &= !bit;
            if self.held[pos].borrowers == 0 {
                let loan = self.held.swap_remove(pos);
                self.source.release(loan.item)?;
            }
        }
        Ok(())
    }

    fn handle_commands(&mut self) -> Result<()> {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::ForceKeyFrame => self.stages.force_key_frame()?,
                Command::SetBitrate(kbps) => {
                    self.stages
                        .set_bitrate(kbps, self.config.codec.drain_timeout())?;
                    self.config.codec.bitrate_kbps = kbps;
                }
            }
        }
        Ok(())
    }

    /// Stop and restart the camera after a streaming fault
    fn restart(&mut self, cause: Error) -> Result<()> {
        if self.restarts_left == 0 {
            error!("Capture failed with no restarts left: {}", cause);
            return Err(cause);
        }
        self.restarts_left -= 1;
        self.stalls = 0;
        self.stages.sink.stats.restarts += 1;
        metrics::counter!("pipeline_capture_restarts_total").increment(1);
        warn!("Restarting capture: {}", cause);

        self.stages.service(Duration::ZERO)?;
        self.reclaim()?;
        // Sessions still reading camera buffers must let go before the queue is torn down
        let lent = !self.held.is_empty();
        if lent {
            info!(
                held = self.held.len(),
                "Capture buffers still lent to the codec, closing sessions"
            );
            if let Err(e) = self.stages.drain(self.config.codec.drain_timeout()) {
                warn!("Drain before restart failed: {}", e);
            }
            self.stages.close();
        }
        // Stopping reclaims whatever is still checked out
        self.held.clear();
        self.source.stop()?;
        let format = self.source.start()?;

        if lent || self.format != Some(format) {
            if !lent {
                info!("Format changed across restart, reopening codec sessions");
                self.stages.drain(self.config.codec.drain_timeout())?;
                self.stages.close();
            }
            self.stages.chain = open_chain(
                &self.config,
                &mut self.factory,
                &format,
                self.source.exports_dmabuf(),
            )?;
            self.format = Some(format);
        }
        Ok(())
    }

    /// Stop the camera, flush every codec session into the router, then
    /// release the hardware
    pub fn shutdown(&mut self) -> Result<()> {
        info!("Stopping pipeline");
        let serviced = self.stages.service(Duration::ZERO).and_then(|()| self.reclaim());
        self.held.clear();
        let stopped = self.source.stop();
        let drained = self.stages.drain(self.config.codec.drain_timeout());
        self.stages.close();
        self.log_stats();
        serviced.and(stopped).and(drained)
    }

    fn log_stats(&self) {
        let stats = self.stats();
        let capture = self.source.stats();
        info!(
            captured = stats.captured,
            skipped = stats.skipped,
            dropped = stats.dropped,
            timeouts = stats.timeouts,
            restarts = stats.restarts,
            held = capture.held,
            snapshot = stats.published[StreamType::Snapshot.index()],
            mjpeg = stats.published[StreamType::Mjpeg.index()],
            h264 = stats.published[StreamType::H264.index()],
            "Pipeline stats"
        );
        metrics::gauge!("capture_buffers_held").set(capture.held as f64);
    }

    /// Run until `shutdown` is cancelled or a fatal error. Blocks; call it
    /// from a dedicated thread.
    pub fn run(mut self, shutdown: CancellationToken) -> Result<PipelineStats> {
        if let Some(core) = self.config.pipeline.cpu_affinity {
            utils::pin_current_thread(core);
        }
        self.start()?;

        let interval = Duration::from_secs(self.config.pipeline.stats_interval_secs.max(1));
        let mut last_report = Instant::now();
        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }
            if let Err(e) = self.step() {
                error!("Pipeline failed: {}", e);
                break Err(e);
            }
            if last_report.elapsed() >= interval {
                self.log_stats();
                last_report = Instant::now();
            }
        };

        let stopped = self.shutdown();
        result?;
        stopped?;
        Ok(self.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{PixelFormat, SyntheticCapture};
    use crate::codec::{CodecBackend, MockCodec, MockConfig, MockStats, SessionParams};
    use crate::router::ClientConnection;

    struct Harness {
        pipeline: Pipeline,
        router: Arc<FrameRouter>,
        commands: flume::Sender<Command>,
        h264: Arc<MockStats>,
    }

    fn config(format: PixelFormat, streams: &[StreamType]) -> Config {
        let mut config = Config::default();
        config.capture.device = "synthetic://test".into();
        config.capture.width = 32;
        config.capture.height = 16;
        config.capture.fps = 1000;
        config.capture.format = format;
        config.codec.backend = crate::CodecBackendKind::Mock;
        config.codec.gop_size = 10;
        config.codec.poll_timeout_ms = 1;
        for stream in streams {
            let path = Some(format!("/nonexistent/{}.sock", stream).into());
            match stream {
                StreamType::Snapshot => config.server.snapshot_socket = path,
                StreamType::Mjpeg => config.server.mjpeg_socket = path,
                StreamType::H264 => config.server.h264_socket = path,
            }
        }
        config
    }

    fn harness(config: Config, decoder: MockConfig, encoder: MockConfig) -> Harness {
        let h264 = MockStats::shared();
        let factory: BackendFactory = {
            let h264 = h264.clone();
            Box::new(move |params: &SessionParams| -> Result<Box<dyn CodecBackend>> {
                Ok(if params.is_decoder() {
                    Box::new(MockCodec::new(decoder.clone()))
                } else if params.output == PixelFormat::H264 {
                    Box::new(MockCodec::with_stats(encoder.clone(), h264.clone()))
                } else {
                    Box::new(MockCodec::new(encoder.clone()))
                })
            })
        };
        let (tx, rx) = flume::bounded(4);
        let router = Arc::new(FrameRouter::new(&config.server, tx.clone()));
        let source = Box::new(SyntheticCapture::new(config.capture.clone()).unwrap());
        Harness {
            pipeline: Pipeline::new(config, source, factory, router.clone(), rx),
            router,
            commands: tx,
            h264,
        }
    }

    fn drain_client(client: &ClientConnection) -> Vec<Arc<crate::EncodedFrame>> {
        std::iter::from_fn(|| client.try_next()).collect()
    }

    #[test]
    fn usb_path_passes_jpeg_through_and_transcodes_h264() {
        let mut h = harness(
            config(PixelFormat::Mjpeg, &StreamType::ALL),
            MockConfig::default(),
            MockConfig::default(),
        );
        h.pipeline.start().unwrap();
        let mjpeg = h.router.join(StreamType::Mjpeg);
        for _ in 0..3 {
            h.pipeline.step().unwrap();
        }

        let frames = drain_client(&mjpeg);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.payload.starts_with(&[0xff, 0xd8])));
        assert!(h.router.latest_snapshot().is_some());
        assert_eq!(h.pipeline.stats().published, [3, 3, 3]);
        assert_eq!(h.h264.submitted(), 3);
    }

    #[test]
    fn drain_at_shutdown_flushes_every_frame() {
        let mut h = harness(
            config(PixelFormat::Mjpeg, &[StreamType::H264]),
            MockConfig::default(),
            MockConfig {
                lookahead: 3,
                ..Default::default()
            },
        );
        h.pipeline.start().unwrap();
        for _ in 0..20 {
            h.pipeline.step().unwrap();
        }
        assert_eq!(h.pipeline.stats().published[StreamType::H264.index()], 17);

        h.pipeline.shutdown().unwrap();
        let stats = h.pipeline.stats();
        assert_eq!(stats.captured, 20);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.published[StreamType::H264.index()], 20);
        assert_eq!(h.h264.emitted(), 20);
        assert_eq!(h.pipeline.capture_stats().held, 0);
    }

    #[test]
    fn raw_path_returns_borrowed_buffers() {
        let lending = MockConfig {
            lookahead: 1,
            borrow_inputs: true,
            ..Default::default()
        };
        let mut h = harness(
            config(PixelFormat::Nv12, &[StreamType::Mjpeg, StreamType::H264]),
            MockConfig::default(),
            lending,
        );
        h.pipeline.start().unwrap();
        for _ in 0..12 {
            h.pipeline.step().unwrap();
            // One frame sits in each encoder's lookahead
            assert!(h.pipeline.capture_stats().held <= 1);
        }
        h.pipeline.shutdown().unwrap();

        let stats = h.pipeline.stats();
        assert_eq!(stats.published[StreamType::Mjpeg.index()], 12);
        assert_eq!(stats.published[StreamType::H264.index()], 12);
        assert_eq!(stats.published[StreamType::Snapshot.index()], 0);
        assert_eq!(h.pipeline.capture_stats().held, 0);
    }

    #[test]
    fn full_encoder_drops_after_retries() {
        let mut config = config(PixelFormat::Nv12, &[StreamType::H264]);
        config.pipeline.submit_retries = 2;
        let mut h = harness(
            config,
            MockConfig::default(),
            MockConfig {
                // Holds two frames and emits nothing until drained
                lookahead: 2,
                input_capacity: 0,
                ..Default::default()
            },
        );
        h.pipeline.start().unwrap();
        for _ in 0..5 {
            h.pipeline.step().unwrap();
        }
        let stats = h.pipeline.stats();
        assert_eq!(stats.captured, 5);
        assert_eq!(h.h264.submitted(), 2);
        assert_eq!(stats.dropped, 3);
    }

    #[test]
    fn key_frame_request_reaches_the_encoder() {
        let mut h = harness(
            config(PixelFormat::Nv12, &[StreamType::H264]),
            MockConfig::default(),
            MockConfig::default(),
        );
        h.pipeline.start().unwrap();
        for _ in 0..3 {
            h.pipeline.step().unwrap();
        }
        let client = h.router.join(StreamType::H264);
        h.pipeline.step().unwrap();
        assert_eq!(h.h264.key_frame_requests(), 1);

        let frames = drain_client(&client);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_key_frame());
    }

    #[test]
    fn bitrate_change_reconfigures_only_the_encoder() {
        let mut config = config(PixelFormat::Mjpeg, &[StreamType::H264]);
        config.server.queue_depth = 16;
        let mut h = harness(
            config,
            MockConfig::default(),
            MockConfig {
                lookahead: 2,
                ..Default::default()
            },
        );
        h.pipeline.start().unwrap();
        let client = h.router.join(StreamType::H264);
        for _ in 0..5 {
            h.pipeline.step().unwrap();
        }
        h.commands.send(Command::SetBitrate(4000)).unwrap();
        for _ in 0..5 {
            h.pipeline.step().unwrap();
        }

        assert_eq!(h.h264.configures(), 2);
        assert_eq!(h.h264.bitrate_kbps(), 4000);
        let frames = drain_client(&client);
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, (1..=8).collect::<Vec<_>>());
        assert_eq!(h.pipeline.stats().dropped, 0);
    }

    #[test]
    fn codec_fault_reopens_sessions_once() {
        let config = config(PixelFormat::Nv12, &[StreamType::H264]);
        let faulty = |after| MockConfig {
            fail_after: Some(after),
            borrow_inputs: true,
            ..Default::default()
        };

        // Every fresh encoder fails on its fourth frame
        let mut h = harness(config.clone(), MockConfig::default(), faulty(3));
        h.pipeline.start().unwrap();
        for _ in 0..10 {
            h.pipeline.step().unwrap();
        }
        assert_eq!(h.h264.configures(), 3);
        assert!(h.pipeline.capture_stats().held <= 1);

        // Failing again before any frame gets through gives up
        let mut h = harness(config, MockConfig::default(), faulty(0));
        h.pipeline.start().unwrap();
        h.pipeline.step().unwrap();
        assert!(matches!(h.pipeline.step(), Err(Error::Codec { .. })));
    }

    fn router(config: &Config) -> Arc<FrameRouter> {
        Arc::new(FrameRouter::new(&config.server, flume::bounded(1).0))
    }

    fn rejecting(times: u32) -> BackendFactory {
        let mut left = times;
        Box::new(move |_params: &SessionParams| -> Result<Box<dyn CodecBackend>> {
            // Every session's first backend refuses `times` configures
            let reject = std::mem::take(&mut left);
            Ok(Box::new(MockCodec::new(MockConfig {
                reject_configure: reject,
                ..Default::default()
            })))
        })
    }

    #[test]
    fn stream_fault_restarts_capture_once() {
        let mut config = config(PixelFormat::Mjpeg, &[StreamType::Mjpeg]);
        config.pipeline.restart_attempts = 1;
        let source = SyntheticCapture::new(config.capture.clone())
            .unwrap()
            .with_stream_fault_after(2);
        let router = router(&config);
        let mut pipeline = Pipeline::new(
            config,
            Box::new(source),
            rejecting(0),
            router,
            flume::bounded(1).1,
        );
        pipeline.start().unwrap();
        for _ in 0..5 {
            pipeline.step().unwrap();
        }
        let stats = pipeline.stats();
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.captured, 4);
        assert_eq!(stats.published[StreamType::Mjpeg.index()], 4);
    }

    /// Camera whose queue can't be freed while a codec still reads its buffers
    struct ImportedBuffers {
        inner: SyntheticCapture,
        codec: Arc<MockStats>,
    }

    impl CaptureSource for ImportedBuffers {
        fn start(&mut self) -> Result<NegotiatedFormat> {
            self.inner.start()
        }

        fn format(&self) -> NegotiatedFormat {
            self.inner.format()
        }

        fn next_frame(&mut self, timeout: Duration) -> Result<CaptureBuffer> {
            self.inner.next_frame(timeout)
        }

        fn data(&self, buffer: &CaptureBuffer) -> &[u8] {
            self.inner.data(buffer)
        }

        fn exports_dmabuf(&self) -> bool {
            true
        }

        fn release(&mut self, buffer: CaptureBuffer) -> Result<()> {
            self.inner.release(buffer)
        }

        fn stop(&mut self) -> Result<()> {
            if self.codec.borrowed() > 0 {
                return Err(Error::device("synthetic://imported", "buffers busy"));
            }
            self.inner.stop()
        }

        fn stats(&self) -> CaptureStats {
            self.inner.stats()
        }
    }

    #[test]
    fn restart_closes_sessions_before_stopping_the_camera() {
        let mut config = config(PixelFormat::Nv12, &[StreamType::H264]);
        config.pipeline.restart_attempts = 1;
        let h264 = MockStats::shared();
        let source = ImportedBuffers {
            inner: SyntheticCapture::new(config.capture.clone())
                .unwrap()
                .with_stream_fault_after(4),
            codec: h264.clone(),
        };
        let factory: BackendFactory = {
            let h264 = h264.clone();
            Box::new(move |_params: &SessionParams| -> Result<Box<dyn CodecBackend>> {
                Ok(Box::new(MockCodec::with_stats(
                    MockConfig {
                        lookahead: 2,
                        borrow_inputs: true,
                        ..Default::default()
                    },
                    h264.clone(),
                )))
            })
        };
        let router = router(&config);
        let mut pipeline =
            Pipeline::new(config, Box::new(source), factory, router, flume::bounded(1).1);
        pipeline.start().unwrap();
        for _ in 0..8 {
            pipeline.step().unwrap();
            assert!(pipeline.capture_stats().held <= 2);
        }

        let stats = pipeline.stats();
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.captured, 7);
        assert_eq!(h264.configures(), 2);
        // Frames 3 and 4 were still in the encoder at the fault; they are
        // flushed before the restart, and frame 5 comes out of the new session
        assert_eq!(stats.published[StreamType::H264.index()], 5);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn configure_failure_is_retried_once() {
        let config = config(PixelFormat::Nv12, &[StreamType::H264]);
        let open = |factory| {
            let source = Box::new(SyntheticCapture::new(config.capture.clone()).unwrap());
            let mut pipeline =
                Pipeline::new(config.clone(), source, factory, router(&config), flume::bounded(1).1);
            pipeline.start()
        };
        assert!(open(rejecting(1)).is_ok());
        assert!(matches!(open(rejecting(2)), Err(Error::UnsupportedFormat(_))));
    }
}
