//! Reconfigurable codec double for tests and hardware-less runs

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::PixelFormat;
use crate::codec::{
    CodecBackend, CodecOutput, FrameInfo, InputFrame, InputUse, OutputLayout, Polled,
    SessionParams,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Frames held back internally, as a rate-controlled encoder does
    pub lookahead: usize,
    /// Inputs accepted beyond the lookahead before pushing back
    pub input_capacity: usize,
    /// Fail the submit after this many accepted frames, once
    pub fail_after: Option<u64>,
    /// Number of configure calls to refuse with `UnsupportedFormat`
    pub reject_configure: u32,
    /// Keep reading the caller's input until the frame is emitted, like a
    /// unit importing DMA-BUFs
    pub borrow_inputs: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            lookahead: 0,
            input_capacity: 4,
            fail_after: None,
            reject_configure: 0,
            borrow_inputs: false,
        }
    }
}

/// Counters shared with the test that created the codec
#[derive(Debug, Default)]
pub struct MockStats {
    configures: AtomicU32,
    bitrate_kbps: AtomicU32,
    submitted: AtomicU64,
    emitted: AtomicU64,
    key_frame_requests: AtomicU64,
    /// Inputs the codec still reads from
    borrowed: AtomicU64,
}

impl MockStats {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn configures(&self) -> u32 {
        self.configures.load(Ordering::Relaxed)
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate_kbps.load(Ordering::Relaxed)
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn key_frame_requests(&self) -> u64 {
        self.key_frame_requests.load(Ordering::Relaxed)
    }

    pub fn borrowed(&self) -> u64 {
        self.borrowed.load(Ordering::Relaxed)
    }
}

struct Queued {
    sequence: u64,
    timestamp_us: u64,
}

/// Emits synthetic bitstreams in submit order.
///
/// H264 output is Annex-B with SPS/PPS/IDR on key frames, JPEG output is
/// framed by SOI/EOI, raw output is a plane of the configured size.
pub struct MockCodec {
    config: MockConfig,
    stats: Arc<MockStats>,
    params: Option<SessionParams>,
    queued: VecDeque<Queued>,
    released: Vec<u64>,
    slots: Vec<Option<Vec<u8>>>,
    running: bool,
    draining: bool,
    force_key: bool,
    since_key: Option<u32>,
    accepted: u64,
}

impl MockCodec {
    pub fn new(config: MockConfig) -> Self {
        Self::with_stats(config, MockStats::shared())
    }

    pub fn with_stats(config: MockConfig, stats: Arc<MockStats>) -> Self {
        Self {
            config,
            stats,
            params: None,
            queued: VecDeque::new(),
            released: Vec::new(),
            slots: Vec::new(),
            running: false,
            draining: false,
            force_key: false,
            since_key: None,
            accepted: 0,
        }
    }

    /// Drop everything queued; borrowed inputs go back to their owner
    fn forget_queued(&mut self) {
        if self.config.borrow_inputs {
            self.stats
                .borrowed
                .fetch_sub(self.queued.len() as u64, Ordering::Relaxed);
        }
        self.queued.clear();
    }

    fn encode(&mut self, item: &Queued, params: &SessionParams) -> (Vec<u8>, bool) {
        let mut payload = Vec::with_capacity(32);
        let stamp = item.sequence.to_le_bytes();
        match params.output {
            PixelFormat::H264 => {
                let key = self.force_key
                    || self.since_key.map_or(true, |n| n + 1 >= params.gop_size.max(1));
                if key {
                    self.force_key = false;
                    self.since_key = Some(0);
                    payload.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f]);
                    payload.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80]);
                    payload.extend_from_slice(&[0, 0, 0, 1, 0x65]);
                } else {
                    self.since_key = self.since_key.map(|n| n + 1);
                    payload.extend_from_slice(&[0, 0, 0, 1, 0x41]);
                }
                payload.extend_from_slice(&stamp);
                payload.extend_from_slice(&params.bitrate_kbps.to_le_bytes());
                (payload, key)
            }
            PixelFormat::Mjpeg => {
                payload.extend_from_slice(&[0xff, 0xd8]);
                payload.extend_from_slice(&stamp);
                payload.extend_from_slice(&[0xff, 0xd9]);
                (payload, true)
            }
            raw => {
                let size = raw.frame_size(params.width, params.height, params.width);
                payload.resize(size, item.sequence as u8);
                (payload, true)
            }
        }
    }
}

impl CodecBackend for MockCodec {
    fn name(&self) -> &str {
        "mock"
    }

    fn configure(&mut self, params: &SessionParams) -> Result<OutputLayout> {
        if self.config.reject_configure > 0 {
            self.config.reject_configure -= 1;
            return Err(Error::UnsupportedFormat(format!(
                "mock refuses {} -> {}",
                params.input, params.output
            )));
        }
        self.stats.configures.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bitrate_kbps
            .store(params.bitrate_kbps, Ordering::Relaxed);
        self.params = Some(*params);
        self.slots = vec![None; params.buffer_count.max(1) as usize];
        self.forget_queued();
        self.draining = false;
        self.since_key = None;
        Ok(OutputLayout {
            width: params.width,
            height: params.height,
            stride: if params.output.is_compressed() { 0 } else { params.width },
        })
    }

    fn start(&mut self) -> Result<()> {
        self.running = true;
        Ok(())
    }

    fn submit(&mut self, frame: &InputFrame<'_>) -> Result<InputUse> {
        if self.draining || !self.running {
            return Err(Error::codec("mock", "not accepting input"));
        }
        if self.config.fail_after.is_some_and(|n| self.accepted >= n) {
            self.config.fail_after = None;
            return Err(Error::codec("mock", "injected hardware fault"));
        }
        if self.queued.len() >= self.config.lookahead + self.config.input_capacity {
            return Err(Error::Backpressure);
        }
        self.queued.push_back(Queued {
            sequence: frame.sequence,
            timestamp_us: frame.timestamp_us,
        });
        self.accepted += 1;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(if self.config.borrow_inputs {
            self.stats.borrowed.fetch_add(1, Ordering::Relaxed);
            InputUse::Borrowed
        } else {
            InputUse::Copied
        })
    }

    fn poll(&mut self, _timeout: Duration) -> Result<Polled> {
        let ready = self.queued.len() > self.config.lookahead
            || (self.draining && !self.queued.is_empty());
        if !ready {
            return Ok(if self.draining {
                Polled::Drained
            } else {
                Polled::Pending
            });
        }
        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            // Every output slot is leased out
            return Ok(Polled::Pending);
        };
        let (Some(params), Some(item)) = (self.params, self.queued.pop_front()) else {
            return Ok(Polled::Pending);
        };

        let (payload, key_frame) = self.encode(&item, &params);
        let info = FrameInfo {
            key_frame,
            timestamp_us: item.timestamp_us,
            sequence: item.sequence,
            bytes_used: payload.len(),
        };
        self.slots[slot] = Some(payload);
        if self.config.borrow_inputs {
            self.released.push(item.sequence);
            self.stats.borrowed.fetch_sub(1, Ordering::Relaxed);
        }
        self.stats.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(Polled::Frame(CodecOutput::new(slot, info)))
    }

    fn output_data(&self, output: &CodecOutput) -> &[u8] {
        self.slots
            .get(output.slot)
            .and_then(|s| s.as_deref())
            .unwrap_or(&[])
    }

    fn recycle(&mut self, output: CodecOutput) -> Result<()> {
        match self.slots.get_mut(output.slot) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::codec("mock", format!("slot {} not leased", output.slot))),
        }
    }

    fn released_inputs(&mut self, released: &mut Vec<u64>) -> Result<()> {
        released.append(&mut self.released);
        Ok(())
    }

    fn imports_dmabuf(&self) -> bool {
        self.config.borrow_inputs
    }

    fn begin_drain(&mut self) -> Result<()> {
        self.draining = true;
        Ok(())
    }

    fn request_key_frame(&mut self) -> Result<bool> {
        self.stats.key_frame_requests.fetch_add(1, Ordering::Relaxed);
        self.force_key = true;
        Ok(true)
    }

    fn close(&mut self) {
        self.running = false;
        self.draining = false;
        self.forget_queued();
        self.released.clear();
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(output: PixelFormat) -> SessionParams {
        SessionParams {
            input: PixelFormat::Mjpeg,
            output,
            width: 8,
            height: 4,
            stride: 0,
            fps: 30,
            bitrate_kbps: 500,
            gop_size: 30,
            quality: 80,
            zero_copy: false,
            buffer_count: 2,
        }
    }

    fn input(sequence: u64) -> InputFrame<'static> {
        InputFrame {
            format: PixelFormat::Mjpeg,
            data: &[0xff, 0xd8, 0xff, 0xd9],
            dmabuf: None,
            timestamp_us: 1000 * sequence,
            sequence,
        }
    }

    #[test]
    fn decoder_emits_full_planes() {
        let mut codec = MockCodec::new(MockConfig::default());
        let layout = codec.configure(&params(PixelFormat::Nv12)).unwrap();
        assert_eq!(layout.stride, 8);
        codec.start().unwrap();
        codec.submit(&input(7)).unwrap();
        let Polled::Frame(out) = codec.poll(Duration::ZERO).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(codec.output_data(&out).len(), 8 * 4 * 3 / 2);
        assert_eq!(out.info.timestamp_us, 7000);
        codec.recycle(out).unwrap();
    }

    #[test]
    fn stalls_while_all_outputs_are_leased() {
        let mut codec = MockCodec::new(MockConfig::default());
        codec.configure(&params(PixelFormat::Mjpeg)).unwrap();
        codec.start().unwrap();
        for seq in 1..=3 {
            codec.submit(&input(seq)).unwrap();
        }
        let Polled::Frame(a) = codec.poll(Duration::ZERO).unwrap() else {
            panic!()
        };
        let Polled::Frame(b) = codec.poll(Duration::ZERO).unwrap() else {
            panic!()
        };
        assert!(matches!(codec.poll(Duration::ZERO).unwrap(), Polled::Pending));
        codec.recycle(a).unwrap();
        assert!(matches!(codec.poll(Duration::ZERO).unwrap(), Polled::Frame(_)));
        codec.recycle(b).unwrap();
    }

    #[test]
    fn borrowed_inputs_are_released_on_emit() {
        let mut codec = MockCodec::new(MockConfig {
            lookahead: 1,
            borrow_inputs: true,
            ..Default::default()
        });
        codec.configure(&params(PixelFormat::Mjpeg)).unwrap();
        codec.start().unwrap();
        assert_eq!(codec.submit(&input(1)).unwrap(), InputUse::Borrowed);
        assert_eq!(codec.submit(&input(2)).unwrap(), InputUse::Borrowed);

        let mut released = Vec::new();
        let Polled::Frame(out) = codec.poll(Duration::ZERO).unwrap() else {
            panic!()
        };
        codec.released_inputs(&mut released).unwrap();
        assert_eq!(released, vec![1]);
        assert_eq!(codec.stats.borrowed(), 1);
        codec.recycle(out).unwrap();

        codec.close();
        assert_eq!(codec.stats.borrowed(), 0);
    }

    #[test]
    fn drained_once_empty() {
        let mut codec = MockCodec::new(MockConfig {
            lookahead: 1,
            ..Default::default()
        });
        codec.configure(&params(PixelFormat::H264)).unwrap();
        codec.start().unwrap();
        codec.submit(&input(1)).unwrap();
        assert!(matches!(codec.poll(Duration::ZERO).unwrap(), Polled::Pending));
        codec.begin_drain().unwrap();
        assert!(codec.submit(&input(2)).is_err());
        let Polled::Frame(out) = codec.poll(Duration::ZERO).unwrap() else {
            panic!()
        };
        assert!(out.info.key_frame);
        codec.recycle(out).unwrap();
        assert!(matches!(codec.poll(Duration::ZERO).unwrap(), Polled::Drained));
    }
}
