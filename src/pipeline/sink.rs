//! Publishing end of the run loop

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use super::PipelineStats;
use crate::capture::PixelFormat;
use crate::codec::FrameInfo;
use crate::frame::{Sequencer, StreamType};
use crate::router::FrameRouter;

pub(super) struct Sink {
    pub(super) router: Arc<FrameRouter>,
    pub(super) sequencer: Sequencer,
    pub(super) enabled: [bool; 3],
    pub(super) stats: PipelineStats,
}

impl Sink {
    pub(super) fn wants_jpeg(&self) -> bool {
        self.enabled[StreamType::Snapshot.index()] || self.enabled[StreamType::Mjpeg.index()]
    }

    pub(super) fn publish(&mut self, stream: StreamType, payload: Bytes, pts_us: u64, key_frame: bool) {
        if !self.enabled[stream.index()] {
            return;
        }
        let frame = self.sequencer.frame(stream, payload, pts_us, key_frame);
        self.router.publish(frame);
        self.stats.published[stream.index()] += 1;
    }

    /// One JPEG feeds both the snapshot cache and the MJPEG stream
    pub(super) fn publish_jpeg(&mut self, data: &[u8], pts_us: u64) {
        if !self.wants_jpeg() {
            return;
        }
        let payload = Bytes::copy_from_slice(data);
        self.publish(StreamType::Snapshot, payload.clone(), pts_us, true);
        self.publish(StreamType::Mjpeg, payload, pts_us, true);
    }

    pub(super) fn publish_output(&mut self, format: PixelFormat, data: &[u8], info: &FrameInfo) {
        match format {
            PixelFormat::H264 => self.publish(
                StreamType::H264,
                Bytes::copy_from_slice(data),
                info.timestamp_us,
                info.key_frame,
            ),
            PixelFormat::Mjpeg => self.publish_jpeg(data, info.timestamp_us),
            other => warn!("Discarding {} output", other),
        }
    }

    pub(super) fn drop_frame(&mut self, stage: &str, sequence: u64, retries: u32) {
        warn!(
            stage,
            sequence, "Codec still full after {} retries, dropping frame", retries
        );
        self.stats.dropped += 1;
        metrics::counter!("pipeline_frames_dropped_total", "stage" => stage.to_string())
            .increment(1);
    }
}
