//! Bounded per-client frame queue with stream-aware drop policy

use std::sync::Arc;

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::frame::{EncodedFrame, StreamType};

/// What happened to a pushed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Queued,
    /// Queued after dropping this many older frames
    Dropped(usize),
    /// Not queued: the client waits for a key frame
    Skipped,
    /// Queue cleared; the client waits for the next key frame
    Resync(usize),
    /// No way to keep a decodable stream; the client must go
    Evict,
}

/// Ring of shared frame references (not the data itself)
pub struct ClientQueue {
    ring: HeapRb<Arc<EncodedFrame>>,
    stream: StreamType,
    awaiting_key: bool,
}

impl ClientQueue {
    pub fn new(stream: StreamType, capacity: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
            stream,
            // H264 decoders can't start mid-GOP
            awaiting_key: stream == StreamType::H264,
        }
    }

    pub fn push(&mut self, frame: Arc<EncodedFrame>) -> Push {
        if self.stream != StreamType::H264 {
            return match self.ring.push_overwrite(frame) {
                Some(_oldest) => Push::Dropped(1),
                None => Push::Queued,
            };
        }

        if self.awaiting_key {
            if !frame.is_key_frame() {
                return Push::Skipped;
            }
            self.awaiting_key = false;
        }
        if !self.ring.is_full() {
            self.ring.push_overwrite(frame);
            return Push::Queued;
        }

        // Full: keep the stream decodable from whatever the client gets next
        if let Some(pos) = self.ring.iter().skip(1).position(|f| f.is_key_frame()) {
            let dropped = self.ring.skip(pos + 1);
            self.ring.push_overwrite(frame);
            return Push::Dropped(dropped);
        }
        if frame.is_key_frame() {
            let dropped = self.ring.clear();
            self.ring.push_overwrite(frame);
            return Push::Dropped(dropped);
        }
        if self.ring.iter().next().is_some_and(|f| f.is_key_frame()) {
            return Push::Evict;
        }
        self.awaiting_key = true;
        Push::Resync(self.ring.clear())
    }

    pub fn pop(&mut self) -> Option<Arc<EncodedFrame>> {
        self.ring.try_pop()
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    pub fn awaiting_key(&self) -> bool {
        self.awaiting_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(stream: StreamType, seq: u64, key: bool) -> Arc<EncodedFrame> {
        Arc::new(EncodedFrame::new(stream, Bytes::from_static(b"au"), seq, key, seq))
    }

    fn h264(seq: u64, key: bool) -> Arc<EncodedFrame> {
        frame(StreamType::H264, seq, key)
    }

    fn drain(q: &mut ClientQueue) -> Vec<u64> {
        std::iter::from_fn(|| q.pop()).map(|f| f.sequence).collect()
    }

    #[test]
    fn mjpeg_drops_oldest() {
        let mut q = ClientQueue::new(StreamType::Mjpeg, 2);
        assert_eq!(q.push(frame(StreamType::Mjpeg, 1, true)), Push::Queued);
        assert_eq!(q.push(frame(StreamType::Mjpeg, 2, true)), Push::Queued);
        assert_eq!(q.push(frame(StreamType::Mjpeg, 3, true)), Push::Dropped(1));
        assert_eq!(drain(&mut q), vec![2, 3]);
    }

    #[test]
    fn h264_starts_on_a_key_frame() {
        let mut q = ClientQueue::new(StreamType::H264, 4);
        assert!(q.awaiting_key());
        assert_eq!(q.push(h264(1, false)), Push::Skipped);
        assert_eq!(q.push(h264(2, true)), Push::Queued);
        assert_eq!(q.push(h264(3, false)), Push::Queued);
        assert_eq!(drain(&mut q), vec![2, 3]);
    }

    #[test]
    fn full_queue_with_pending_key_frame_evicts() {
        let mut q = ClientQueue::new(StreamType::H264, 3);
        q.push(h264(1, true));
        q.push(h264(2, false));
        q.push(h264(3, false));
        assert_eq!(q.push(h264(4, false)), Push::Evict);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn later_key_frame_becomes_the_new_start() {
        let mut q = ClientQueue::new(StreamType::H264, 3);
        q.push(h264(1, true));
        q.push(h264(2, false));
        q.push(h264(3, true));
        assert_eq!(q.push(h264(4, false)), Push::Dropped(2));
        assert_eq!(drain(&mut q), vec![3, 4]);
    }

    #[test]
    fn incoming_key_frame_replaces_a_stale_queue() {
        let mut q = ClientQueue::new(StreamType::H264, 2);
        q.push(h264(1, true));
        q.pop();
        q.push(h264(2, false));
        q.push(h264(3, false));
        assert_eq!(q.push(h264(4, true)), Push::Dropped(2));
        assert_eq!(drain(&mut q), vec![4]);
    }

    #[test]
    fn mid_gop_overflow_resyncs() {
        let mut q = ClientQueue::new(StreamType::H264, 2);
        q.push(h264(1, true));
        q.pop();
        q.push(h264(2, false));
        q.push(h264(3, false));
        assert_eq!(q.push(h264(4, false)), Push::Resync(2));
        assert!(q.awaiting_key());
        assert!(q.is_empty());
        assert_eq!(q.push(h264(5, false)), Push::Skipped);
        assert_eq!(q.push(h264(6, true)), Push::Queued);
    }
}
