//! Frame fan-out from the capture/codec loop to socket clients.
//!
//! Publishing takes one short lock per client queue; a slow client only
//! ever loses its own frames.

pub mod client;
pub mod ringbuf;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use client::{ClientConnection, ClientStats};
pub use ringbuf::{ClientQueue, Push};

use crate::frame::{EncodedFrame, StreamType};
use crate::pipeline::Command;
use crate::ServerConfig;

#[derive(Default)]
struct Counters {
    published: [AtomicU64; 3],
    rejected: AtomicU64,
    evicted: AtomicU64,
    key_frame_requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub published: [u64; 3],
    pub rejected: u64,
    pub evicted: u64,
    pub key_frame_requests: u64,
    pub clients: [usize; 3],
}

pub struct FrameRouter {
    clients: [RwLock<Vec<Arc<ClientConnection>>>; 3],
    last_sequence: [AtomicU64; 3],
    snapshot: ArcSwapOption<EncodedFrame>,
    commands: flume::Sender<Command>,
    queue_depth: usize,
    key_frame_on_join: bool,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    counters: CachePadded<Counters>,
}

impl FrameRouter {
    pub fn new(config: &ServerConfig, commands: flume::Sender<Command>) -> Self {
        Self {
            clients: Default::default(),
            last_sequence: Default::default(),
            snapshot: ArcSwapOption::empty(),
            commands,
            queue_depth: config.queue_depth,
            key_frame_on_join: config.key_frame_on_join,
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            counters: CachePadded::new(Counters::default()),
        }
    }

    /// Register a subscriber for `stream`
    pub fn join(&self, stream: StreamType) -> Arc<ClientConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Snapshot clients take exactly one frame
        let depth = match stream {
            StreamType::Snapshot => 1,
            _ => self.queue_depth,
        };
        let client = Arc::new(ClientConnection::new(
            id,
            stream,
            depth,
            self.shutdown.child_token(),
        ));

        if stream == StreamType::Snapshot {
            if let Some(latest) = self.snapshot.load_full() {
                client.enqueue(latest);
            }
        }

        let count = {
            let mut list = self.clients[stream.index()].write();
            list.push(client.clone());
            list.len()
        };
        metrics::gauge!("router_clients", "stream" => stream.as_str()).set(count as f64);
        info!(client = id, %stream, clients = count, "Client joined");

        if stream == StreamType::H264 && self.key_frame_on_join {
            self.request_key_frame();
        }
        client
    }

    pub fn leave(&self, client: &ClientConnection) {
        let stream = client.stream();
        let count = {
            let mut list = self.clients[stream.index()].write();
            list.retain(|c| c.id() != client.id());
            list.len()
        };
        client.close();
        metrics::gauge!("router_clients", "stream" => stream.as_str()).set(count as f64);
        let stats = client.stats();
        info!(
            client = client.id(),
            %stream,
            sent = stats.sent,
            dropped = stats.dropped,
            "Client left"
        );
    }

    /// Hand a finished frame to every client of its stream.
    ///
    /// Returns the number of clients that queued it. Frames whose sequence
    /// doesn't advance are refused.
    pub fn publish(&self, frame: EncodedFrame) -> usize {
        let stream = frame.stream;
        let last = &self.last_sequence[stream.index()];
        let previous = last.load(Ordering::Acquire);
        if frame.sequence <= previous {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                %stream,
                sequence = frame.sequence,
                previous,
                "Refusing out-of-order frame"
            );
            return 0;
        }
        last.store(frame.sequence, Ordering::Release);

        let frame = Arc::new(frame);
        if stream == StreamType::Snapshot {
            self.snapshot.store(Some(frame.clone()));
        }
        self.counters.published[stream.index()].fetch_add(1, Ordering::Relaxed);
        metrics::counter!("router_frames_published_total", "stream" => stream.as_str())
            .increment(1);

        let mut queued = 0;
        let mut resync = false;
        let mut evicted = Vec::new();
        for client in self.clients[stream.index()].read().iter() {
            match client.enqueue(frame.clone()) {
                Push::Queued | Push::Dropped(_) => queued += 1,
                Push::Skipped => {}
                Push::Resync(dropped) => {
                    debug!(client = client.id(), dropped, "Client fell behind mid-GOP");
                    resync = true;
                }
                Push::Evict => evicted.push(client.clone()),
            }
        }

        for client in evicted {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("router_clients_evicted_total", "stream" => stream.as_str())
                .increment(1);
            warn!(client = client.id(), %stream, "Evicting client: queue full with its start frame");
            self.leave(&client);
        }
        if resync {
            self.request_key_frame();
        }
        queued
    }

    /// Ask the pipeline for an intra frame; coalesced while one is pending
    pub fn request_key_frame(&self) {
        if self.commands.try_send(Command::ForceKeyFrame).is_ok() {
            self.counters
                .key_frame_requests
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn latest_snapshot(&self) -> Option<Arc<EncodedFrame>> {
        self.snapshot.load_full()
    }

    pub fn client_count(&self, stream: StreamType) -> usize {
        self.clients[stream.index()].read().len()
    }

    /// Close every client connection
    pub fn close_all(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> RouterStats {
        let c = &self.counters;
        RouterStats {
            published: std::array::from_fn(|i| c.published[i].load(Ordering::Relaxed)),
            rejected: c.rejected.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            key_frame_requests: c.key_frame_requests.load(Ordering::Relaxed),
            clients: std::array::from_fn(|i| self.clients[i].read().len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn router(depth: usize) -> (FrameRouter, flume::Receiver<Command>) {
        let (tx, rx) = flume::bounded(1);
        let config = ServerConfig {
            queue_depth: depth,
            ..Default::default()
        };
        (FrameRouter::new(&config, tx), rx)
    }

    fn frame(stream: StreamType, seq: u64, key: bool) -> EncodedFrame {
        EncodedFrame::new(stream, Bytes::from(vec![seq as u8; 4]), seq * 10, key, seq)
    }

    #[test]
    fn rejects_non_increasing_sequences() {
        let (router, _rx) = router(4);
        let client = router.join(StreamType::Mjpeg);
        assert_eq!(router.publish(frame(StreamType::Mjpeg, 1, true)), 1);
        assert_eq!(router.publish(frame(StreamType::Mjpeg, 1, true)), 0);
        assert_eq!(router.publish(frame(StreamType::Mjpeg, 2, true)), 1);
        // Other streams keep their own counters
        assert_eq!(router.publish(frame(StreamType::H264, 1, true)), 0);
        assert_eq!(router.stats().rejected, 1);

        let got: Vec<u64> = std::iter::from_fn(|| client.try_next())
            .map(|f| f.sequence)
            .collect();
        assert_eq!(got, vec![1, 2]);
    }

    #[test]
    fn late_snapshot_joiner_gets_the_cached_frame() {
        let (router, _rx) = router(4);
        router.publish(frame(StreamType::Snapshot, 1, true));
        router.publish(frame(StreamType::Snapshot, 2, true));
        let client = router.join(StreamType::Snapshot);
        assert_eq!(client.try_next().map(|f| f.sequence), Some(2));
        assert!(client.try_next().is_none());
    }

    #[test]
    fn h264_join_requests_a_key_frame() {
        let (router, rx) = router(4);
        let _client = router.join(StreamType::H264);
        assert!(matches!(rx.try_recv(), Ok(Command::ForceKeyFrame)));
        // Coalesced while the first request is unread
        router.join(StreamType::H264);
        router.join(StreamType::H264);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn mid_gop_overflow_requests_a_key_frame_and_skips_to_it() {
        let (router, rx) = router(2);
        let client = router.join(StreamType::H264);
        assert!(matches!(rx.try_recv(), Ok(Command::ForceKeyFrame)));

        router.publish(frame(StreamType::H264, 1, true));
        assert_eq!(client.try_next().map(|f| f.sequence), Some(1));
        for seq in 2..=4 {
            router.publish(frame(StreamType::H264, seq, false));
        }
        assert!(matches!(rx.try_recv(), Ok(Command::ForceKeyFrame)));
        assert_eq!(router.stats().key_frame_requests, 2);
        assert_eq!(router.client_count(StreamType::H264), 1);

        router.publish(frame(StreamType::H264, 5, false));
        router.publish(frame(StreamType::H264, 6, true));
        let got: Vec<u64> = std::iter::from_fn(|| client.try_next())
            .map(|f| f.sequence)
            .collect();
        assert_eq!(got, vec![6]);
    }

    #[test]
    fn slow_client_is_evicted_without_affecting_others() {
        let (router, _rx) = router(2);
        let slow = router.join(StreamType::H264);
        let fast = router.join(StreamType::H264);

        router.publish(frame(StreamType::H264, 1, true));
        assert!(fast.try_next().is_some());
        for seq in 2..=3 {
            router.publish(frame(StreamType::H264, seq, false));
            assert!(fast.try_next().is_some());
        }

        assert!(slow.is_closed());
        assert_eq!(router.client_count(StreamType::H264), 1);
        assert_eq!(router.stats().evicted, 1);
        assert!(!fast.is_closed());
    }

    #[test]
    fn close_all_cancels_clients() {
        let (router, _rx) = router(2);
        let client = router.join(StreamType::Mjpeg);
        router.close_all();
        assert!(client.is_closed());
    }
}
