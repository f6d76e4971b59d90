use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::ringbuf::{ClientQueue, Push};
use crate::frame::{EncodedFrame, StreamType};

#[derive(Default)]
struct Stats {
    enqueued: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    /// Microseconds after connect of the last completed write
    last_send_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    pub queued: usize,
    pub enqueued: u64,
    pub sent: u64,
    pub dropped: u64,
    pub skipped: u64,
    pub last_send: Option<Duration>,
}

/// One subscriber: the queue the router fills and the writer drains
pub struct ClientConnection {
    id: u64,
    stream: StreamType,
    queue: Mutex<ClientQueue>,
    ready: Notify,
    cancel: CancellationToken,
    connected_at: Instant,
    stats: CachePadded<Stats>,
}

impl ClientConnection {
    pub fn new(id: u64, stream: StreamType, depth: usize, cancel: CancellationToken) -> Self {
        Self {
            id,
            stream,
            queue: Mutex::new(ClientQueue::new(stream, depth)),
            ready: Notify::new(),
            cancel,
            connected_at: Instant::now(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream(&self) -> StreamType {
        self.stream
    }

    /// Producer side, never blocks on I/O
    pub fn enqueue(&self, frame: Arc<EncodedFrame>) -> Push {
        let outcome = self.queue.lock().push(frame);
        match outcome {
            Push::Queued => {}
            Push::Dropped(n) => {
                self.stats.dropped.fetch_add(n as u64, Ordering::Relaxed);
            }
            Push::Skipped => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return outcome;
            }
            Push::Resync(n) => {
                self.stats.dropped.fetch_add(n as u64 + 1, Ordering::Relaxed);
                return outcome;
            }
            Push::Evict => {
                self.close();
                return outcome;
            }
        }
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
        outcome
    }

    pub fn try_next(&self) -> Option<Arc<EncodedFrame>> {
        self.queue.lock().pop()
    }

    /// Consumer side: next queued frame, `None` once the client is closed
    pub async fn next(&self) -> Option<Arc<EncodedFrame>> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some(frame) = self.try_next() {
                return Some(frame);
            }
            tokio::select! {
                _ = self.ready.notified() => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    pub fn mark_sent(&self) {
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        let elapsed = self.connected_at.elapsed().as_micros() as u64;
        self.stats.last_send_us.store(elapsed.max(1), Ordering::Relaxed);
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn stats(&self) -> ClientStats {
        let last = self.stats.last_send_us.load(Ordering::Relaxed);
        ClientStats {
            queued: self.queue.lock().len(),
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            sent: self.stats.sent.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            last_send: (last > 0).then(|| Duration::from_micros(last)),
        }
    }
}
