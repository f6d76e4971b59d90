//! Streaming I/O on V4L2 devices, shared by camera capture and M2M codecs

pub mod queue;
pub mod raw;

pub use queue::{wait, Dequeued, KernelQueue, QueueKind};

use std::time::Duration;

/// Carry a sequence number through the driver in the timestamp field.
///
/// M2M codecs copy the OUTPUT timestamp to the matching CAPTURE buffer, which
/// is the only per-frame tag that survives the round trip.
pub fn tag_timestamp(sequence: u64) -> Duration {
    Duration::from_micros(sequence)
}

pub fn untag_timestamp(timestamp: Duration) -> u64 {
    timestamp.as_micros() as u64
}
