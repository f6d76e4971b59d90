use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::capture::PixelFormat;
use crate::codec::CodecState;

/// Errors raised by the capture, codec and server layers.
///
/// Client socket failures are not represented here: they stay local to the
/// writer task of the affected connection.
#[derive(Error, Debug)]
pub enum Error {
    #[error("device {path}: {reason}")]
    Device { path: String, reason: String },

    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("streaming fault: {0}")]
    Stream(String),

    #[error("capture buffer pool exhausted: {held} of {capacity} buffers held")]
    PoolExhausted { held: usize, capacity: usize },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("codec {session}: {reason}")]
    Codec { session: String, reason: String },

    #[error("codec input queue full")]
    Backpressure,

    #[error("codec {session}: cannot {op} while {state}")]
    InvalidState {
        session: String,
        op: &'static str,
        state: CodecState,
    },

    #[error("format mismatch: session expects {expected}, got {actual}")]
    FormatMismatch {
        expected: PixelFormat,
        actual: PixelFormat,
    },

    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn device(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::Device {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn codec(session: impl Into<String>, reason: impl ToString) -> Self {
        Self::Codec {
            session: session.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors the pipeline retries locally without tearing anything down.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Backpressure)
    }

    /// Errors that end the process; a supervisor is expected to restart it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Device { .. }
                | Self::UnsupportedFormat(_)
                | Self::Codec { .. }
                | Self::Bind { .. }
                | Self::Config(_)
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Error::Backpressure.is_transient());
        assert!(Error::Timeout(Duration::from_millis(5)).is_transient());
        assert!(!Error::Stream("eio".into()).is_transient());
        assert!(!Error::Stream("eio".into()).is_fatal());
        assert!(Error::device("/dev/video0", "gone").is_fatal());
        assert!(Error::codec("h264", "fault").is_fatal());
    }

    #[test]
    fn messages_name_the_session() {
        let e = Error::InvalidState {
            session: "h264".into(),
            op: "submit",
            state: CodecState::Configured,
        };
        assert_eq!(e.to_string(), "codec h264: cannot submit while configured");
    }
}
