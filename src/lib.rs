pub mod capture;
pub mod codec;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod router;
pub mod server;
pub mod utils;
pub mod v4l2;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use error::{Error, Result};
pub use frame::{EncodedFrame, StreamType};

/// Environment prefix, e.g. `V4L2MPP_CODEC__BITRATE_KBPS=4000`
pub const ENV_PREFIX: &str = "V4L2MPP";

/// System configuration, resolved once at startup and shared read-only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub codec: CodecConfig,
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node, `synthetic://` for the built-in test pattern, empty to auto-detect
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub timeout_ms: u64,
    /// Largest accepted difference between requested and negotiated size, in pixels
    pub size_tolerance: u32,
    pub use_dmabuf: bool, // DMA-BUF export for zero-copy into the codec
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CodecBackendKind {
    /// V4L2 memory-to-memory hardware codec
    M2m,
    /// CPU JPEG codec, no H264
    Software,
    /// Test double
    Mock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub backend: CodecBackendKind,
    pub decoder_device: String,
    pub h264_device: String,
    pub jpeg_device: String,
    pub bitrate_kbps: u32,
    pub gop_size: u32,
    pub jpeg_quality: u8,
    pub buffer_count: u32,
    pub poll_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    /// Pass decoded planes to the encoder as DMA-BUF where supported
    pub zero_copy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Fixed header before each payload
    Framed,
    /// Bare payloads, for consumers that split the byte stream themselves
    Raw,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub snapshot_socket: Option<PathBuf>,
    pub mjpeg_socket: Option<PathBuf>,
    pub h264_socket: Option<PathBuf>,
    /// Outbound frames buffered per client
    pub queue_depth: usize,
    /// Permission bits applied to socket files, e.g. 0o660
    pub socket_mode: Option<u32>,
    pub framing: Framing,
    pub key_frame_on_join: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub cpu_affinity: Option<usize>,
    pub stats_interval_secs: u64,
    /// Attempts to resubmit a frame the codec refused with backpressure
    pub submit_retries: u32,
    /// Capture restarts allowed after a streaming fault before giving up
    pub restart_attempts: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 1280,
            height: 720,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            timeout_ms: 2000,
            size_tolerance: 16,
            use_dmabuf: false,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            backend: CodecBackendKind::M2m,
            decoder_device: "/dev/video10".into(),
            h264_device: "/dev/video11".into(),
            jpeg_device: "/dev/video31".into(),
            bitrate_kbps: 2000,
            gop_size: 30,
            jpeg_quality: 80,
            buffer_count: 4,
            poll_timeout_ms: 100,
            drain_timeout_ms: 2000,
            zero_copy: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            snapshot_socket: None,
            mjpeg_socket: None,
            h264_socket: None,
            queue_depth: 4,
            socket_mode: None,
            framing: Framing::Framed,
            key_frame_on_join: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cpu_affinity: None,
            stats_interval_secs: 10,
            submit_retries: 8,
            restart_attempts: 1,
        }
    }
}

impl CaptureConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// USB cameras deliver compressed frames, MIPI sensors raw planes
    pub fn is_compressed(&self) -> bool {
        self.format.is_compressed()
    }
}

impl CodecConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl ServerConfig {
    pub fn socket(&self, stream: StreamType) -> Option<&Path> {
        match stream {
            StreamType::Snapshot => self.snapshot_socket.as_deref(),
            StreamType::Mjpeg => self.mjpeg_socket.as_deref(),
            StreamType::H264 => self.h264_socket.as_deref(),
        }
    }

    pub fn enabled(&self, stream: StreamType) -> bool {
        self.socket(stream).is_some()
    }
}

impl Config {
    /// Layer an optional TOML file and the environment over the defaults
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.capture;
        if c.width == 0 || c.height == 0 || c.fps == 0 {
            return Err(Error::Config(format!(
                "invalid capture mode {}x{}@{}",
                c.width, c.height, c.fps
            )));
        }
        if c.buffer_count < 2 {
            return Err(Error::Config(
                "capture.buffer_count must be at least 2".into(),
            ));
        }
        if c.format == PixelFormat::H264 {
            return Err(Error::Config("H264 capture is not supported".into()));
        }
        if self.codec.gop_size == 0 || self.codec.bitrate_kbps == 0 {
            return Err(Error::Config("codec gop_size and bitrate must be non-zero".into()));
        }
        if !(1..=100).contains(&self.codec.jpeg_quality) {
            return Err(Error::Config("codec.jpeg_quality must be 1-100".into()));
        }
        if self.server.queue_depth == 0 {
            return Err(Error::Config("server.queue_depth must be at least 1".into()));
        }
        if StreamType::ALL.iter().all(|s| !self.server.enabled(*s)) {
            return Err(Error::Config("no output socket configured".into()));
        }
        Ok(())
    }
}
