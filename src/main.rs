//! v4l2-mpp: camera capture, hardware encode and Unix socket fan-out

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use v4l2_mpp::capture::{self, PixelFormat};
use v4l2_mpp::pipeline::{Command, Pipeline};
use v4l2_mpp::router::FrameRouter;
use v4l2_mpp::server::SocketServer;
use v4l2_mpp::{codec, utils, CodecBackendKind, Config, Framing, StreamType};

#[derive(Parser, Debug, Clone)]
#[command(name = "v4l2-mpp", version, about = "Capture, encode and serve camera frames over Unix sockets")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Capture device, `synthetic://` for a test pattern, empty to auto-detect
    #[arg(short, long)]
    device: Option<String>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long)]
    fps: Option<u32>,

    /// Capture pixel format
    #[arg(long, value_enum)]
    format: Option<PixelFormat>,

    /// H264 bitrate in kbps
    #[arg(long)]
    bitrate: Option<u32>,

    /// Frames between H264 key frames
    #[arg(long)]
    gop: Option<u32>,

    #[arg(long)]
    snapshot_socket: Option<PathBuf>,

    #[arg(long)]
    mjpeg_socket: Option<PathBuf>,

    #[arg(long)]
    h264_socket: Option<PathBuf>,

    #[arg(long, value_enum)]
    codec_backend: Option<CodecBackendKind>,

    #[arg(long)]
    decoder_device: Option<String>,

    #[arg(long)]
    h264_device: Option<String>,

    #[arg(long)]
    jpeg_device: Option<String>,

    /// Frames buffered per client before dropping
    #[arg(long)]
    queue_depth: Option<usize>,

    #[arg(long, value_enum)]
    framing: Option<Framing>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// More logging, repeatable
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// Layer the flags over the file and environment
    fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        let capture = &mut config.capture;
        if let Some(device) = &self.device {
            capture.device = device.clone();
        }
        if let Some(width) = self.width {
            capture.width = width;
        }
        if let Some(height) = self.height {
            capture.height = height;
        }
        if let Some(fps) = self.fps {
            capture.fps = fps;
        }
        if let Some(format) = self.format {
            capture.format = format;
        }

        let codec = &mut config.codec;
        if let Some(bitrate) = self.bitrate {
            codec.bitrate_kbps = bitrate;
        }
        if let Some(gop) = self.gop {
            codec.gop_size = gop;
        }
        if let Some(backend) = self.codec_backend {
            codec.backend = backend;
        }
        if let Some(device) = &self.decoder_device {
            codec.decoder_device = device.clone();
        }
        if let Some(device) = &self.h264_device {
            codec.h264_device = device.clone();
        }
        if let Some(device) = &self.jpeg_device {
            codec.jpeg_device = device.clone();
        }

        let server = &mut config.server;
        if self.snapshot_socket.is_some() {
            server.snapshot_socket = self.snapshot_socket.clone();
        }
        if self.mjpeg_socket.is_some() {
            server.mjpeg_socket = self.mjpeg_socket.clone();
        }
        if self.h264_socket.is_some() {
            server.h264_socket = self.h264_socket.clone();
        }
        if let Some(depth) = self.queue_depth {
            server.queue_depth = depth;
        }
        if let Some(framing) = self.framing {
            server.framing = framing;
        }
        Ok(config)
    }

    fn filter(&self) -> EnvFilter {
        let level = match self.verbose {
            0 => self.log_level.as_str(),
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("v4l2_mpp={level},warn")))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(cli.filter())
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("v4l2-mpp {} launching", env!("CARGO_PKG_VERSION"));

    let mut config = cli.load_config()?;
    // Auto-detect capture device if needed
    if config.capture.device.is_empty() {
        let found = tokio::task::spawn_blocking(utils::auto_detect_device).await??;
        config.capture.device = found.path;
        config.capture.format = found.format;
    }
    config.validate()?;
    info!("Using capture device: {} ({})", config.capture.device, config.capture.format);

    let (commands, command_rx) = flume::bounded(4);
    let router = Arc::new(FrameRouter::new(&config.server, commands.clone()));
    let server = SocketServer::bind(&config.server, router.clone())?;
    for (stream, path) in server.paths() {
        info!("{} clients: {}", stream, path.display());
    }

    let source = capture::open(&config.capture)?;
    let pipeline = Pipeline::new(
        config.clone(),
        source,
        codec::factory(config.codec.clone()),
        router.clone(),
        command_rx,
    );

    let shutdown = CancellationToken::new();
    let server_shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.run(server_shutdown.clone()));
    let signals = tokio::spawn(watch_signals(
        cli.clone(),
        config.codec.bitrate_kbps,
        commands,
        shutdown.clone(),
    ));
    let pipeline_task = tokio::task::spawn_blocking({
        let shutdown = shutdown.clone();
        move || pipeline.run(shutdown)
    });

    // The pipeline drains into the router before any socket closes
    let outcome = pipeline_task.await;
    shutdown.cancel();
    server_shutdown.cancel();
    if let Err(e) = server_task.await {
        warn!("Socket server task failed: {}", e);
    }
    signals.abort();

    let stats = outcome.map_err(|e| eyre!("pipeline thread panicked: {}", e))??;
    info!(
        captured = stats.captured,
        dropped = stats.dropped,
        snapshot = stats.published[StreamType::Snapshot.index()],
        mjpeg = stats.published[StreamType::Mjpeg.index()],
        h264 = stats.published[StreamType::H264.index()],
        "v4l2-mpp shutting down"
    );
    Ok(())
}

/// SIGINT/SIGTERM stop the pipeline; SIGHUP re-reads the configuration and
/// applies a changed H264 bitrate
async fn watch_signals(
    cli: Cli,
    mut bitrate_kbps: u32,
    commands: flume::Sender<Command>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interrupt.recv() => {
                info!("Interrupted, shutting down");
                shutdown.cancel();
            }
            _ = terminate.recv() => {
                info!("Terminated, shutting down");
                shutdown.cancel();
            }
            _ = hangup.recv() => match cli.load_config().and_then(|c| Ok(c.validate().map(|()| c)?)) {
                Ok(config) if config.codec.bitrate_kbps != bitrate_kbps => {
                    info!("Reloaded configuration, bitrate {} kbps", config.codec.bitrate_kbps);
                    bitrate_kbps = config.codec.bitrate_kbps;
                    if commands.send_async(Command::SetBitrate(bitrate_kbps)).await.is_err() {
                        break;
                    }
                }
                Ok(_) => info!("Reloaded configuration, nothing to apply"),
                Err(e) => error!("Configuration reload failed: {}", e),
            },
        }
    }
    Ok(())
}
