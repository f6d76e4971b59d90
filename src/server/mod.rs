//! Unix socket server: one listener per stream type, one writer task per client.

pub mod wire;

use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{EncodedFrame, StreamType};
use crate::router::{ClientConnection, FrameRouter};
use crate::{Framing, ServerConfig};

pub use wire::{Header, HEADER_LEN};

/// How long a closing server keeps writing frames already queued to a client
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// A bound listener; the socket file goes away with it
struct Listener {
    stream: StreamType,
    path: PathBuf,
    listener: UnixListener,
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

pub struct SocketServer {
    listeners: Vec<Listener>,
    router: Arc<FrameRouter>,
    framing: Framing,
}

impl SocketServer {
    /// Bind every configured socket. Must be called inside a Tokio runtime.
    pub fn bind(config: &ServerConfig, router: Arc<FrameRouter>) -> Result<Self> {
        let mut listeners = Vec::new();
        for stream in StreamType::ALL {
            let Some(path) = config.socket(stream) else {
                continue;
            };
            let listener = bind_socket(path, config.socket_mode)?;
            info!(%stream, "Listening on {}", path.display());
            listeners.push(Listener {
                stream,
                path: path.to_path_buf(),
                listener,
            });
        }
        Ok(Self {
            listeners,
            router,
            framing: config.framing,
        })
    }

    pub fn paths(&self) -> impl Iterator<Item = (StreamType, &Path)> {
        self.listeners.iter().map(|l| (l.stream, l.path.as_path()))
    }

    /// Serve until `shutdown`, then close every client and remove the sockets
    pub async fn run(self, shutdown: CancellationToken) {
        let mut accept_loops = JoinSet::new();
        for listener in self.listeners {
            accept_loops.spawn(accept_loop(
                listener,
                self.router.clone(),
                self.framing,
                shutdown.clone(),
            ));
        }
        while let Some(result) = accept_loops.join_next().await {
            if let Err(e) = result {
                warn!("Accept loop panicked: {}", e);
            }
        }
        info!("Socket server stopped");
    }
}

fn bind_socket(path: &Path, mode: Option<u32>) -> Result<UnixListener> {
    let bind_err = |source| Error::Bind {
        path: path.to_path_buf(),
        source,
    };

    // A socket left behind by a previous run; anything else is not ours to delete
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!("Removing stale socket {}", path.display());
            fs::remove_file(path).map_err(bind_err)?;
        }
        Ok(_) => {
            return Err(bind_err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "path exists and is not a socket",
            )))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(bind_err(e)),
    }

    let listener = UnixListener::bind(path).map_err(bind_err)?;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(bind_err)?;
    }
    Ok(listener)
}

async fn accept_loop(
    listener: Listener,
    router: Arc<FrameRouter>,
    framing: Framing,
    shutdown: CancellationToken,
) {
    let stream = listener.stream;
    let mut writers = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.listener.accept() => match accepted {
                Ok((socket, _)) => {
                    let client = router.join(stream);
                    writers.spawn(serve_client(
                        socket,
                        client,
                        router.clone(),
                        framing,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    // Typically EMFILE; back off instead of spinning
                    warn!(%stream, "Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = writers.join_next(), if !writers.is_empty() => {}
        }
    }

    router.close_all();
    while writers.join_next().await.is_some() {}
    drop(listener);
}

async fn serve_client(
    socket: UnixStream,
    client: Arc<ClientConnection>,
    router: Arc<FrameRouter>,
    framing: Framing,
    shutdown: CancellationToken,
) {
    let (mut reader, mut writer) = socket.into_split();
    match write_frames(&mut reader, &mut writer, &client, framing, &shutdown).await {
        Ok(()) => {}
        Err(e) => debug!(client = client.id(), "Write failed: {}", e),
    }
    router.leave(&client);
}

async fn write_frames(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    client: &ClientConnection,
    framing: Framing,
    shutdown: &CancellationToken,
) -> io::Result<()> {
    let mut discard = [0u8; 64];
    loop {
        let frame = tokio::select! {
            frame = client.next() => match frame {
                Some(frame) => frame,
                None if shutdown.is_cancelled() => return flush(writer, client, framing).await,
                None => return Ok(()),
            },
            // Clients don't talk; a read only tells us they hung up
            read = reader.read(&mut discard) => match read? {
                0 => return Ok(()),
                _ => continue,
            },
        };

        let write = write_frame(writer, &frame, framing);
        tokio::pin!(write);
        tokio::select! {
            written = &mut write => written?,
            _ = client.cancelled() => {
                // Evicted: a half-written frame is useless to the client anyway
                if !shutdown.is_cancelled() {
                    return Ok(());
                }
                match tokio::time::timeout(FLUSH_TIMEOUT, &mut write).await {
                    Ok(written) => written?,
                    Err(_) => return Ok(()),
                }
            }
        }
        client.mark_sent();

        if client.stream() == StreamType::Snapshot {
            writer.shutdown().await?;
            return Ok(());
        }
    }
}

/// Write out what is still queued when the server closes
async fn flush(writer: &mut OwnedWriteHalf, client: &ClientConnection, framing: Framing) -> io::Result<()> {
    let pending = async {
        while let Some(frame) = client.try_next() {
            write_frame(writer, &frame, framing).await?;
            client.mark_sent();
            if client.stream() == StreamType::Snapshot {
                break;
            }
        }
        Ok(())
    };
    match tokio::time::timeout(FLUSH_TIMEOUT, pending).await {
        Ok(result) => result,
        Err(_) => {
            debug!(client = client.id(), "Gave up flushing a slow client");
            Ok(())
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &EncodedFrame, framing: Framing) -> io::Result<()> {
    if framing == Framing::Framed {
        writer.write_all(&Header::for_frame(frame).encode()).await?;
    }
    writer.write_all(&frame.payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Command;
    use bytes::Bytes;
    use std::time::Instant;

    struct Fixture {
        router: Arc<FrameRouter>,
        shutdown: CancellationToken,
        server: tokio::task::JoinHandle<()>,
        dir: tempfile::TempDir,
        _commands: flume::Receiver<Command>,
    }

    fn config(dir: &Path, framing: Framing) -> ServerConfig {
        ServerConfig {
            snapshot_socket: Some(dir.join("snapshot.sock")),
            mjpeg_socket: Some(dir.join("mjpeg.sock")),
            h264_socket: Some(dir.join("h264.sock")),
            queue_depth: 4,
            socket_mode: Some(0o660),
            framing,
            key_frame_on_join: true,
        }
    }

    fn start(framing: Framing) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), framing);
        let (tx, rx) = flume::bounded(1);
        let router = Arc::new(FrameRouter::new(&config, tx));
        let server = SocketServer::bind(&config, router.clone()).unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));
        Fixture {
            router,
            shutdown,
            server: handle,
            dir,
            _commands: rx,
        }
    }

    async fn connect(fx: &Fixture, name: &str, stream: StreamType) -> UnixStream {
        let before = fx.router.client_count(stream);
        let socket = UnixStream::connect(fx.dir.path().join(name)).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while fx.router.client_count(stream) == before {
            assert!(Instant::now() < deadline, "client never joined");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        socket
    }

    async fn read_message(socket: &mut UnixStream) -> (Header, Vec<u8>) {
        let mut header = [0u8; HEADER_LEN];
        socket.read_exact(&mut header).await.unwrap();
        let header = Header::decode(&header).unwrap();
        let mut payload = vec![0u8; header.len as usize];
        socket.read_exact(&mut payload).await.unwrap();
        (header, payload)
    }

    fn frame(stream: StreamType, seq: u64, key: bool) -> EncodedFrame {
        EncodedFrame::new(stream, Bytes::from(format!("frame-{seq}")), seq * 1000, key, seq)
    }

    #[tokio::test]
    async fn mjpeg_client_receives_frames_in_order() {
        let fx = start(Framing::Framed);
        let mut socket = connect(&fx, "mjpeg.sock", StreamType::Mjpeg).await;
        for seq in 1..=3 {
            fx.router.publish(frame(StreamType::Mjpeg, seq, true));
        }
        for seq in 1..=3u64 {
            let (header, payload) = read_message(&mut socket).await;
            assert_eq!(header.stream, StreamType::Mjpeg);
            assert_eq!(header.pts_us, seq * 1000);
            assert!(header.flags.is_keyframe());
            assert_eq!(payload, format!("frame-{seq}").into_bytes());
        }
        fx.shutdown.cancel();
        fx.server.await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_sends_one_frame_then_closes() {
        let fx = start(Framing::Framed);
        fx.router.publish(frame(StreamType::Snapshot, 1, true));
        let mut socket = connect(&fx, "snapshot.sock", StreamType::Snapshot).await;
        let (header, payload) = read_message(&mut socket).await;
        assert_eq!(header.stream, StreamType::Snapshot);
        assert_eq!(payload, b"frame-1");

        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        fx.shutdown.cancel();
        fx.server.await.unwrap();
    }

    #[tokio::test]
    async fn h264_client_starts_on_a_key_frame() {
        let fx = start(Framing::Framed);
        let mut socket = connect(&fx, "h264.sock", StreamType::H264).await;
        fx.router.publish(frame(StreamType::H264, 1, false));
        fx.router.publish(frame(StreamType::H264, 2, false));
        fx.router.publish(frame(StreamType::H264, 3, true));
        fx.router.publish(frame(StreamType::H264, 4, false));

        let (first, _) = read_message(&mut socket).await;
        assert!(first.flags.is_keyframe());
        assert_eq!(first.pts_us, 3000);
        let (second, _) = read_message(&mut socket).await;
        assert_eq!(second.pts_us, 4000);
        fx.shutdown.cancel();
        fx.server.await.unwrap();
    }

    #[tokio::test]
    async fn raw_framing_writes_bare_payloads() {
        let fx = start(Framing::Raw);
        let mut socket = connect(&fx, "mjpeg.sock", StreamType::Mjpeg).await;
        fx.router.publish(frame(StreamType::Mjpeg, 1, true));
        fx.router.publish(frame(StreamType::Mjpeg, 2, true));
        let mut buf = vec![0u8; 14];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"frame-1frame-2");
        fx.shutdown.cancel();
        fx.server.await.unwrap();
    }

    #[tokio::test]
    async fn hang_up_removes_the_client() {
        let fx = start(Framing::Framed);
        let socket = connect(&fx, "mjpeg.sock", StreamType::Mjpeg).await;
        drop(socket);
        let deadline = Instant::now() + Duration::from_secs(2);
        while fx.router.client_count(StreamType::Mjpeg) > 0 {
            assert!(Instant::now() < deadline, "client never left");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        fx.shutdown.cancel();
        fx.server.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_clients_and_removes_sockets() {
        let fx = start(Framing::Framed);
        let mut socket = connect(&fx, "h264.sock", StreamType::H264).await;
        let path = fx.dir.path().join("h264.sock");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);

        fx.shutdown.cancel();
        fx.server.await.unwrap();
        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn shutdown_flushes_queued_frames() {
        let fx = start(Framing::Framed);
        let mut socket = connect(&fx, "mjpeg.sock", StreamType::Mjpeg).await;
        for seq in 1..=3 {
            fx.router.publish(frame(StreamType::Mjpeg, seq, true));
        }
        fx.shutdown.cancel();
        fx.server.await.unwrap();

        let mut got = Vec::new();
        loop {
            let mut header = [0u8; HEADER_LEN];
            if socket.read_exact(&mut header).await.is_err() {
                break;
            }
            let header = Header::decode(&header).unwrap();
            got.push(header.pts_us);
            let mut payload = vec![0u8; header.len as usize];
            socket.read_exact(&mut payload).await.unwrap();
        }
        assert_eq!(got, vec![1000, 2000, 3000]);
    }

    #[tokio::test]
    async fn replaces_stale_socket_but_not_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&stale).unwrap());
        assert!(stale.exists());
        assert!(bind_socket(&stale, None).is_ok());

        let file = dir.path().join("regular");
        fs::write(&file, b"keep").unwrap();
        assert!(matches!(bind_socket(&file, None), Err(Error::Bind { .. })));
        assert_eq!(fs::read(&file).unwrap(), b"keep");

        let missing = dir.path().join("no/such/dir.sock");
        assert!(matches!(bind_socket(&missing, None), Err(Error::Bind { .. })));
    }
}
