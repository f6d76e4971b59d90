//! Codec session chains and the loans they hold

use std::time::Duration;

use tracing::{debug, info, warn};

use super::sink::Sink;
use crate::capture::{NegotiatedFormat, PixelFormat};
use crate::codec::{
    BackendFactory, CodecOutput, CodecSession, CodecState, InputFrame, InputUse, SessionParams,
};
use crate::error::{Error, Result};
use crate::frame::StreamType;
use crate::Config;

// Borrower bits
pub(super) const DECODER: u8 = 1 << 0;
pub(super) const JPEG: u8 = 1 << 1;
pub(super) const H264: u8 = 1 << 2;

/// A buffer some codec sessions still read from
pub(super) struct Loan<T> {
    pub(super) sequence: u64,
    pub(super) item: T,
    pub(super) borrowers: u8,
}

pub(super) enum Chain {
    /// MJPEG camera with an H264 output: decode to a plane, encode the plane
    Transcode {
        decoder: CodecSession,
        encoder: CodecSession,
        decoded: Vec<Loan<CodecOutput>>,
    },
    /// Raw camera with an encoder per output, or an MJPEG camera passed straight through
    Direct {
        jpeg: Option<CodecSession>,
        h264: Option<CodecSession>,
    },
}

/// Codec sessions and the loans they hold
pub(super) struct Stages {
    pub(super) chain: Chain,
    pub(super) sink: Sink,
    /// Capture sequences a session stopped reading, with its borrower bit
    pub(super) released: Vec<(u64, u8)>,
    pub(super) retries: u32,
    pub(super) poll_timeout: Duration,
}

/// Submit, relieving backpressure between attempts. `None` once retries run out.
fn submit_with_retry<F>(
    session: &mut CodecSession,
    frame: &InputFrame<'_>,
    retries: u32,
    mut relieve: F,
) -> Result<Option<InputUse>>
where
    F: FnMut(&mut CodecSession) -> Result<()>,
{
    for _ in 0..=retries {
        match session.submit(frame) {
            Ok(used) => return Ok(Some(used)),
            Err(Error::Backpressure) => relieve(session)?,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Publish everything `session` has finished
fn collect(session: &mut CodecSession, sink: &mut Sink, mut wait: Duration) -> Result<()> {
    let Some(format) = session.params().map(|p| p.output) else {
        return Ok(());
    };
    while let Some(output) = session.poll(wait)? {
        wait = Duration::ZERO;
        sink.publish_output(format, session.data(&output), &output.info);
        session.recycle(output)?;
    }
    Ok(())
}

/// Give decoder planes back once the encoder is done with them
fn return_decoded(
    decoder: &mut CodecSession,
    encoder: &mut CodecSession,
    decoded: &mut Vec<Loan<CodecOutput>>,
) -> Result<()> {
    for sequence in encoder.released_inputs()? {
        if let Some(pos) = decoded.iter().position(|l| l.sequence == sequence) {
            decoder.recycle(decoded.swap_remove(pos).item)?;
        }
    }
    Ok(())
}

/// Move decoded planes into the encoder and publish what the encoder emits
fn pump(
    decoder: &mut CodecSession,
    encoder: &mut CodecSession,
    decoded: &mut Vec<Loan<CodecOutput>>,
    sink: &mut Sink,
    wait: Duration,
    retries: u32,
    poll_timeout: Duration,
) -> Result<()> {
    return_decoded(decoder, encoder, decoded)?;
    let Some(format) = decoder.params().map(|p| p.output) else {
        return Ok(());
    };
    let zero_copy = encoder.imports_dmabuf();
    let mut wait = if decoder.in_flight() > 0 {
        wait
    } else {
        Duration::ZERO
    };

    while let Some(output) = decoder.poll(wait)? {
        wait = Duration::ZERO;
        let info = output.info;
        let frame = InputFrame {
            format,
            data: decoder.data(&output),
            dmabuf: if zero_copy { decoder.dmabuf(&output) } else { None },
            timestamp_us: info.timestamp_us,
            sequence: info.sequence,
        };
        let used = submit_with_retry(encoder, &frame, retries, |s| collect(s, sink, poll_timeout))?;
        match used {
            Some(InputUse::Borrowed) => decoded.push(Loan {
                sequence: info.sequence,
                item: output,
                borrowers: H264,
            }),
            Some(InputUse::Copied) => decoder.recycle(output)?,
            None => {
                sink.drop_frame(encoder.name(), info.sequence, retries);
                decoder.recycle(output)?;
            }
        }
    }

    return_decoded(decoder, encoder, decoded)?;
    collect(encoder, sink, Duration::ZERO)
}

impl Stages {
    pub(super) fn h264(&mut self) -> Option<&mut CodecSession> {
        match &mut self.chain {
            Chain::Transcode { encoder, .. } => Some(encoder),
            Chain::Direct { h264, .. } => h264.as_mut(),
        }
    }

    /// Hand one captured frame to the first codec stage. Returns the
    /// borrower bits of the sessions that kept a reference to it.
    pub(super) fn feed(&mut self, frame: &InputFrame<'_>) -> Result<u8> {
        let Stages {
            chain,
            sink,
            retries,
            poll_timeout,
            ..
        } = self;
        let (retries, poll_timeout) = (*retries, *poll_timeout);
        let mut borrowers = 0;

        match chain {
            Chain::Transcode {
                decoder,
                encoder,
                decoded,
            } => {
                // The camera's own JPEG is the MJPEG and snapshot payload
                sink.publish_jpeg(frame.data, frame.timestamp_us);
                let used = submit_with_retry(decoder, frame, retries, |d| {
                    pump(d, encoder, decoded, sink, poll_timeout, retries, poll_timeout)
                })?;
                match used {
                    Some(InputUse::Borrowed) => borrowers |= DECODER,
                    Some(InputUse::Copied) => {}
                    None => sink.drop_frame(decoder.name(), frame.sequence, retries),
                }
            }
            Chain::Direct { jpeg, h264 } => {
                if frame.format.is_compressed() {
                    sink.publish_jpeg(frame.data, frame.timestamp_us);
                }
                for (session, bit) in [(jpeg, JPEG), (h264, H264)] {
                    let Some(session) = session else {
                        continue;
                    };
                    let used = submit_with_retry(session, frame, retries, |s| {
                        collect(s, sink, poll_timeout)
                    })?;
                    match used {
                        Some(InputUse::Borrowed) => borrowers |= bit,
                        Some(InputUse::Copied) => {}
                        None => sink.drop_frame(session.name(), frame.sequence, retries),
                    }
                }
            }
        }
        Ok(borrowers)
    }

    /// Publish finished frames and gather released capture buffers.
    ///
    /// `wait` bounds the first poll of the stage the others depend on.
    pub(super) fn service(&mut self, wait: Duration) -> Result<()> {
        let Stages {
            chain,
            sink,
            released,
            retries,
            poll_timeout,
        } = self;

        match chain {
            Chain::Transcode {
                decoder,
                encoder,
                decoded,
            } => {
                pump(decoder, encoder, decoded, sink, wait, *retries, *poll_timeout)?;
                released.extend(decoder.released_inputs()?.into_iter().map(|s| (s, DECODER)));
            }
            Chain::Direct { jpeg, h264 } => {
                for (session, bit) in [(jpeg, JPEG), (h264, H264)] {
                    if let Some(session) = session {
                        collect(session, sink, wait)?;
                        released.extend(session.released_inputs()?.into_iter().map(|s| (s, bit)));
                    }
                }
            }
        }
        Ok(())
    }

    pub(super) fn force_key_frame(&mut self) -> Result<()> {
        let Some(h264) = self.h264() else {
            return Ok(());
        };
        if h264.state() != CodecState::Running {
            return Ok(());
        }
        if !h264.request_key_frame()? {
            debug!("Encoder can't force a key frame, waiting for the next GOP");
        }
        Ok(())
    }

    /// Re-target the H264 encoder, flushing what it holds to the clients first
    pub(super) fn set_bitrate(&mut self, kbps: u32, timeout: Duration) -> Result<()> {
        let Stages { chain, sink, .. } = self;
        let h264 = match chain {
            Chain::Transcode { encoder, .. } => encoder,
            Chain::Direct { h264: Some(h264), .. } => h264,
            Chain::Direct { h264: None, .. } => return Ok(()),
        };
        let Some(mut params) = h264.params().copied() else {
            return Ok(());
        };
        if params.bitrate_kbps == kbps {
            return Ok(());
        }
        info!("H264 bitrate {} -> {} kbps", params.bitrate_kbps, kbps);
        params.bitrate_kbps = kbps;
        h264.reconfigure(params, timeout, |data, info| {
            sink.publish_output(PixelFormat::H264, data, info);
            Ok(())
        })
    }

    /// Flush every session into the router
    pub(super) fn drain(&mut self, timeout: Duration) -> Result<()> {
        let Stages {
            chain,
            sink,
            retries,
            poll_timeout,
            ..
        } = self;
        let (retries, poll_timeout) = (*retries, *poll_timeout);

        match chain {
            Chain::Transcode {
                decoder,
                encoder,
                decoded,
            } => {
                let format = decoder.params().map_or(PixelFormat::Nv12, |p| p.output);
                if encoder.imports_dmabuf() {
                    // Planes lent to the encoder must come back before the
                    // decoder can finish; whatever it still holds is lost
                    encoder.drain(timeout, |data, info| {
                        sink.publish_output(PixelFormat::H264, data, info);
                        Ok(())
                    })?;
                    for loan in decoded.drain(..) {
                        decoder.recycle(loan.item)?;
                    }
                    let lost = decoder.drain(timeout, |_, _| Ok(()))?;
                    if lost > 0 {
                        warn!("{} decoded frames lost at shutdown", lost);
                    }
                    sink.stats.dropped += lost;
                } else {
                    decoder.drain(timeout, |data, info| {
                        let frame = InputFrame {
                            format,
                            data,
                            dmabuf: None,
                            timestamp_us: info.timestamp_us,
                            sequence: info.sequence,
                        };
                        let used = submit_with_retry(encoder, &frame, retries, |s| {
                            collect(s, sink, poll_timeout)
                        })?;
                        if used.is_none() {
                            sink.drop_frame(encoder.name(), info.sequence, retries);
                        }
                        Ok(())
                    })?;
                    encoder.drain(timeout, |data, info| {
                        sink.publish_output(PixelFormat::H264, data, info);
                        Ok(())
                    })?;
                }
            }
            Chain::Direct { jpeg, h264 } => {
                for session in [jpeg, h264].into_iter().flatten() {
                    let Some(format) = session.params().map(|p| p.output) else {
                        continue;
                    };
                    session.drain(timeout, |data, info| {
                        sink.publish_output(format, data, info);
                        Ok(())
                    })?;
                }
            }
        }
        Ok(())
    }

    pub(super) fn close(&mut self) {
        match &mut self.chain {
            Chain::Transcode {
                decoder,
                encoder,
                decoded,
            } => {
                encoder.close();
                decoded.clear();
                decoder.close();
            }
            Chain::Direct { jpeg, h264 } => {
                for session in [jpeg, h264].into_iter().flatten() {
                    session.close();
                }
            }
        }
        self.released.clear();
    }
}

/// Create, configure and start one session; a failed setup is retried once
fn open_session(factory: &mut BackendFactory, name: &str, params: SessionParams) -> Result<CodecSession> {
    let mut session = CodecSession::new(name, factory(&params)?);
    if let Err(e) = session.configure(params).and_then(|()| session.start()) {
        warn!(session = name, "Codec setup failed, retrying once: {}", e);
        session.close();
        session.configure(params)?;
        session.start()?;
    }
    Ok(session)
}

/// Sessions needed to turn `format` into every enabled output
pub(super) fn open_chain(
    config: &Config,
    factory: &mut BackendFactory,
    format: &NegotiatedFormat,
    source_exports: bool,
) -> Result<Chain> {
    let codec = &config.codec;
    let server = &config.server;
    let params = |input: PixelFormat, output: PixelFormat| {
        let mut p = SessionParams::from_config(
            codec,
            input,
            output,
            format.width,
            format.height,
            format.fps,
        );
        p.zero_copy = codec.zero_copy && source_exports;
        if !input.is_compressed() {
            p.stride = format.stride;
        }
        p
    };

    if format.format.is_compressed() {
        if !server.enabled(StreamType::H264) {
            return Ok(Chain::Direct {
                jpeg: None,
                h264: None,
            });
        }
        let decoder = open_session(factory, "decoder", params(format.format, PixelFormat::Nv12))?;
        let layout = decoder.output_layout();
        let mut encode = params(PixelFormat::Nv12, PixelFormat::H264);
        if let Some(layout) = layout {
            encode.width = layout.width;
            encode.height = layout.height;
            encode.stride = layout.stride;
        }
        encode.zero_copy = codec.zero_copy && decoder.exports_dmabuf();
        let encoder = open_session(factory, "h264", encode)?;
        return Ok(Chain::Transcode {
            decoder,
            encoder,
            decoded: Vec::new(),
        });
    }

    let jpeg = if server.enabled(StreamType::Snapshot) || server.enabled(StreamType::Mjpeg) {
        Some(open_session(factory, "jpeg", params(format.format, PixelFormat::Mjpeg))?)
    } else {
        None
    };
    let h264 = if server.enabled(StreamType::H264) {
        Some(open_session(factory, "h264", params(format.format, PixelFormat::H264))?)
    } else {
        None
    };
    Ok(Chain::Direct { jpeg, h264 })
}
