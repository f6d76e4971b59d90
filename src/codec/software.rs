//! CPU JPEG codec for boards without a usable hardware unit

use std::collections::VecDeque;
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::debug;

use crate::capture::PixelFormat;
use crate::codec::{
    convert, CodecBackend, CodecOutput, FrameInfo, InputFrame, InputUse, OutputLayout, Polled,
    SessionParams,
};
use crate::error::{Error, Result};

pub struct SoftwareCodec {
    params: Option<SessionParams>,
    slots: Vec<Option<Vec<u8>>>,
    ready: VecDeque<CodecOutput>,
    scratch: Vec<u8>,
    draining: bool,
}

impl SoftwareCodec {
    pub fn new() -> Self {
        Self {
            params: None,
            slots: Vec::new(),
            ready: VecDeque::new(),
            scratch: Vec::new(),
            draining: false,
        }
    }

    fn decode(&mut self, data: &[u8], params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
        let mut decoder = zune_jpeg::JpegDecoder::new(data);
        let rgb = decoder
            .decode()
            .map_err(|e| Error::codec("software", format!("JPEG decode: {:?}", e)))?;
        let (width, height) = decoder.dimensions().unwrap_or((0, 0));
        if (width as u32, height as u32) != (params.width, params.height) {
            return Err(Error::codec(
                "software",
                format!(
                    "frame is {}x{}, session expects {}x{}",
                    width, height, params.width, params.height
                ),
            ));
        }
        convert::rgb_to_nv12(&rgb, width, height, out);
        Ok(())
    }

    fn encode(&mut self, frame: &InputFrame<'_>, params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
        let (w, h) = (params.width as usize, params.height as usize);
        let rgb = convert::to_rgb(frame.format, frame.data, w, h, params.stride as usize)
            .ok_or_else(|| {
                Error::codec(
                    "software",
                    format!("{} byte {} frame is too short", frame.data.len(), frame.format),
                )
            })?;
        self.scratch = rgb;
        out.clear();
        JpegEncoder::new_with_quality(&mut *out, params.quality)
            .encode(&self.scratch, params.width, params.height, ExtendedColorType::Rgb8)
            .map_err(|e| Error::codec("software", format!("JPEG encode: {}", e)))
    }
}

impl Default for SoftwareCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecBackend for SoftwareCodec {
    fn name(&self) -> &str {
        "software"
    }

    fn configure(&mut self, params: &SessionParams) -> Result<OutputLayout> {
        let supported = match (params.input, params.output) {
            (PixelFormat::Mjpeg, PixelFormat::Nv12) => true,
            (PixelFormat::Nv12 | PixelFormat::Yuyv | PixelFormat::Yuv420, PixelFormat::Mjpeg) => {
                true
            }
            _ => false,
        };
        if !supported {
            return Err(Error::UnsupportedFormat(format!(
                "software codec cannot convert {} to {}",
                params.input, params.output
            )));
        }
        self.params = Some(*params);
        self.slots = vec![None; params.buffer_count.max(1) as usize];
        self.ready.clear();
        self.draining = false;
        debug!("Software codec {} -> {}", params.input, params.output);
        Ok(OutputLayout {
            width: params.width,
            height: params.height,
            stride: if params.output.is_compressed() { 0 } else { params.width },
        })
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn submit(&mut self, frame: &InputFrame<'_>) -> Result<InputUse> {
        let Some(params) = self.params else {
            return Err(Error::codec("software", "not configured"));
        };
        if self.draining {
            return Err(Error::codec("software", "submit while draining"));
        }
        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            return Err(Error::Backpressure);
        };

        let mut out = Vec::new();
        if params.output.is_compressed() {
            self.encode(frame, &params, &mut out)?;
        } else {
            self.decode(frame.data, &params, &mut out)?;
        }
        let info = FrameInfo {
            key_frame: true,
            timestamp_us: frame.timestamp_us,
            sequence: frame.sequence,
            bytes_used: out.len(),
        };
        self.slots[slot] = Some(out);
        self.ready.push_back(CodecOutput::new(slot, info));
        Ok(InputUse::Copied)
    }

    fn poll(&mut self, _timeout: Duration) -> Result<Polled> {
        Ok(match self.ready.pop_front() {
            Some(output) => Polled::Frame(output),
            None if self.draining => Polled::Drained,
            None => Polled::Pending,
        })
    }

    fn output_data(&self, output: &CodecOutput) -> &[u8] {
        self.slots
            .get(output.slot)
            .and_then(|s| s.as_deref())
            .unwrap_or(&[])
    }

    fn recycle(&mut self, output: CodecOutput) -> Result<()> {
        match self.slots.get_mut(output.slot) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::codec(
                "software",
                format!("slot {} not leased", output.slot),
            )),
        }
    }

    fn begin_drain(&mut self) -> Result<()> {
        self.draining = true;
        Ok(())
    }

    fn close(&mut self) {
        self.params = None;
        self.ready.clear();
        self.slots.clear();
        self.draining = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(input: PixelFormat, output: PixelFormat) -> SessionParams {
        SessionParams {
            input,
            output,
            width: 16,
            height: 16,
            stride: 16,
            fps: 30,
            bitrate_kbps: 0,
            gop_size: 1,
            quality: 90,
            zero_copy: false,
            buffer_count: 2,
        }
    }

    fn next(codec: &mut SoftwareCodec) -> CodecOutput {
        match codec.poll(Duration::ZERO).unwrap() {
            Polled::Frame(out) => out,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn encodes_then_decodes() {
        let mut encoder = SoftwareCodec::new();
        encoder
            .configure(&params(PixelFormat::Nv12, PixelFormat::Mjpeg))
            .unwrap();
        let plane = vec![128u8; 16 * 16 * 3 / 2];
        encoder
            .submit(&InputFrame {
                format: PixelFormat::Nv12,
                data: &plane,
                dmabuf: None,
                timestamp_us: 5,
                sequence: 1,
            })
            .unwrap();
        let jpeg_out = next(&mut encoder);
        let jpeg = encoder.output_data(&jpeg_out).to_vec();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        encoder.recycle(jpeg_out).unwrap();

        let mut decoder = SoftwareCodec::new();
        let layout = decoder
            .configure(&params(PixelFormat::Mjpeg, PixelFormat::Nv12))
            .unwrap();
        assert_eq!(layout.stride, 16);
        decoder
            .submit(&InputFrame {
                format: PixelFormat::Mjpeg,
                data: &jpeg,
                dmabuf: None,
                timestamp_us: 5,
                sequence: 1,
            })
            .unwrap();
        let decoded = next(&mut decoder);
        assert_eq!(decoded.info.bytes_used, 16 * 16 * 3 / 2);
        let luma = decoder.output_data(&decoded)[0];
        assert!(luma.abs_diff(128) < 8, "{luma}");
        decoder.recycle(decoded).unwrap();
    }

    #[test]
    fn no_h264() {
        let mut codec = SoftwareCodec::new();
        assert!(matches!(
            codec.configure(&params(PixelFormat::Nv12, PixelFormat::H264)),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn full_output_pool_pushes_back() {
        let mut codec = SoftwareCodec::new();
        codec
            .configure(&params(PixelFormat::Nv12, PixelFormat::Mjpeg))
            .unwrap();
        let plane = vec![16u8; 16 * 16 * 3 / 2];
        let frame = |sequence| InputFrame {
            format: PixelFormat::Nv12,
            data: &plane,
            dmabuf: None,
            timestamp_us: 0,
            sequence,
        };
        codec.submit(&frame(1)).unwrap();
        codec.submit(&frame(2)).unwrap();
        assert!(matches!(codec.submit(&frame(3)), Err(Error::Backpressure)));
        let out = next(&mut codec);
        codec.recycle(out).unwrap();
        codec.submit(&frame(3)).unwrap();
    }
}
