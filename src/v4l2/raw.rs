//! Kernel ABI for the streaming ioctls
//!
//! The `v4l` crate covers capability, format and control ioctls but its
//! streams requeue implicitly on every `next()`. Capture and the M2M codec
//! need dequeue and requeue as separate steps, so the buffer ioctls are
//! declared here against the layouts in `linux/videodev2.h`.

use std::os::raw::{c_int, c_ulong, c_void};

pub const BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const BUF_TYPE_VIDEO_OUTPUT: u32 = 2;

pub const MEMORY_MMAP: u32 = 1;
pub const MEMORY_DMABUF: u32 = 4;

pub const FIELD_NONE: u32 = 1;

pub const BUF_FLAG_KEYFRAME: u32 = 0x0000_0008;
pub const BUF_FLAG_ERROR: u32 = 0x0000_0040;
pub const BUF_FLAG_LAST: u32 = 0x0010_0000;

pub const ENC_CMD_STOP: u32 = 1;
pub const DEC_CMD_STOP: u32 = 1;

// Codec controls (V4L2_CID_MPEG_BASE = 0x00990900, V4L2_CID_JPEG_CLASS_BASE = 0x009d0900)
pub const CID_MPEG_VIDEO_GOP_SIZE: u32 = 0x0099_09cb;
pub const CID_MPEG_VIDEO_BITRATE: u32 = 0x0099_09cf;
pub const CID_MPEG_VIDEO_REPEAT_SEQ_HEADER: u32 = 0x0099_09e2;
pub const CID_MPEG_VIDEO_FORCE_KEY_FRAME: u32 = 0x0099_09e5;
pub const CID_MPEG_VIDEO_H264_I_PERIOD: u32 = 0x0099_0a66;
pub const CID_JPEG_COMPRESSION_QUALITY: u32 = 0x009d_0903;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union BufferMemory {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut c_void,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: BufferMemory,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl Buffer {
    pub fn new(type_: u32, memory: u32, index: u32) -> Self {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct
        let mut buf: Buffer = unsafe { std::mem::zeroed() };
        buf.type_ = type_;
        buf.memory = memory;
        buf.index = index;
        buf
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExportBuffer {
    pub type_: u32,
    pub index: u32,
    pub plane: u32,
    pub flags: u32,
    pub fd: i32,
    pub reserved: [u32; 11],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct EncoderCmd {
    pub cmd: u32,
    pub flags: u32,
    pub raw: [u32; 8],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DecoderCmd {
    pub cmd: u32,
    pub flags: u32,
    pub raw: [u32; 16],
}

nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, RequestBuffers);
nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, Buffer);
nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, Buffer);
nix::ioctl_readwrite!(vidioc_expbuf, b'V', 16, ExportBuffer);
nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, Buffer);
nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, c_int);
nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, c_int);
nix::ioctl_readwrite!(vidioc_encoder_cmd, b'V', 77, EncoderCmd);
nix::ioctl_readwrite!(vidioc_decoder_cmd, b'V', 96, DecoderCmd);
