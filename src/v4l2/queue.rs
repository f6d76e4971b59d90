use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::raw::c_int;
use std::sync::Arc;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, warn};
use v4l::device::Handle;

use super::raw;

/// Direction of a buffer queue as seen from the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Device writes, application reads (camera frames, codec results)
    Capture,
    /// Application writes, device reads (codec input)
    Output,
}

impl QueueKind {
    fn buf_type(self) -> u32 {
        match self {
            QueueKind::Capture => raw::BUF_TYPE_VIDEO_CAPTURE,
            QueueKind::Output => raw::BUF_TYPE_VIDEO_OUTPUT,
        }
    }
}

/// Metadata of a buffer returned by the driver
#[derive(Debug, Clone, Copy)]
pub struct Dequeued {
    pub index: usize,
    pub bytes_used: usize,
    pub flags: u32,
    pub sequence: u32,
    pub timestamp: Duration,
}

impl Dequeued {
    pub fn is_key_frame(&self) -> bool {
        self.flags & raw::BUF_FLAG_KEYFRAME != 0
    }

    pub fn is_last(&self) -> bool {
        self.flags & raw::BUF_FLAG_LAST != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & raw::BUF_FLAG_ERROR != 0
    }
}

/// One V4L2 buffer queue with explicit queue/dequeue.
///
/// Buffers are either driver-allocated and mapped into the process (MMAP) or
/// imported per queue operation from another device (DMABUF).
pub struct KernelQueue {
    handle: Arc<Handle>,
    kind: QueueKind,
    memory: u32,
    count: usize,
    maps: Vec<MmapMut>,
    exported: Vec<OwnedFd>,
    streaming: bool,
}

impl KernelQueue {
    /// Allocate `count` driver buffers and map them
    pub fn mmap(handle: Arc<Handle>, kind: QueueKind, count: u32) -> io::Result<Self> {
        let granted = request(&handle, kind, raw::MEMORY_MMAP, count)?;
        let fd = handle.fd();

        let mut maps = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let mut buf = raw::Buffer::new(kind.buf_type(), raw::MEMORY_MMAP, index);
            unsafe { raw::vidioc_querybuf(fd, &mut buf) }.map_err(io::Error::from)?;

            // SAFETY: offset and length come from QUERYBUF for this fd; the
            // mapping is dropped before the buffers are freed (see Drop).
            let map = unsafe {
                MmapOptions::new()
                    .offset(u64::from(buf.m.offset))
                    .len(buf.length as usize)
                    .map_mut(fd)?
            };
            maps.push(map);
        }

        debug!(?kind, buffers = granted, "Mapped kernel buffers");
        Ok(Self {
            handle,
            kind,
            memory: raw::MEMORY_MMAP,
            count: granted as usize,
            maps,
            exported: Vec::new(),
            streaming: false,
        })
    }

    /// Reserve `count` slots that take DMA-BUF fds from another device
    pub fn dmabuf(handle: Arc<Handle>, kind: QueueKind, count: u32) -> io::Result<Self> {
        let granted = request(&handle, kind, raw::MEMORY_DMABUF, count)?;
        debug!(?kind, buffers = granted, "Reserved DMA-BUF import slots");
        Ok(Self {
            handle,
            kind,
            memory: raw::MEMORY_DMABUF,
            count: granted as usize,
            maps: Vec::new(),
            exported: Vec::new(),
            streaming: false,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn imports_dmabuf(&self) -> bool {
        self.memory == raw::MEMORY_DMABUF
    }

    /// Export every mapped buffer as a DMA-BUF fd
    pub fn export(&mut self) -> io::Result<()> {
        if self.imports_dmabuf() || !self.exported.is_empty() {
            return Ok(());
        }
        let fd = self.handle.fd();
        for index in 0..self.count as u32 {
            let mut exp = raw::ExportBuffer {
                type_: self.kind.buf_type(),
                index,
                flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
                ..Default::default()
            };
            unsafe { raw::vidioc_expbuf(fd, &mut exp) }.map_err(io::Error::from)?;
            // SAFETY: EXPBUF hands us a fresh fd that nothing else owns
            self.exported.push(unsafe { OwnedFd::from_raw_fd(exp.fd) });
        }
        Ok(())
    }

    pub fn exported(&self, index: usize) -> Option<BorrowedFd<'_>> {
        self.exported.get(index).map(|fd| fd.as_fd())
    }

    pub fn capacity(&self, index: usize) -> usize {
        self.maps.get(index).map_or(0, |m| m.len())
    }

    pub fn data(&self, index: usize, len: usize) -> &[u8] {
        match self.maps.get(index) {
            Some(map) => &map[..len.min(map.len())],
            None => &[],
        }
    }

    pub fn data_mut(&mut self, index: usize) -> &mut [u8] {
        match self.maps.get_mut(index) {
            Some(map) => &mut map[..],
            None => &mut [],
        }
    }

    /// Hand a mapped buffer to the driver
    pub fn queue(&mut self, index: usize, bytes_used: usize, timestamp: Duration) -> io::Result<()> {
        let mut buf = self.buffer(index, bytes_used, timestamp);
        buf.m.offset = 0;
        buf.length = self.capacity(index) as u32;
        unsafe { raw::vidioc_qbuf(self.handle.fd(), &mut buf) }.map_err(io::Error::from)?;
        Ok(())
    }

    /// Hand a foreign DMA-BUF to the driver in slot `index`
    pub fn queue_dmabuf(
        &mut self,
        index: usize,
        fd: BorrowedFd<'_>,
        bytes_used: usize,
        timestamp: Duration,
    ) -> io::Result<()> {
        let mut buf = self.buffer(index, bytes_used, timestamp);
        buf.m.fd = fd.as_raw_fd();
        buf.length = bytes_used as u32;
        unsafe { raw::vidioc_qbuf(self.handle.fd(), &mut buf) }.map_err(io::Error::from)?;
        Ok(())
    }

    fn buffer(&self, index: usize, bytes_used: usize, timestamp: Duration) -> raw::Buffer {
        let mut buf = raw::Buffer::new(self.kind.buf_type(), self.memory, index as u32);
        buf.bytesused = bytes_used as u32;
        buf.field = raw::FIELD_NONE;
        buf.timestamp = libc::timeval {
            tv_sec: timestamp.as_secs() as libc::time_t,
            tv_usec: timestamp.subsec_micros() as libc::suseconds_t,
        };
        buf
    }

    /// Take a finished buffer back; `WouldBlock` when none is ready
    pub fn dequeue(&mut self) -> io::Result<Dequeued> {
        let mut buf = raw::Buffer::new(self.kind.buf_type(), self.memory, 0);
        match unsafe { raw::vidioc_dqbuf(self.handle.fd(), &mut buf) } {
            Ok(_) => Ok(Dequeued {
                index: buf.index as usize,
                bytes_used: buf.bytesused as usize,
                flags: buf.flags,
                sequence: buf.sequence,
                timestamp: Duration::from_secs(buf.timestamp.tv_sec as u64)
                    + Duration::from_micros(buf.timestamp.tv_usec as u64),
            }),
            Err(Errno::EAGAIN) => Err(io::ErrorKind::WouldBlock.into()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn stream_on(&mut self) -> io::Result<()> {
        let type_ = self.kind.buf_type() as c_int;
        unsafe { raw::vidioc_streamon(self.handle.fd(), &type_) }.map_err(io::Error::from)?;
        self.streaming = true;
        Ok(())
    }

    /// Stop streaming; the driver returns every queued buffer
    pub fn stream_off(&mut self) -> io::Result<()> {
        if !self.streaming {
            return Ok(());
        }
        let type_ = self.kind.buf_type() as c_int;
        unsafe { raw::vidioc_streamoff(self.handle.fd(), &type_) }.map_err(io::Error::from)?;
        self.streaming = false;
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }
}

impl Drop for KernelQueue {
    fn drop(&mut self) {
        if let Err(e) = self.stream_off() {
            warn!(kind = ?self.kind, "STREAMOFF failed: {}", e);
        }
        // Buffers can only be freed once nothing maps them
        self.exported.clear();
        self.maps.clear();
        if let Err(e) = request(&self.handle, self.kind, self.memory, 0) {
            debug!(kind = ?self.kind, "Freeing buffers failed: {}", e);
        }
    }
}

fn request(handle: &Handle, kind: QueueKind, memory: u32, count: u32) -> io::Result<u32> {
    let mut req = raw::RequestBuffers {
        count,
        type_: kind.buf_type(),
        memory,
        ..Default::default()
    };
    unsafe { raw::vidioc_reqbufs(handle.fd(), &mut req) }.map_err(io::Error::from)?;
    if count > 0 && req.count == 0 {
        return Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            "driver granted no buffers",
        ));
    }
    Ok(req.count)
}

/// Wait until the device signals one of `events`; empty when the timeout hit
pub fn wait(handle: &Handle, events: PollFlags, timeout: Duration) -> io::Result<PollFlags> {
    // SAFETY: the handle outlives this call
    let fd = unsafe { BorrowedFd::borrow_raw(handle.fd()) };
    let mut fds = [PollFd::new(fd, events)];
    let ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
    match poll(&mut fds, PollTimeout::from(ms)) {
        Ok(0) | Err(Errno::EINTR) => Ok(PollFlags::empty()),
        Ok(_) => Ok(fds[0].revents().unwrap_or(PollFlags::empty())),
        Err(e) => Err(e.into()),
    }
}
