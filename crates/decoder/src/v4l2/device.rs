//! The device seam: a trait over the decode-device ioctl protocol and its
//! kernel-backed implementation.
//!
//! Everything above this module (buffer pools, the streaming session, the
//! resolver) talks to hardware only through [`VideoDevice`], so the whole
//! lifecycle can be driven against a synthetic device in tests.

use std::ffi::c_void;
use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use m2m_common::Wait;
use nix::errno::Errno;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use tracing::{debug, trace};

use super::ffi::{self, c_str_field};

// ---------------------------------------------------------------------------
// Queue direction
// ---------------------------------------------------------------------------

/// One of the two independent queues of an M2M decoder.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Compressed bitstream, written by us and consumed by the device
    /// (`OUTPUT_MPLANE` in V4L2 terms).
    Input,
    /// Decoded pictures, produced by the device and read by us
    /// (`CAPTURE_MPLANE`).
    Output,
}

impl Direction {
    pub fn buf_type(self) -> u32 {
        match self {
            Self::Input => ffi::V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            Self::Output => ffi::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
        }
    }

    /// Planes per buffer: one for the bitstream, up to two for planar
    /// decoded formats such as NV12M.
    pub fn max_planes(self) -> usize {
        match self {
            Self::Input => 1,
            Self::Output => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

// ---------------------------------------------------------------------------
// Plain data exchanged with the device
// ---------------------------------------------------------------------------

/// Result of `VIDIOC_QUERYCAP`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub capabilities: u32,
    pub device_caps: u32,
}

impl Capabilities {
    /// Capability bits describing this node: `device_caps` when the driver
    /// reports it, the aggregate device capabilities otherwise.
    pub fn effective(&self) -> u32 {
        if self.capabilities & ffi::V4L2_CAP_DEVICE_CAPS != 0 {
            self.device_caps
        } else {
            self.capabilities
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneFormat {
    /// Bytes needed to hold one plane.
    pub size: u32,
    /// Bytes per line, 0 for compressed formats.
    pub stride: u32,
}

/// A multi-planar format as set or reported by the driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameFormat {
    pub pixel_format: u32,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<PlaneFormat>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

/// Per-plane layout reported by `VIDIOC_QUERYBUF`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    pub length: u32,
    pub mem_offset: u32,
}

/// A buffer handed back by `VIDIOC_DQBUF`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: Vec<u32>,
    pub flags: u32,
    pub sequence: u32,
}

impl DequeuedBuffer {
    pub fn is_last(&self) -> bool {
        self.flags & ffi::V4L2_BUF_FLAG_LAST != 0
    }

    pub fn has_error(&self) -> bool {
        self.flags & ffi::V4L2_BUF_FLAG_ERROR != 0
    }
}

/// Which queues have a buffer ready to dequeue.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub input: bool,
    pub output: bool,
    pub error: bool,
}

impl Readiness {
    pub const INPUT: Self = Self {
        input: true,
        output: false,
        error: false,
    };
    pub const OUTPUT: Self = Self {
        input: false,
        output: true,
        error: false,
    };
    pub const BOTH: Self = Self {
        input: true,
        output: true,
        error: false,
    };

    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Input => Self::INPUT,
            Direction::Output => Self::OUTPUT,
        }
    }

    pub fn any(&self) -> bool {
        self.input || self.output || self.error
    }
}

// ---------------------------------------------------------------------------
// Mapped memory
// ---------------------------------------------------------------------------

/// A plane mapped into the process. It does not unmap itself: the owner
/// hands it back to [`VideoDevice::unmap_plane`] before the device closes.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain memory shared with the device. Access is
// gated by buffer ownership in the pool, which hands out slices only while
// the buffer is held by the caller, so moving the handle between threads
// cannot introduce a data race.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes until the
    /// region is passed back to the device that produced it.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: valid for `len` bytes until unmapped (see `from_raw`), and
        // unmapping consumes `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` makes this the only live view.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

// ---------------------------------------------------------------------------
// Device trait
// ---------------------------------------------------------------------------

/// The decode-device protocol. Every call is non-blocking except `poll`.
///
/// Queue operations on different directions may be issued concurrently from
/// different threads; the driver serializes each direction independently.
pub trait VideoDevice: Send + Sync {
    /// Path the device was opened from.
    fn path(&self) -> &Path;

    fn query_caps(&self) -> nix::Result<Capabilities>;

    /// Set the pixel format of `direction` with the given per-plane sizes.
    /// Returns the format as adjusted by the driver.
    fn set_format(
        &self,
        direction: Direction,
        pixel_format: u32,
        plane_sizes: &[u32],
    ) -> nix::Result<FrameFormat>;

    fn get_format(&self, direction: Direction) -> nix::Result<FrameFormat>;

    fn get_crop(&self, direction: Direction) -> nix::Result<Rect>;

    fn get_control(&self, id: u32) -> nix::Result<i32>;

    /// Ask for `count` memory-mapped buffers; returns the granted count.
    /// A count of zero frees the queue's buffers.
    fn request_buffers(&self, direction: Direction, count: u32) -> nix::Result<u32>;

    fn query_buffer(&self, direction: Direction, index: u32) -> nix::Result<Vec<PlaneLayout>>;

    /// Map one plane read-write and shared.
    fn map_plane(&self, layout: &PlaneLayout) -> nix::Result<MappedRegion>;

    fn unmap_plane(&self, region: MappedRegion) -> nix::Result<()>;

    /// Enqueue buffer `index`; `bytes_used` has one entry per plane.
    fn queue_buffer(&self, direction: Direction, index: u32, bytes_used: &[u32]) -> nix::Result<()>;

    /// Dequeue a completed buffer; `EAGAIN` when none is ready.
    fn dequeue_buffer(&self, direction: Direction) -> nix::Result<DequeuedBuffer>;

    fn stream_on(&self, direction: Direction) -> nix::Result<()>;

    fn stream_off(&self, direction: Direction) -> nix::Result<()>;

    /// Wait until one of the queues in `interest` can be dequeued.
    fn poll(&self, interest: Readiness, wait: Wait) -> nix::Result<Readiness>;
}

// ---------------------------------------------------------------------------
// Kernel device
// ---------------------------------------------------------------------------

/// Retry a syscall wrapper while it fails with `EINTR`.
fn retry_eintr<T>(mut f: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            result => return result,
        }
    }
}

/// A V4L2 device node opened non-blocking and read-write.
#[derive(Debug)]
pub struct KernelDevice {
    fd: OwnedFd,
    path: PathBuf,
}

impl KernelDevice {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        debug!(device = %path.display(), "Opened device node");
        Ok(Self {
            fd: OwnedFd::from(file),
            path: path.to_path_buf(),
        })
    }

    fn raw(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    fn planes_array() -> [ffi::v4l2_plane; ffi::VIDEO_MAX_PLANES] {
        [ffi::v4l2_plane::zeroed(); ffi::VIDEO_MAX_PLANES]
    }

    fn buffer_for(
        direction: Direction,
        planes: &mut [ffi::v4l2_plane; ffi::VIDEO_MAX_PLANES],
    ) -> ffi::v4l2_buffer {
        let mut buf = ffi::v4l2_buffer::zeroed();
        buf.type_ = direction.buf_type();
        buf.memory = ffi::V4L2_MEMORY_MMAP;
        buf.m.planes = planes.as_mut_ptr();
        buf.length = direction.max_planes() as u32;
        buf
    }

    fn format_from_raw(fmt: &ffi::v4l2_format) -> FrameFormat {
        // SAFETY: `pix_mp` is the active member for multi-planar buffer
        // types, the only ones this module uses.
        let pix = unsafe { fmt.fmt.pix_mp };
        let plane_fmt = pix.plane_fmt;
        let count = usize::from(pix.num_planes).min(ffi::VIDEO_MAX_PLANES);
        FrameFormat {
            pixel_format: pix.pixelformat,
            width: pix.width,
            height: pix.height,
            planes: plane_fmt[..count]
                .iter()
                .map(|p| PlaneFormat {
                    size: p.sizeimage,
                    stride: p.bytesperline,
                })
                .collect(),
        }
    }
}

impl Drop for KernelDevice {
    fn drop(&mut self) {
        debug!(device = %self.path.display(), "Closing device node");
    }
}

impl VideoDevice for KernelDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn query_caps(&self) -> nix::Result<Capabilities> {
        let mut cap = ffi::v4l2_capability::zeroed();
        // SAFETY: `cap` is a valid, writable v4l2_capability.
        retry_eintr(|| unsafe { ffi::vidioc_querycap(self.raw(), &mut cap) })?;
        Ok(Capabilities {
            driver: c_str_field(&cap.driver),
            card: c_str_field(&cap.card),
            bus_info: c_str_field(&cap.bus_info),
            capabilities: cap.capabilities,
            device_caps: cap.device_caps,
        })
    }

    fn set_format(
        &self,
        direction: Direction,
        pixel_format: u32,
        plane_sizes: &[u32],
    ) -> nix::Result<FrameFormat> {
        let mut fmt = ffi::v4l2_format::zeroed();
        fmt.type_ = direction.buf_type();
        let mut plane_fmt = [ffi::v4l2_plane_pix_format::default(); ffi::VIDEO_MAX_PLANES];
        for (slot, &size) in plane_fmt.iter_mut().zip(plane_sizes) {
            slot.sizeimage = size;
        }
        // SAFETY: writing whole fields of the union member we then pass to
        // the kernel as multi-planar.
        unsafe {
            fmt.fmt.pix_mp.pixelformat = pixel_format;
            fmt.fmt.pix_mp.field = ffi::V4L2_FIELD_ANY;
            fmt.fmt.pix_mp.num_planes = plane_sizes.len().min(ffi::VIDEO_MAX_PLANES) as u8;
            fmt.fmt.pix_mp.plane_fmt = plane_fmt;
        }
        // SAFETY: `fmt` is a valid, writable v4l2_format.
        retry_eintr(|| unsafe { ffi::vidioc_s_fmt(self.raw(), &mut fmt) })?;
        Ok(Self::format_from_raw(&fmt))
    }

    fn get_format(&self, direction: Direction) -> nix::Result<FrameFormat> {
        let mut fmt = ffi::v4l2_format::zeroed();
        fmt.type_ = direction.buf_type();
        // SAFETY: `fmt` is a valid, writable v4l2_format.
        retry_eintr(|| unsafe { ffi::vidioc_g_fmt(self.raw(), &mut fmt) })?;
        Ok(Self::format_from_raw(&fmt))
    }

    fn get_crop(&self, direction: Direction) -> nix::Result<Rect> {
        let mut crop = ffi::v4l2_crop {
            type_: direction.buf_type(),
            ..Default::default()
        };
        // SAFETY: `crop` is a valid, writable v4l2_crop.
        retry_eintr(|| unsafe { ffi::vidioc_g_crop(self.raw(), &mut crop) })?;
        Ok(Rect {
            left: crop.c.left,
            top: crop.c.top,
            width: crop.c.width,
            height: crop.c.height,
        })
    }

    fn get_control(&self, id: u32) -> nix::Result<i32> {
        let mut ctrl = ffi::v4l2_control { id, value: 0 };
        // SAFETY: `ctrl` is a valid, writable v4l2_control.
        retry_eintr(|| unsafe { ffi::vidioc_g_ctrl(self.raw(), &mut ctrl) })?;
        Ok(ctrl.value)
    }

    fn request_buffers(&self, direction: Direction, count: u32) -> nix::Result<u32> {
        let mut req = ffi::v4l2_requestbuffers {
            count,
            type_: direction.buf_type(),
            memory: ffi::V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        // SAFETY: `req` is a valid, writable v4l2_requestbuffers.
        retry_eintr(|| unsafe { ffi::vidioc_reqbufs(self.raw(), &mut req) })?;
        Ok(req.count)
    }

    fn query_buffer(&self, direction: Direction, index: u32) -> nix::Result<Vec<PlaneLayout>> {
        let mut planes = Self::planes_array();
        let mut buf = Self::buffer_for(direction, &mut planes);
        buf.index = index;
        // SAFETY: `buf.m.planes` points at `planes`, which outlives the call
        // and has room for `buf.length` entries.
        retry_eintr(|| unsafe { ffi::vidioc_querybuf(self.raw(), &mut buf) })?;

        let count = (buf.length as usize).min(direction.max_planes());
        Ok(planes[..count]
            .iter()
            .map(|p| PlaneLayout {
                length: p.length,
                // SAFETY: MMAP buffers report `mem_offset`.
                mem_offset: unsafe { p.m.mem_offset },
            })
            .collect())
    }

    fn map_plane(&self, layout: &PlaneLayout) -> nix::Result<MappedRegion> {
        let len = layout.length as usize;
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        // SAFETY: a fresh shared mapping of the device at the offset the
        // driver reported for this plane; no existing memory is affected.
        let addr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.fd.as_fd(),
                layout.mem_offset as libc::off_t,
            )?
        };
        trace!(offset = layout.mem_offset, len, "Mapped plane");
        // SAFETY: mmap succeeded for `len` bytes; the mapping lives until
        // `unmap_plane`.
        Ok(unsafe { MappedRegion::from_raw(addr.cast::<u8>(), len) })
    }

    fn unmap_plane(&self, region: MappedRegion) -> nix::Result<()> {
        let addr = NonNull::new(region.as_ptr().cast::<c_void>()).ok_or(Errno::EFAULT)?;
        // SAFETY: the region came from `map_plane` and is consumed here, so
        // no slice into it can outlive the unmap.
        unsafe { munmap(addr, region.len()) }
    }

    fn queue_buffer(&self, direction: Direction, index: u32, bytes_used: &[u32]) -> nix::Result<()> {
        let mut planes = Self::planes_array();
        for (plane, &used) in planes.iter_mut().zip(bytes_used) {
            plane.bytesused = used;
        }
        let mut buf = Self::buffer_for(direction, &mut planes);
        buf.index = index;
        buf.field = ffi::V4L2_FIELD_ANY;
        buf.length = bytes_used.len().clamp(1, direction.max_planes()) as u32;
        // SAFETY: `buf.m.planes` points at `planes`, which outlives the call.
        retry_eintr(|| unsafe { ffi::vidioc_qbuf(self.raw(), &mut buf) })?;
        Ok(())
    }

    fn dequeue_buffer(&self, direction: Direction) -> nix::Result<DequeuedBuffer> {
        let mut planes = Self::planes_array();
        let mut buf = Self::buffer_for(direction, &mut planes);
        // SAFETY: `buf.m.planes` points at `planes`, which outlives the call.
        retry_eintr(|| unsafe { ffi::vidioc_dqbuf(self.raw(), &mut buf) })?;

        let count = (buf.length as usize).min(direction.max_planes());
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: planes[..count].iter().map(|p| p.bytesused).collect(),
            flags: buf.flags,
            sequence: buf.sequence,
        })
    }

    fn stream_on(&self, direction: Direction) -> nix::Result<()> {
        let buf_type = direction.buf_type() as libc::c_int;
        // SAFETY: the kernel reads one int.
        retry_eintr(|| unsafe { ffi::vidioc_streamon(self.raw(), &buf_type) })?;
        Ok(())
    }

    fn stream_off(&self, direction: Direction) -> nix::Result<()> {
        let buf_type = direction.buf_type() as libc::c_int;
        // SAFETY: the kernel reads one int.
        retry_eintr(|| unsafe { ffi::vidioc_streamoff(self.raw(), &buf_type) })?;
        Ok(())
    }

    fn poll(&self, interest: Readiness, wait: Wait) -> nix::Result<Readiness> {
        let mut events = PollFlags::empty();
        if interest.input {
            events |= PollFlags::POLLOUT | PollFlags::POLLWRNORM;
        }
        if interest.output {
            events |= PollFlags::POLLIN | PollFlags::POLLRDNORM;
        }
        let timeout = match wait {
            Wait::Forever => PollTimeout::NONE,
            Wait::Immediate => PollTimeout::ZERO,
            Wait::For(d) => PollTimeout::from(d.as_millis().min(u128::from(u16::MAX)) as u16),
        };

        let mut fds = [PollFd::new(self.fd.as_fd(), events)];
        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Readiness::default()),
            Err(e) => return Err(e),
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        Ok(Readiness {
            input: interest.input && revents.intersects(PollFlags::POLLOUT | PollFlags::POLLWRNORM),
            output: interest.output
                && revents.intersects(PollFlags::POLLIN | PollFlags::POLLRDNORM),
            error: revents.contains(PollFlags::POLLERR),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_caps_take_precedence() {
        let caps = Capabilities {
            capabilities: ffi::V4L2_CAP_DEVICE_CAPS | ffi::V4L2_CAP_VIDEO_M2M_MPLANE,
            device_caps: ffi::V4L2_CAP_STREAMING,
            ..Default::default()
        };
        assert_eq!(caps.effective(), ffi::V4L2_CAP_STREAMING);

        let legacy = Capabilities {
            capabilities: ffi::V4L2_CAP_VIDEO_M2M_MPLANE,
            device_caps: 0,
            ..Default::default()
        };
        assert_eq!(legacy.effective(), ffi::V4L2_CAP_VIDEO_M2M_MPLANE);
    }

    #[test]
    fn directions_map_to_mplane_types() {
        assert_eq!(Direction::Input.buf_type(), 10);
        assert_eq!(Direction::Output.buf_type(), 9);
        assert_eq!(Direction::Input.max_planes(), 1);
        assert_eq!(Direction::Output.max_planes(), 2);
    }

    #[test]
    fn dequeued_flags() {
        let buf = DequeuedBuffer {
            flags: ffi::V4L2_BUF_FLAG_LAST,
            ..Default::default()
        };
        assert!(buf.is_last());
        assert!(!buf.has_error());
    }

    #[test]
    fn open_missing_node_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(KernelDevice::open(&dir.path().join("video99")).is_err());
    }
}
