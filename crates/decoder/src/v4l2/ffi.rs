//! Raw bindings for the V4L2 multi-planar memory-to-memory ioctl interface.
//!
//! Only the subset a stateful decoder session needs is declared. Layouts
//! match `linux/videodev2.h` on LP64 targets; the size assertions at the
//! bottom of this file catch drift at compile time.
//!
//! Reference: Linux kernel `include/uapi/linux/videodev2.h`.

#![allow(non_camel_case_types)]

use std::ffi::c_void;

use nix::libc::{c_int, c_ulong, timeval};
use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

// ---------------------------------------------------------------------------
// Buffer types, memory and field
// ---------------------------------------------------------------------------

/// Decoded pictures, dequeued from the device.
pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
/// Compressed bitstream, queued to the device.
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE: u32 = 10;

pub const V4L2_MEMORY_MMAP: u32 = 1;

pub const V4L2_FIELD_ANY: u32 = 0;

pub const VIDEO_MAX_PLANES: usize = 8;

// ---------------------------------------------------------------------------
// Capability flags
// ---------------------------------------------------------------------------

pub const V4L2_CAP_VIDEO_CAPTURE_MPLANE: u32 = 0x0000_1000;
pub const V4L2_CAP_VIDEO_OUTPUT_MPLANE: u32 = 0x0000_2000;
pub const V4L2_CAP_VIDEO_M2M_MPLANE: u32 = 0x0000_4000;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
/// `device_caps` is valid and describes this node rather than the whole device.
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

// ---------------------------------------------------------------------------
// Buffer flags
// ---------------------------------------------------------------------------

pub const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;
/// Last buffer produced before end of stream.
pub const V4L2_BUF_FLAG_LAST: u32 = 0x0010_0000;

// ---------------------------------------------------------------------------
// Controls
// ---------------------------------------------------------------------------

pub const V4L2_CID_MIN_BUFFERS_FOR_CAPTURE: u32 = 0x0098_0927;

// ---------------------------------------------------------------------------
// Structures
// ---------------------------------------------------------------------------

/// `struct v4l2_capability`
#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

/// `struct v4l2_plane_pix_format`
#[repr(C, packed)]
#[derive(Copy, Clone, Default)]
pub struct v4l2_plane_pix_format {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

/// `struct v4l2_pix_format_mplane`
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct v4l2_pix_format_mplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [v4l2_plane_pix_format; VIDEO_MAX_PLANES],
    pub num_planes: u8,
    pub flags: u8,
    pub ycbcr_enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

/// The `fmt` union of `struct v4l2_format`. Only the multi-planar member is
/// used; `raw_data` fixes the size and `_align` the alignment.
#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_format_fmt {
    pub pix_mp: v4l2_pix_format_mplane,
    pub raw_data: [u8; 200],
    pub _align: [*mut c_void; 0],
}

/// `struct v4l2_format`
#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: v4l2_format_fmt,
}

/// `struct v4l2_requestbuffers`
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

/// The `m` union of `struct v4l2_plane`.
#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_plane_m {
    pub mem_offset: u32,
    pub userptr: c_ulong,
    pub fd: i32,
}

/// `struct v4l2_plane`
#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_plane {
    pub bytesused: u32,
    pub length: u32,
    pub m: v4l2_plane_m,
    pub data_offset: u32,
    pub reserved: [u32; 11],
}

/// `struct v4l2_timecode`
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

/// The `m` union of `struct v4l2_buffer`.
#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_buffer_m {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut v4l2_plane,
    pub fd: i32,
}

/// `struct v4l2_buffer`
#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_m,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

/// `struct v4l2_control`
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct v4l2_control {
    pub id: u32,
    pub value: i32,
}

/// `struct v4l2_rect`
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct v4l2_rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

/// `struct v4l2_crop`
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct v4l2_crop {
    pub type_: u32,
    pub c: v4l2_rect,
}

// ---------------------------------------------------------------------------
// Zeroed constructors
// ---------------------------------------------------------------------------

macro_rules! impl_zeroed {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $ty {
                /// All-zero value, the starting point the kernel ABI expects.
                pub fn zeroed() -> Self {
                    // SAFETY: plain-old-data kernel struct; every field is an
                    // integer, an integer array, a nullable raw pointer or a
                    // union of those, so the all-zero bit pattern is valid.
                    unsafe { std::mem::zeroed() }
                }
            }
        )*
    };
}

impl_zeroed!(v4l2_capability, v4l2_format, v4l2_plane, v4l2_buffer);

// ---------------------------------------------------------------------------
// ioctl wrappers
// ---------------------------------------------------------------------------

ioctl_read!(vidioc_querycap, b'V', 0, v4l2_capability);
ioctl_readwrite!(vidioc_g_fmt, b'V', 4, v4l2_format);
ioctl_readwrite!(vidioc_s_fmt, b'V', 5, v4l2_format);
ioctl_readwrite!(vidioc_reqbufs, b'V', 8, v4l2_requestbuffers);
ioctl_readwrite!(vidioc_querybuf, b'V', 9, v4l2_buffer);
ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
ioctl_write_ptr!(vidioc_streamon, b'V', 18, c_int);
ioctl_write_ptr!(vidioc_streamoff, b'V', 19, c_int);
ioctl_readwrite!(vidioc_g_ctrl, b'V', 27, v4l2_control);
ioctl_readwrite!(vidioc_g_crop, b'V', 59, v4l2_crop);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Decode a fixed-size, NUL-padded string field such as `driver` or `card`.
pub fn c_str_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

// ---------------------------------------------------------------------------
// Layout checks
// ---------------------------------------------------------------------------

#[cfg(target_pointer_width = "64")]
const _: () = {
    use std::mem::size_of;
    assert!(size_of::<v4l2_capability>() == 104);
    assert!(size_of::<v4l2_plane_pix_format>() == 20);
    assert!(size_of::<v4l2_pix_format_mplane>() == 192);
    assert!(size_of::<v4l2_format>() == 208);
    assert!(size_of::<v4l2_requestbuffers>() == 20);
    assert!(size_of::<v4l2_plane>() == 64);
    assert!(size_of::<v4l2_timecode>() == 16);
    assert!(size_of::<v4l2_buffer>() == 88);
    assert!(size_of::<v4l2_control>() == 8);
    assert!(size_of::<v4l2_crop>() == 20);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_request_numbers() {
        // _IOWR('V', 5, struct v4l2_format) on LP64.
        #[cfg(target_pointer_width = "64")]
        assert_eq!(
            nix::request_code_readwrite!(b'V', 5, std::mem::size_of::<v4l2_format>()),
            0xC0D0_5605
        );
        assert_eq!(
            nix::request_code_write!(b'V', 18, std::mem::size_of::<c_int>()),
            0x4004_5612
        );
    }

    #[test]
    fn string_fields_stop_at_nul() {
        let mut driver = [0u8; 16];
        driver[..11].copy_from_slice(b"s5p-mfc-dec");
        assert_eq!(c_str_field(&driver), "s5p-mfc-dec");
        assert_eq!(c_str_field(b"full"), "full");
    }
}
