//! V4L2 kernel interface: raw ABI bindings and the device seam built on them.

pub mod device;
pub mod ffi;

pub use device::{
    Capabilities, DequeuedBuffer, Direction, FrameFormat, KernelDevice, MappedRegion, PlaneFormat,
    PlaneLayout, Readiness, Rect, VideoDevice,
};
