//! `m2m-decoder`: V4L2 memory-to-memory hardware decode sessions.
//!
//! - **Resolution**: find and open the decode device by driver name
//!   ([`resolver`])
//! - **Buffers**: driver-allocated, memory-mapped pools with per-buffer
//!   ownership ([`pool`])
//! - **Session**: the configure/stream/drain/teardown state machine
//!   ([`session`])
//! - **Transfer**: threaded and polled steady-state loops ([`transfer`])
//!
//! Everything talks to hardware through the [`v4l2::VideoDevice`] trait.
//! The `stub` feature adds `stub::StubDevice`, an in-memory implementation
//! for tests.

mod error;
pub mod pool;
pub mod resolver;
pub mod session;
#[cfg(any(test, feature = "stub"))]
pub mod stub;
pub mod transfer;
pub mod v4l2;

pub use pool::{BufferPool, Ownership};
pub use resolver::{DeviceKind, DeviceResolver, DriverPattern, ProbeReport, Role};
pub use session::{
    DecodedFrame, FrameInfo, InputQueue, OutputEvent, OutputFormat, OutputQueue, SessionState,
    StreamingSession,
};
pub use transfer::{decode, run_polled, run_threaded, DecodeStats, FrameSink};
pub use v4l2::{KernelDevice, VideoDevice};
