//! The demuxer interface consumed by the decode session.

use m2m_common::{CodecId, DemuxError};

/// One compressed frame, ready to be copied into an input buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

/// A source of compressed video frames for a single stream.
///
/// Implementations release their resources on drop.
pub trait Demuxer: Send {
    /// Codec of the selected video stream.
    fn codec_id(&self) -> CodecId;

    /// Codec-specific header bytes in the form the hardware expects
    /// (start-code delimited parameter sets for H.264). May be empty.
    fn extradata(&self) -> &[u8];

    /// Next compressed frame, `Ok(None)` at end of stream.
    fn next_packet(&mut self) -> Result<Option<Packet>, DemuxError>;
}
