//! `m2m-demux`: the demuxer collaborator of the decode pipeline.
//!
//! Given a media file path, a [`Demuxer`] reports the video codec, the
//! codec-specific header bytes ("extradata") and then yields one compressed
//! frame per [`Packet`]. Closing is `Drop`.
//!
//! - Raw elementary streams (`.h264`, `.264`, `.m4v`, `.m1v`, `.m2v`, `.h263`)
//!   are split natively by [`annexb::ElementaryStreamDemuxer`]
//! - Other containers need the `ffmpeg` cargo feature

pub mod annexb;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod nal;
pub mod traits;

use std::path::Path;

use m2m_common::DemuxError;
use tracing::debug;

pub use annexb::ElementaryStreamDemuxer;
pub use traits::{Demuxer, Packet};

/// Open `path` with the demuxer that understands it.
pub fn open_demuxer(path: &Path) -> Result<Box<dyn Demuxer>, DemuxError> {
    if let Some(codec) = annexb::codec_for_path(path) {
        debug!(path = %path.display(), ?codec, "Opening as elementary stream");
        return Ok(Box::new(ElementaryStreamDemuxer::open(path, codec)?));
    }

    #[cfg(feature = "ffmpeg")]
    {
        debug!(path = %path.display(), "Opening through FFmpeg");
        Ok(Box::new(ffmpeg::FfmpegDemuxer::open(path)?))
    }

    #[cfg(not(feature = "ffmpeg"))]
    {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        Err(DemuxError::UnsupportedContainer(format!(
            "{ext:?} (rebuild with the `ffmpeg` feature for container support)"
        )))
    }
}
