//! Central error types for the decode session (thiserror-based).

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecId;

/// Pipeline stage an error is attributed to, for user-facing reporting.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Resolution,
    FormatNegotiation,
    BufferSetup,
    Streaming,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolution => "device resolution",
            Self::FormatNegotiation => "format negotiation",
            Self::BufferSetup => "buffer setup",
            Self::Streaming => "streaming",
        })
    }
}

/// Errors raised while driving a decode session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no capability-valid device found for driver {driver:?}")]
    DeviceNotFound { driver: String },

    #[error("unsupported codec: {}", .0.display_name())]
    UnsupportedCodec(CodecId),

    #[error("{op} failed during {stage}: {source}")]
    ConfigurationFailed {
        stage: Stage,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A non-blocking queue operation would have blocked. Retry after polling.
    #[error("queue operation would block")]
    TransientBusy,

    #[error("{op} failed while streaming: {source}")]
    StreamFault {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{op} is not allowed in state {state}")]
    InvalidState {
        stage: Stage,
        op: &'static str,
        state: &'static str,
    },

    #[error("refusing to start streaming on the {0} queue with no buffer queued")]
    NothingQueued(&'static str),

    #[error("buffer {index} is owned by the driver")]
    BufferBusy { index: usize },

    #[error("buffer index {index} out of range (pool has {count})")]
    InvalidBuffer { index: usize, count: usize },

    #[error("demuxer error: {0}")]
    Demux(#[from] DemuxError),

    #[error("frame sink failed: {0}")]
    Sink(#[source] io::Error),
}

impl SessionError {
    /// The stage this error is reported against.
    pub fn stage(&self) -> Stage {
        match self {
            Self::DeviceNotFound { .. } => Stage::Resolution,
            Self::UnsupportedCodec(_) => Stage::FormatNegotiation,
            Self::ConfigurationFailed { stage, .. } | Self::InvalidState { stage, .. } => *stage,
            Self::NothingQueued(_) => Stage::BufferSetup,
            Self::TransientBusy
            | Self::StreamFault { .. }
            | Self::BufferBusy { .. }
            | Self::InvalidBuffer { .. }
            | Self::Demux(_)
            | Self::Sink(_) => Stage::Streaming,
        }
    }

    /// `true` for the would-block retry signal, which is never a failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientBusy)
    }
}

/// Convenience Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Demuxer/container errors.
#[derive(Error, Debug)]
pub enum DemuxError {
    #[error("cannot open {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("unsupported container: {0}")]
    UnsupportedContainer(String),

    #[error("no video stream found")]
    NoVideoStream,

    #[error("malformed stream: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_follow_taxonomy() {
        let not_found = SessionError::DeviceNotFound {
            driver: "s5p-mfc-dec".into(),
        };
        assert_eq!(not_found.stage(), Stage::Resolution);
        assert_eq!(
            SessionError::UnsupportedCodec(CodecId::Vp9).stage(),
            Stage::FormatNegotiation
        );

        let reqbufs = SessionError::ConfigurationFailed {
            stage: Stage::BufferSetup,
            op: "VIDIOC_REQBUFS",
            source: io::Error::from_raw_os_error(22),
        };
        assert_eq!(reqbufs.stage(), Stage::BufferSetup);
        assert!(reqbufs.to_string().contains("VIDIOC_REQBUFS"));
        assert!(reqbufs.to_string().contains("buffer setup"));
    }

    #[test]
    fn only_would_block_is_transient() {
        assert!(SessionError::TransientBusy.is_transient());
        let fault = SessionError::StreamFault {
            op: "VIDIOC_DQBUF",
            source: io::Error::from_raw_os_error(5),
        };
        assert!(!fault.is_transient());
        assert_eq!(fault.stage(), Stage::Streaming);
    }
}
