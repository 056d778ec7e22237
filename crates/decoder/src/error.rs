//! Mapping of driver call failures onto the session error taxonomy.

use std::io;

use m2m_common::{SessionError, Stage};
use nix::errno::Errno;

/// A failed configuration call: fatal for the session, never retried.
pub(crate) fn configuration(stage: Stage, op: &'static str) -> impl FnOnce(Errno) -> SessionError {
    move |errno| SessionError::ConfigurationFailed {
        stage,
        op,
        source: io::Error::from(errno),
    }
}

/// A failed queue operation in steady state. Would-block is the retry
/// signal, anything else a stream fault.
pub(crate) fn streaming(op: &'static str) -> impl FnOnce(Errno) -> SessionError {
    move |errno| match errno {
        Errno::EAGAIN => SessionError::TransientBusy,
        errno => SessionError::StreamFault {
            op,
            source: io::Error::from(errno),
        },
    }
}

/// A configuration failure that did not come from the driver.
pub(crate) fn rejected(stage: Stage, op: &'static str, reason: &str) -> SessionError {
    SessionError::ConfigurationFailed {
        stage,
        op,
        source: io::Error::new(io::ErrorKind::InvalidData, reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_is_transient() {
        assert!(streaming("VIDIOC_DQBUF")(Errno::EAGAIN).is_transient());
        let fault = streaming("VIDIOC_DQBUF")(Errno::EIO);
        assert!(matches!(fault, SessionError::StreamFault { op: "VIDIOC_DQBUF", .. }));
    }

    #[test]
    fn configuration_keeps_stage() {
        let err = configuration(Stage::FormatNegotiation, "VIDIOC_S_FMT")(Errno::EINVAL);
        assert_eq!(err.stage(), Stage::FormatNegotiation);
        assert!(!err.is_transient());
    }
}
