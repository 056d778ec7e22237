//! Decoder configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How the two transfer directions are scheduled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheduling {
    /// One thread per direction, each blocking in `poll`.
    #[default]
    Threaded,
    /// A single thread multiplexing both directions with `poll`.
    Polled,
}

/// Poll timeout.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wait {
    Forever,
    Immediate,
    For(Duration),
}

impl Wait {
    /// Interpret a millisecond count the way `poll(2)` does: negative waits
    /// forever, zero returns immediately.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => Self::Forever,
            0 => Self::Immediate,
            ms => Self::For(Duration::from_millis(ms as u64)),
        }
    }
}

/// Decode session configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Substring the decoder's driver name must contain.
    pub driver: String,
    /// Size of each compressed-stream buffer. Must hold the largest frame.
    pub input_buffer_size: u32,
    /// Compressed-stream buffers to request.
    pub input_buffers: u32,
    /// Decoded-picture buffers to request when the driver does not report
    /// its minimum.
    pub output_buffers: u32,
    /// Decoded-picture buffers added on top of the driver minimum.
    pub extra_output_buffers: u32,
    /// Poll timeout in milliseconds (negative = forever, 0 = immediate).
    pub poll_timeout_ms: i64,
    pub scheduling: Scheduling,
    /// Directory of video-class device entries.
    pub sysfs_dir: PathBuf,
    /// Directory holding the device special files.
    pub dev_dir: PathBuf,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            driver: "s5p-mfc-dec".to_string(),
            input_buffer_size: 1024 * 1024,
            input_buffers: 16,
            output_buffers: 4,
            extra_output_buffers: 2,
            poll_timeout_ms: 1000,
            scheduling: Scheduling::Threaded,
            sysfs_dir: PathBuf::from("/sys/class/video4linux"),
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

impl DecoderConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn poll_timeout(&self) -> Wait {
        Wait::from_millis(self.poll_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn wait_from_millis() {
        assert_eq!(Wait::from_millis(-1), Wait::Forever);
        assert_eq!(Wait::from_millis(0), Wait::Immediate);
        assert_eq!(
            Wait::from_millis(250),
            Wait::For(Duration::from_millis(250))
        );
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "driver": "hantro-vpu", "scheduling": "polled" }}"#).unwrap();

        let config = DecoderConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.driver, "hantro-vpu");
        assert_eq!(config.scheduling, Scheduling::Polled);
        assert_eq!(config.input_buffers, DecoderConfig::default().input_buffers);
    }

    #[test]
    fn bad_json_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = DecoderConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
