//! `m2m-common`: shared types for the M2M hardware decoder.
//!
//! This crate is the foundation the demuxer, decoder and CLI crates depend on:
//!
//! - **Codec**: `CodecId` (what a demuxer reports), `CodecFormat` (what the
//!   hardware accepts) and the [`map_codec`] table between them
//! - **Errors**: `SessionError`, `DemuxError`, `ConfigError` (thiserror-based),
//!   each session error tagged with the `Stage` it failed in
//! - **Config**: `DecoderConfig`, `Scheduling`, `Wait`

pub mod codec;
pub mod config;
pub mod error;

// Re-export commonly used items at crate root
pub use codec::{fourcc, fourcc_to_string, map_codec, CodecFormat, CodecId};
pub use config::{DecoderConfig, Scheduling, Wait};
pub use error::{ConfigError, DemuxError, SessionError, SessionResult, Stage};
