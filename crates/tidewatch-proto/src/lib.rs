//! Shared protocol definitions for the tidewatch server and its consoles.
//!
//! The channel between the two only carries whole text messages, so every
//! binary payload travels base64-encoded inside a JSON envelope. Keeping the
//! envelope shapes and the command grammar here lets the server and the
//! console agree on them without pulling in either runtime.

mod command;
mod envelope;
mod key;

pub use command::{Command, CommandVerb};
pub use envelope::{
    FileEntry, FrameData, Handshake, ServerEvent, ServerMessage, Status, StatusKind,
};
pub use key::normalize_key;

use std::time::Duration;

/// Name the server announces in its handshake and health responses.
pub const SERVER_NAME: &str = "TIDEWATCH";

/// Protocol version carried in the handshake.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum decoded payload carried by one `file_chunk` envelope.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Maximum number of frames carried by one `video_batch` envelope.
pub const FRAME_BATCH_SIZE: usize = 30;

/// Fixed capture and playback rate.
pub const CAPTURE_FPS: u32 = 30;

/// JPEG quality used when encoding captured frames.
pub const JPEG_QUALITY: u8 = 65;

/// Accepted `start_cam` durations, in seconds, inclusive.
pub const MIN_RECORDING_SECS: u32 = 5;
pub const MAX_RECORDING_SECS: u32 = 300;

/// Default ceiling for streamable resources (500 MiB).
pub const DEFAULT_MAX_STREAM_BYTES: u64 = 500 * 1024 * 1024;

/// Interval between two consecutive frames at [`CAPTURE_FPS`].
pub fn frame_interval() -> Duration {
    Duration::from_nanos(1_000_000_000 / u64::from(CAPTURE_FPS))
}

/// Number of `file_chunk` envelopes a resource of `size` bytes produces.
pub fn expected_chunks(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}
