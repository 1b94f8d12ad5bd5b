//! Camera capture devices.
//!
//! A [`CaptureSource`] hands out devices; a [`CaptureDevice`] is started once,
//! yields raw RGB frames on a channel at its own pace and is stopped once.
//! Encoding to JPEG happens on the consumer side so every device only has to
//! deliver pixels.

mod ffmpeg;
mod test_pattern;

use std::io;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use thiserror::Error;
use tokio::sync::mpsc;

pub use ffmpeg::FfmpegSource;
pub use test_pattern::TestPatternSource;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("No capture device available: {0}")]
    NotFound(String),
    #[error("Failed to open capture device: {0}")]
    Open(String),
    #[error("Capture device failed: {0}")]
    Stream(String),
    #[error("Failed to encode frame: {0}")]
    Encode(String),
    #[error("Capture device I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One uncompressed frame, tightly packed RGB24.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: tidewatch_proto::CAPTURE_FPS,
        }
    }
}

impl CaptureConfig {
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

pub type FrameReceiver = mpsc::Receiver<Result<RawFrame, DeviceError>>;

pub trait CaptureSource: Send + Sync {
    fn name(&self) -> &str;

    /// Acquires a device. Fails with [`DeviceError::NotFound`] when none exists.
    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>, DeviceError>;
}

#[async_trait]
pub trait CaptureDevice: Send {
    /// Starts delivery. Returns once the device is live.
    async fn start(&mut self) -> Result<FrameReceiver, DeviceError>;

    /// Stops delivery and waits until the device is released.
    async fn stop(&mut self) -> Result<(), DeviceError>;
}

/// Source used when no camera is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCamera;

impl CaptureSource for NoCamera {
    fn name(&self) -> &str {
        "none"
    }

    fn open(&self, _config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        Err(DeviceError::NotFound("no camera configured".into()))
    }
}

/// Encodes a raw frame as JPEG at `quality` and returns it base64-encoded.
pub fn encode_jpeg_base64(frame: &RawFrame, quality: u8) -> Result<String, DeviceError> {
    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.rgb.len() != expected {
        return Err(DeviceError::Encode(format!(
            "frame buffer holds {} bytes, expected {expected}",
            frame.rgb.len()
        )));
    }
    let image = RgbImage::from_raw(frame.width, frame.height, frame.rgb.clone())
        .ok_or_else(|| DeviceError::Encode("frame dimensions do not match buffer".into()))?;

    let mut jpeg = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality)
        .encode_image(&image)
        .map_err(|err| DeviceError::Encode(err.to_string()))?;
    Ok(STANDARD.encode(jpeg))
}
