use std::{fs::File, io, path::Path};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use gif::{Encoder, Frame as GifFrame, Repeat};
use image::ImageFormat;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("nothing to export")]
    NoFrames,
    #[error("frame {index} is not valid base64: {source}")]
    InvalidBase64 {
        index: usize,
        #[source]
        source: base64::DecodeError,
    },
    #[error("frame {index} is not a readable JPEG: {source}")]
    InvalidImage {
        index: usize,
        #[source]
        source: image::ImageError,
    },
    #[error("frame {index} is {width}x{height}, expected {expected_width}x{expected_height}")]
    SizeChanged {
        index: usize,
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },
    #[error("frames of {width}x{height} are too large for GIF")]
    TooLarge { width: u32, height: u32 },
    #[error(transparent)]
    Gif(#[from] gif::EncodingError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Writes base64 JPEG frames to `path` as a looping animated GIF played at
/// `fps`. Returns the number of frames written.
pub fn export_gif(frames: &[String], fps: u32, path: &Path) -> Result<usize, ExportError> {
    let Some(first) = frames.first() else {
        return Err(ExportError::NoFrames);
    };
    let first = decode_frame(0, first)?;
    let (width, height) = first.dimensions();
    let (gif_width, gif_height) = match (u16::try_from(width), u16::try_from(height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => return Err(ExportError::TooLarge { width, height }),
    };

    let file = File::create(path)?;
    let mut encoder = Encoder::new(file, gif_width, gif_height, &[])?;
    encoder.set_repeat(Repeat::Infinite)?;

    let mut write = |index: usize, rgba: image::RgbaImage| -> Result<(), ExportError> {
        let mut pixels = rgba.into_raw();
        let mut frame = GifFrame::from_rgba_speed(gif_width, gif_height, &mut pixels, 10);
        frame.delay = frame_delay(index, fps);
        encoder.write_frame(&frame)?;
        Ok(())
    };

    write(0, first)?;
    for (index, data) in frames.iter().enumerate().skip(1) {
        let rgba = decode_frame(index, data)?;
        if rgba.dimensions() != (width, height) {
            return Err(ExportError::SizeChanged {
                index,
                width: rgba.width(),
                height: rgba.height(),
                expected_width: width,
                expected_height: height,
            });
        }
        write(index, rgba)?;
    }
    drop(write);

    encoder.into_inner()?;
    Ok(frames.len())
}

/// Delay of frame `index` in hundredths of a second, the only unit GIF has.
///
/// Rates that do not divide 100 get uneven delays (3, 3, 4 at 30 fps) so the
/// running total stays on the capture clock instead of drifting.
fn frame_delay(index: usize, fps: u32) -> u16 {
    if fps == 0 {
        return 10;
    }
    let elapsed = |frames: u64| frames * 100 / u64::from(fps);
    let index = index as u64;
    let delay = elapsed(index + 1) - elapsed(index);
    u16::try_from(delay).unwrap_or(u16::MAX).max(1)
}

fn decode_frame(index: usize, data: &str) -> Result<image::RgbaImage, ExportError> {
    let jpeg = STANDARD
        .decode(data)
        .map_err(|source| ExportError::InvalidBase64 { index, source })?;
    let image = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)
        .map_err(|source| ExportError::InvalidImage { index, source })?;
    Ok(image.to_rgba8())
}
