//! Screen frame reconstruction for the two image modes.
//!
//! In `direct` mode the target already sends JPEG frames and they are cached
//! untouched. In `diff` mode each payload encodes `previous - current`
//! (per channel, modulo 256); the server keeps the last rebuilt frame,
//! subtracts the diff from it and re-encodes the result as JPEG so watchers
//! always receive whole frames.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageResult, RgbImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ImageMode {
    #[default]
    Direct,
    Diff,
}

impl ImageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageMode::Direct => "direct",
            ImageMode::Diff => "diff",
        }
    }
}

#[derive(Debug)]
pub struct FrameRebuilder {
    mode: ImageMode,
    quality: u8,
    previous: Option<RgbImage>,
}

impl FrameRebuilder {
    pub fn new(mode: ImageMode, quality: u8) -> Self {
        Self {
            mode,
            quality: quality.clamp(1, 100),
            previous: None,
        }
    }

    pub fn mode(&self) -> ImageMode {
        self.mode
    }

    /// Turns one received payload into the frame watchers should see.
    pub fn apply(&mut self, payload: Bytes) -> ImageResult<Bytes> {
        match self.mode {
            ImageMode::Direct => Ok(payload),
            ImageMode::Diff => self.rebuild(&payload),
        }
    }

    fn rebuild(&mut self, payload: &[u8]) -> ImageResult<Bytes> {
        let diff = image::load_from_memory(payload)?.to_rgb8();
        let frame = match self.previous.take() {
            Some(mut previous) if previous.dimensions() == diff.dimensions() => {
                for (out, delta) in previous.iter_mut().zip(diff.iter()) {
                    *out = out.wrapping_sub(*delta);
                }
                previous
            }
            // first frame, or the target changed resolution
            _ => diff,
        };

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality).encode(
            frame.as_raw(),
            frame.width(),
            frame.height(),
            ColorType::Rgb8,
        )?;
        self.previous = Some(frame);
        Ok(Bytes::from(jpeg))
    }
}
