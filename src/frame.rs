//! Decoded video frames.
//!
//! - `Frame`: RGB8 pixels plus capture metadata, produced by the ingest layer.
//!
//! Frames live for one sampling tick. They are handed to an extractor by
//! reference and dropped before the reading is submitted; nothing in the
//! pipeline writes pixels to disk.

use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};

/// One decoded RGB frame.
pub struct Frame {
    /// Packed RGB8 rows, `width * height * 3` bytes.
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time (UTC).
    pub captured_at: DateTime<Utc>,
    /// Per-source sequence number, starting at 1.
    pub sequence: u64,
}

impl Frame {
    /// Build a frame from packed RGB8 pixels.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at: Utc::now(),
            sequence,
        })
    }

    /// Decode a JPEG (or any format `image` was built with) into a frame.
    pub fn decode(bytes: &[u8], sequence: u64) -> Result<Self> {
        let decoded = image::load_from_memory(bytes).context("decode frame image")?;
        let rgb = decoded.into_rgb8();
        let (width, height) = rgb.dimensions();
        Self::from_rgb(rgb.into_raw(), width, height, sequence)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Copy into an `image` buffer for preprocessing.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
    }

    /// Encode as JPEG at `quality` (1-100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder
            .encode(
                &self.pixels,
                self.width,
                self.height,
                image::ExtendedColorType::Rgb8,
            )
            .context("encode frame as jpeg")?;
        Ok(out)
    }

    /// Encode as PNG.
    pub fn encode_png(&self) -> Result<Vec<u8>> {
        let image = self.to_rgb_image()?;
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .context("encode frame as png")?;
        Ok(out.into_inner())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Frame {
        let pixels = (0..width * height * 3).map(|i| (i % 251) as u8).collect();
        Frame::from_rgb(pixels, width, height, 1).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Frame::from_rgb(vec![0; 10], 4, 4, 1).is_err());
    }

    #[test]
    fn jpeg_encoding_decodes_back_to_same_dimensions() -> Result<()> {
        let frame = gradient(32, 24);
        let jpeg = frame.encode_jpeg(85)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = Frame::decode(&jpeg, 2)?;
        assert_eq!((decoded.width, decoded.height), (32, 24));
        Ok(())
    }

    #[test]
    fn png_encoding_has_signature() -> Result<()> {
        let png = gradient(8, 8).encode_png()?;
        assert_eq!(&png[1..4], b"PNG");
        Ok(())
    }
}
