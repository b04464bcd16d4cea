//! Decoded frame container and the decoder that produces it.
//!
//! - `DecodedFrame`: RGB8 raster for one accepted frame. Bytes are private and
//!   zeroized on drop, so an overwritten or torn-down frame slot leaves no copy.
//! - `FrameDecoder`: turns untrusted encoded bytes (JPEG/PNG) into a
//!   `DecodedFrame`, enforcing the encoded size limit and decoder limits on
//!   dimensions and allocation.

use anyhow::{Context, Result};
use image::{ImageReader, Limits, RgbImage};
use std::io::Cursor;
use std::time::Instant;
use zeroize::Zeroize;

use crate::error::IngestError;
use crate::now_ms;

/// One decoded frame. There is no `Clone`; the frame slot owns the only copy.
pub struct DecodedFrame {
    /// Packed RGB8 pixels, row-major.
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock receive time (ms since epoch).
    pub received_at_ms: u64,
    received: Instant,
}

impl DecodedFrame {
    pub(crate) fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            received_at_ms: now_ms(),
            received: Instant::now(),
        }
    }

    pub fn received(&self) -> Instant {
        self.received
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Single-channel luminance (BT.601 weights).
    pub fn luminance(&self) -> Vec<u8> {
        self.data
            .chunks_exact(3)
            .map(|px| {
                let y = 299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32;
                ((y + 500) / 1000) as u8
            })
            .collect()
    }

    /// Copy into an `RgbImage` for annotation and re-encoding.
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
    }

    /// Re-encode the frame as JPEG.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let image = self
            .to_rgb_image()
            .context("frame buffer does not match its dimensions")?;
        encode_jpeg(&image, quality)
    }
}

impl Drop for DecodedFrame {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(image).context("encode jpeg")?;
    Ok(out)
}

/// Decoder for untrusted encoded frames.
#[derive(Clone, Debug)]
pub struct FrameDecoder {
    max_bytes: usize,
    max_dimension: u32,
}

impl FrameDecoder {
    pub fn new(max_bytes: usize, max_dimension: u32) -> Self {
        Self {
            max_bytes,
            max_dimension,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn check_size(&self, size: usize) -> Result<(), IngestError> {
        if size > self.max_bytes {
            return Err(IngestError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    pub fn decode(&self, encoded: &[u8]) -> Result<DecodedFrame, IngestError> {
        self.check_size(encoded.len())?;
        if encoded.is_empty() {
            return Err(IngestError::DecodeError("empty frame".to_string()));
        }

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);
        let max_pixels = self.max_dimension as u64 * self.max_dimension as u64;
        limits.max_alloc = Some(max_pixels.saturating_mul(4));

        let mut reader = ImageReader::new(Cursor::new(encoded))
            .with_guessed_format()
            .map_err(|e| IngestError::DecodeError(e.to_string()))?;
        if reader.format().is_none() {
            return Err(IngestError::DecodeError("unrecognized image format".to_string()));
        }
        reader.limits(limits);
        let image = reader
            .decode()
            .map_err(|e| IngestError::DecodeError(e.to_string()))?;
        let rgb = image.into_rgb8();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(IngestError::DecodeError("image has zero area".to_string()));
        }
        Ok(DecodedFrame::from_rgb(rgb.into_raw(), width, height))
    }
}

/// Holds the most recent decoded frame of one device. Depth is exactly one:
/// storing a new frame drops (and zeroizes) the previous one.
#[derive(Default)]
pub struct FrameSlot {
    frame: Option<DecodedFrame>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, frame: DecodedFrame) -> &DecodedFrame {
        self.frame.insert(frame)
    }

    pub fn latest(&self) -> Option<&DecodedFrame> {
        self.frame.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_none()
    }

    pub fn clear(&mut self) {
        self.frame = None;
    }

    pub fn memory_bytes(&self) -> usize {
        self.frame.as_ref().map(|f| f.byte_len()).unwrap_or(0)
    }
}

/// Test helpers for building encoded frames.
#[cfg(test)]
pub(crate) mod test_frames {
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    pub fn png(width: u32, height: u32, fill: u8) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([fill, fill, fill]));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::test_frames::png;
    use super::*;

    #[test]
    fn decodes_png_and_computes_luminance() {
        let decoder = FrameDecoder::new(1024 * 1024, 1024);
        let frame = decoder.decode(&png(8, 4, 200)).unwrap();
        assert_eq!((frame.width, frame.height), (8, 4));
        let luma = frame.luminance();
        assert_eq!(luma.len(), 32);
        assert!(luma.iter().all(|&y| y == 200));
    }

    #[test]
    fn rejects_garbage() {
        let decoder = FrameDecoder::new(1024, 1024);
        let err = decoder.decode(b"definitely not an image").err().unwrap();
        assert_eq!(err.code(), "decode_error");
    }

    #[test]
    fn rejects_oversized_payload_before_decoding() {
        let decoder = FrameDecoder::new(16, 1024);
        let err = decoder.decode(&png(8, 8, 0)).err().unwrap();
        assert!(matches!(err, IngestError::TooLarge { limit: 16, .. }));
    }

    #[test]
    fn rejects_dimensions_over_limit() {
        let decoder = FrameDecoder::new(1024 * 1024, 16);
        let err = decoder.decode(&png(64, 8, 0)).err().unwrap();
        assert_eq!(err.code(), "decode_error");
    }

    #[test]
    fn slot_keeps_only_latest() {
        let decoder = FrameDecoder::new(1024 * 1024, 1024);
        let mut slot = FrameSlot::new();
        assert!(slot.is_empty());
        slot.store(decoder.decode(&png(4, 4, 10)).unwrap());
        slot.store(decoder.decode(&png(2, 2, 20)).unwrap());
        let latest = slot.latest().unwrap();
        assert_eq!(latest.width, 2);
        assert_eq!(slot.memory_bytes(), 12);
        slot.clear();
        assert!(slot.is_empty());
    }

    #[test]
    fn jpeg_round_trip_preserves_dimensions() {
        let decoder = FrameDecoder::new(1024 * 1024, 1024);
        let frame = decoder.decode(&png(16, 8, 90)).unwrap();
        let jpeg = frame.encode_jpeg(85).unwrap();
        let again = decoder.decode(&jpeg).unwrap();
        assert_eq!((again.width, again.height), (16, 8));
    }
}
