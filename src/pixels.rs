// Host-side pixel data
//
// Input files are decoded and expanded to tightly packed RGBA8, which is what
// the GPU image uses. Row stride is always width * 4.

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, ImageReader, RgbaImage};
use std::path::Path;

pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaPixels {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RgbaPixels {
    /// Decode an image file and convert it to RGBA8
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let decoded = ImageReader::open(path)
            .with_context(|| format!("Failed to open input image: {}", path.display()))?
            .with_guessed_format()
            .with_context(|| format!("Failed to read input image: {}", path.display()))?
            .decode()
            .with_context(|| format!("Failed to decode input image: {}", path.display()))?;

        log::info!(
            "Loaded {} ({}x{}, {:?})",
            path.display(),
            decoded.width(),
            decoded.height(),
            decoded.color()
        );

        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Self::from_raw(width, height, rgba.into_raw())
            .with_context(|| format!("Unusable input image: {}", path.display()))
    }

    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            anyhow::bail!("Image has zero size ({}x{})", width, height);
        }

        let expected = byte_len(width, height)?;
        if data.len() != expected {
            anyhow::bail!(
                "Pixel data is {} bytes, expected {} for {}x{} RGBA8",
                data.len(),
                expected,
                width,
                height
            );
        }

        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn row_stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Encode to `path`; the format follows the file extension
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let format = output_format(path)?;

        let img = RgbaImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("invalid image data"))?;
        img.save_with_format(path, format)
            .with_context(|| format!("Could not write output file: {}", path.display()))?;

        log::info!("Wrote {} ({}x{})", path.display(), self.width, self.height);
        Ok(())
    }
}

/// Byte size of a tightly packed RGBA8 image
pub fn byte_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(BYTES_PER_PIXEL))
        .with_context(|| format!("Image size overflow ({}x{})", width, height))
}

/// Encoder for `path`, chosen from its extension
pub fn output_format(path: &Path) -> Result<ImageFormat> {
    let format = ImageFormat::from_path(path)
        .with_context(|| format!("Unknown output image format: {}", path.display()))?;

    if !format.writing_enabled() {
        anyhow::bail!(
            "Writing {:?} is not supported (output {})",
            format,
            path.display()
        );
    }
    Ok(format)
}

/// Result of comparing two images pixel by pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelDiff {
    pub mismatched_pixels: usize,
    pub total_pixels: usize,
}

impl PixelDiff {
    pub fn is_identical(&self) -> bool {
        self.mismatched_pixels == 0
    }
}

pub fn compare(expected: &RgbaPixels, actual: &RgbaPixels) -> Result<PixelDiff> {
    if (expected.width, expected.height) != (actual.width, actual.height) {
        anyhow::bail!(
            "Cannot compare {}x{} with {}x{}",
            expected.width,
            expected.height,
            actual.width,
            actual.height
        );
    }

    let mismatched_pixels = expected
        .data
        .chunks_exact(BYTES_PER_PIXEL)
        .zip(actual.data.chunks_exact(BYTES_PER_PIXEL))
        .filter(|(a, b)| a != b)
        .count();

    Ok(PixelDiff {
        mismatched_pixels,
        total_pixels: expected.data.len() / BYTES_PER_PIXEL,
    })
}
