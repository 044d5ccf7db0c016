use anyhow::{Context, Result, anyhow};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, GrayImage, ImageBuffer, ImageEncoder, RgbImage};

pub const STILL_QUALITY: u8 = 90;
pub const PREVIEW_QUALITY: u8 = 75;

pub fn jpeg_from_rgb(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let expected = (width * height * 3) as usize;
    if rgb.len() < expected {
        return Err(anyhow!(
            "RGB buffer size mismatch: expected {}, got {} bytes",
            expected,
            rgb.len()
        ));
    }

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .write_image(&rgb[..expected], width, height, ExtendedColorType::Rgb8)
        .context("JPEG encoding failed")?;
    Ok(out)
}

pub fn jpeg_from_gray(gray: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let expected = (width * height) as usize;
    if gray.len() < expected {
        return Err(anyhow!(
            "Gray buffer size mismatch: expected {}, got {} bytes",
            expected,
            gray.len()
        ));
    }

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .write_image(&gray[..expected], width, height, ExtendedColorType::L8)
        .context("JPEG encoding failed")?;
    Ok(out)
}

/// Resize an RGB frame to the preview size and encode it.
pub fn preview_from_rgb(
    rgb: Vec<u8>,
    width: u32,
    height: u32,
    preview_width: u32,
    preview_height: u32,
) -> Result<Vec<u8>> {
    let img: RgbImage = ImageBuffer::from_raw(width, height, rgb)
        .ok_or_else(|| anyhow!("Failed to create image from raw data"))?;
    let resized = imageops::resize(&img, preview_width, preview_height, FilterType::Triangle);
    jpeg_from_rgb(resized.as_raw(), preview_width, preview_height, PREVIEW_QUALITY)
}

pub fn preview_from_gray(
    gray: Vec<u8>,
    width: u32,
    height: u32,
    preview_width: u32,
    preview_height: u32,
) -> Result<Vec<u8>> {
    let img: GrayImage = ImageBuffer::from_raw(width, height, gray)
        .ok_or_else(|| anyhow!("Failed to create image from raw data"))?;
    let resized = imageops::resize(&img, preview_width, preview_height, FilterType::Triangle);
    jpeg_from_gray(resized.as_raw(), preview_width, preview_height, PREVIEW_QUALITY)
}
