use crate::luma::LumaFrame;
use anyhow::{Context, Result};
use common::span;

/// RGB pixels (3 bytes per pixel) borrowed from a decoder's internal buffer.
pub struct DecodedFrame<'a> {
    pub rgb: &'a [u8],
    pub width: u32,
    pub height: u32,
}

/// Trait for decoding raw camera frames.
pub trait FrameDecoder: Send {
    /// Decode raw frame data to RGB (3 bytes per pixel).
    fn decode(&mut self, raw: &[u8], width: u32, height: u32) -> Result<DecodedFrame<'_>>;

    /// Extract the luma channel only, for motion analysis.
    fn luma(&mut self, raw: &[u8], width: u32, height: u32) -> Result<LumaFrame>;
}

/// YUYV (YUV 4:2:2) decoder.
///
/// YUYV packs 2 pixels in 4 bytes: [Y0, U, Y1, V]
pub struct YuyvDecoder {
    rgb_buffer: Vec<u8>,
}

impl Default for YuyvDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl YuyvDecoder {
    pub fn new() -> Self {
        Self {
            rgb_buffer: Vec::new(),
        }
    }
}

impl FrameDecoder for YuyvDecoder {
    fn decode(&mut self, raw: &[u8], width: u32, height: u32) -> Result<DecodedFrame<'_>> {
        let _s = span!("decode_yuyv");

        let pixel_count = (width * height) as usize;
        let rgb_size = pixel_count * 3;
        let bytes_per_row = (width * 2) as usize;

        if height == 0 || raw.len() < bytes_per_row * height as usize {
            anyhow::bail!(
                "YUYV buffer too small: {} bytes for {}x{}",
                raw.len(),
                width,
                height
            );
        }

        if self.rgb_buffer.len() < rgb_size {
            self.rgb_buffer.resize(rgb_size, 0);
        }

        let stride = raw.len() / height as usize;

        let mut out_idx = 0;
        for row in 0..height as usize {
            let row_start = row * stride;
            let row_data = &raw[row_start..row_start + bytes_per_row];

            for chunk in row_data.chunks_exact(4) {
                let y0 = chunk[0] as i32;
                let u = chunk[1] as i32 - 128;
                let y1 = chunk[2] as i32;
                let v = chunk[3] as i32 - 128;

                // BT.601 fixed-point coefficients (8-bit fraction)
                let rv = (359 * v) >> 8;
                let gu = (88 * u + 183 * v) >> 8;
                let bu = (454 * u) >> 8;

                for y in [y0, y1] {
                    self.rgb_buffer[out_idx] = (y + rv).clamp(0, 255) as u8;
                    self.rgb_buffer[out_idx + 1] = (y - gu).clamp(0, 255) as u8;
                    self.rgb_buffer[out_idx + 2] = (y + bu).clamp(0, 255) as u8;
                    out_idx += 3;
                }
            }
        }

        Ok(DecodedFrame {
            rgb: &self.rgb_buffer[..rgb_size],
            width,
            height,
        })
    }

    fn luma(&mut self, raw: &[u8], width: u32, height: u32) -> Result<LumaFrame> {
        LumaFrame::from_yuyv(raw, width, height)
    }
}

/// MJPEG decoder using turbojpeg (libjpeg-turbo)
pub struct MjpegDecoder {
    decompressor: turbojpeg::Decompressor,
    rgb_buffer: Vec<u8>,
}

impl MjpegDecoder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            decompressor: turbojpeg::Decompressor::new()
                .context("Failed to create JPEG decompressor")?,
            rgb_buffer: Vec::new(),
        })
    }
}

impl FrameDecoder for MjpegDecoder {
    fn decode(&mut self, raw: &[u8], _width: u32, _height: u32) -> Result<DecodedFrame<'_>> {
        let _s = span!("decode_mjpeg");

        let header = self.decompressor.read_header(raw)?;
        let width = header.width;
        let height = header.height;
        let rgb_size = width * height * 3;

        if self.rgb_buffer.len() < rgb_size {
            self.rgb_buffer.resize(rgb_size, 0);
        }

        let output = turbojpeg::Image {
            pixels: &mut self.rgb_buffer[..rgb_size],
            width,
            pitch: width * 3,
            height,
            format: turbojpeg::PixelFormat::RGB,
        };

        self.decompressor.decompress(raw, output)?;

        Ok(DecodedFrame {
            rgb: &self.rgb_buffer[..rgb_size],
            width: width as u32,
            height: height as u32,
        })
    }

    fn luma(&mut self, raw: &[u8], _width: u32, _height: u32) -> Result<LumaFrame> {
        let _s = span!("decode_mjpeg_luma");

        let header = self.decompressor.read_header(raw)?;
        let (width, height) = (header.width, header.height);
        let mut data = vec![0u8; width * height];

        let output = turbojpeg::Image {
            pixels: data.as_mut_slice(),
            width,
            pitch: width,
            height,
            format: turbojpeg::PixelFormat::GRAY,
        };
        self.decompressor.decompress(raw, output)?;

        LumaFrame::new(width as u32, height as u32, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_decoder_basic() {
        let mut decoder = YuyvDecoder::new();
        // 2x1 image: Y=128 (gray), U=128, V=128 (neutral chroma)
        let yuyv = vec![128, 128, 128, 128];
        let frame = decoder.decode(&yuyv, 2, 1).unwrap();
        assert_eq!(frame.rgb, &[128, 128, 128, 128, 128, 128]);
        assert_eq!((frame.width, frame.height), (2, 1));
    }

    #[test]
    fn test_yuyv_decoder_rejects_short_buffer() {
        let mut decoder = YuyvDecoder::new();
        assert!(decoder.decode(&[0, 0], 2, 1).is_err());
    }

    #[test]
    fn test_yuyv_luma() {
        let mut decoder = YuyvDecoder::new();
        let luma = decoder.luma(&[5, 128, 6, 128], 2, 1).unwrap();
        assert_eq!(luma.data, vec![5, 6]);
    }

    #[test]
    fn test_mjpeg_decoder_invalid_data() {
        let mut decoder = MjpegDecoder::new().unwrap();
        let invalid = vec![0, 1, 2, 3];
        assert!(decoder.decode(&invalid, 640, 480).is_err());
        assert!(decoder.luma(&invalid, 640, 480).is_err());
    }

    #[test]
    fn test_mjpeg_luma_of_encoded_gray() {
        let jpeg = crate::encode::jpeg_from_gray(&[100u8; 16 * 16], 16, 16, 95).unwrap();
        let mut decoder = MjpegDecoder::new().unwrap();

        let luma = decoder.luma(&jpeg, 16, 16).unwrap();

        assert_eq!((luma.width, luma.height), (16, 16));
        assert!(luma.data.iter().all(|&y| (98..=102).contains(&y)));
    }
}
