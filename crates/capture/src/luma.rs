use anyhow::{Result, bail};

/// Single-channel 8-bit frame used for motion analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LumaFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl LumaFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = (width * height) as usize;
        if data.len() != expected {
            bail!(
                "Luma buffer size mismatch: expected {} bytes for {}x{}, got {}",
                expected,
                width,
                height,
                data.len()
            );
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn flat(width: u32, height: u32, level: u8) -> Self {
        Self {
            width,
            height,
            data: vec![level; (width * height) as usize],
        }
    }

    /// Extract the Y plane from a packed YUYV buffer.
    ///
    /// YUYV packs 2 pixels in 4 bytes: [Y0, U, Y1, V]. Rows may be padded,
    /// so the stride is derived from the buffer length.
    pub fn from_yuyv(raw: &[u8], width: u32, height: u32) -> Result<Self> {
        let bytes_per_row = (width * 2) as usize;
        if height == 0 || raw.len() < bytes_per_row * height as usize {
            bail!(
                "YUYV buffer too small: {} bytes for {}x{}",
                raw.len(),
                width,
                height
            );
        }
        let stride = raw.len() / height as usize;

        let mut data = Vec::with_capacity((width * height) as usize);
        for row in 0..height as usize {
            let row_start = row * stride;
            let row_data = &raw[row_start..row_start + bytes_per_row];
            data.extend(row_data.iter().step_by(2));
        }

        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Nearest-neighbour downsample by the smallest integer factor that brings
    /// the width to at most `max_width`.
    pub fn downsample(&self, max_width: u32) -> LumaFrame {
        if max_width == 0 || self.width <= max_width {
            return self.clone();
        }
        let factor = self.width.div_ceil(max_width);
        let width = self.width / factor;
        let height = (self.height / factor).max(1);

        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            let row = (y * factor * self.width) as usize;
            for x in 0..width {
                data.push(self.data[row + (x * factor) as usize]);
            }
        }

        LumaFrame {
            width,
            height,
            data,
        }
    }

    /// Mean of the squared per-pixel differences against `previous`.
    ///
    /// `None` when the frames have different dimensions (e.g. right after a
    /// mode change), which callers treat as "no measurement".
    pub fn mean_squared_difference(&self, previous: &LumaFrame) -> Option<f64> {
        if self.width != previous.width
            || self.height != previous.height
            || self.data.is_empty()
        {
            return None;
        }

        let sum: u64 = self
            .data
            .iter()
            .zip(&previous.data)
            .map(|(&a, &b)| {
                let d = a as i32 - b as i32;
                (d * d) as u64
            })
            .sum();

        Some(sum as f64 / self.data.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_wrong_length() {
        assert!(LumaFrame::new(4, 4, vec![0; 15]).is_err());
        assert!(LumaFrame::new(4, 4, vec![0; 16]).is_ok());
    }

    #[test]
    fn identical_frames_have_zero_difference() {
        let a = LumaFrame::flat(8, 8, 100);
        assert_eq!(a.mean_squared_difference(&a.clone()), Some(0.0));
    }

    #[test]
    fn difference_is_mean_of_squares() {
        let a = LumaFrame::new(2, 1, vec![10, 10]).unwrap();
        let b = LumaFrame::new(2, 1, vec![13, 10]).unwrap();
        // (9 + 0) / 2
        assert_eq!(a.mean_squared_difference(&b), Some(4.5));
        assert_eq!(b.mean_squared_difference(&a), Some(4.5));
    }

    #[test]
    fn mismatched_dimensions_yield_none() {
        let a = LumaFrame::flat(4, 4, 0);
        let b = LumaFrame::flat(2, 8, 0);
        assert_eq!(a.mean_squared_difference(&b), None);
    }

    #[test]
    fn yuyv_keeps_only_luma() {
        // 2x2 image, no padding: rows [Y0 U Y1 V]
        let raw = vec![10, 128, 20, 128, 30, 128, 40, 128];
        let frame = LumaFrame::from_yuyv(&raw, 2, 2).unwrap();
        assert_eq!(frame.data, vec![10, 20, 30, 40]);
    }

    #[test]
    fn yuyv_skips_row_padding() {
        // 2x2 image with 2 bytes of padding per row
        let raw = vec![1, 0, 2, 0, 9, 9, 3, 0, 4, 0, 9, 9];
        let frame = LumaFrame::from_yuyv(&raw, 2, 2).unwrap();
        assert_eq!(frame.data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn yuyv_rejects_short_buffer() {
        assert!(LumaFrame::from_yuyv(&[0; 6], 2, 2).is_err());
    }

    #[test]
    fn downsample_picks_every_nth_pixel() {
        let data: Vec<u8> = (0..16).collect();
        let frame = LumaFrame::new(4, 4, data).unwrap();

        let small = frame.downsample(2);

        assert_eq!((small.width, small.height), (2, 2));
        assert_eq!(small.data, vec![0, 2, 8, 10]);
    }

    #[test]
    fn downsample_is_noop_when_small_enough() {
        let frame = LumaFrame::flat(320, 240, 7);
        assert_eq!(frame.downsample(320), frame);
    }
}
