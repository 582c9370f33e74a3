//! Camera image buffers and preview thumbnails.

use anyhow::{bail, Result};
use ndarray::{s, Array2};

/// A single 16-bit grayscale camera image, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Pixel data, `width * height` values
    pixels: Vec<u16>,
}

impl Frame {
    /// Create a frame from 16-bit pixel data.
    ///
    /// Fails if the buffer length does not match the dimensions.
    pub fn from_u16(width: u32, height: u32, pixels: Vec<u16>) -> Result<Self> {
        let expected = (width as usize) * (height as usize);
        if pixels.len() != expected {
            bail!(
                "Frame data size mismatch: expected {} pixels for {}x{}, got {}",
                expected,
                width,
                height,
                pixels.len()
            );
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Black frame.
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; (width as usize) * (height as usize)],
        }
    }

    /// Pixel data.
    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    /// Pixel value at (x, y).
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get((y * self.width + x) as usize).copied()
    }

    /// Calculate mean pixel value.
    pub fn mean(&self) -> f64 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.pixels.iter().map(|&v| u64::from(v)).sum();
        sum as f64 / self.pixels.len() as f64
    }

    /// Image as a `(height, width)` floating point array.
    pub fn to_array(&self) -> Array2<f64> {
        let width = self.width as usize;
        Array2::from_shape_fn((self.height as usize, width), |(row, col)| {
            f64::from(self.pixels[row * width + col])
        })
    }

    /// Discrete 5-point Laplacian of the interior pixels.
    ///
    /// Frames narrower or shorter than 3 pixels give an empty array.
    pub fn laplacian(&self) -> Array2<f64> {
        let a = self.to_array();
        let (rows, cols) = a.dim();
        if rows < 3 || cols < 3 {
            return Array2::zeros((0, 0));
        }
        let center = a.slice(s![1..-1, 1..-1]);
        &a.slice(s![..-2, 1..-1]) + &a.slice(s![2.., 1..-1]) + &a.slice(s![1..-1, ..-2])
            + &a.slice(s![1..-1, 2..])
            - &(&center * 4.0)
    }

    /// Pixel bytes in native endianness, as image encoders expect for L16.
    pub fn to_ne_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    /// Downsampled 8-bit preview.
    ///
    /// Each `bin x bin` block is averaged (partial edge blocks are dropped),
    /// then the result is stretched to the full 0..=255 range.
    pub fn thumbnail(&self, bin: u32) -> Thumbnail {
        let bin = bin.max(1);
        let width = (self.width / bin).max(1).min(self.width);
        let height = (self.height / bin).max(1).min(self.height);
        let block = bin.min(self.width).min(self.height).max(1);

        let mut binned = Vec::with_capacity((width * height) as usize);
        for ty in 0..height {
            for tx in 0..width {
                let mut sum = 0u64;
                let mut n = 0u64;
                for dy in 0..block {
                    for dx in 0..block {
                        if let Some(v) = self.get(tx * block + dx, ty * block + dy) {
                            sum += u64::from(v);
                            n += 1;
                        }
                    }
                }
                binned.push(if n == 0 { 0.0 } else { sum as f64 / n as f64 });
            }
        }

        let (lo, hi) = binned
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let range = hi - lo;
        let pixels = binned
            .iter()
            .map(|&v| {
                if range > 0.0 {
                    ((v - lo) / range * 255.0).round() as u8
                } else {
                    0
                }
            })
            .collect();

        Thumbnail {
            width,
            height,
            pixels,
        }
    }
}

/// 8-bit preview published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Autoscaled pixel data, row-major
    pub pixels: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Frame::from_u16(4, 4, vec![0; 15]).is_err());
        assert!(Frame::from_u16(4, 4, vec![0; 16]).is_ok());
    }

    #[test]
    fn get_and_mean() {
        let frame = Frame::from_u16(2, 2, vec![1, 2, 3, 4]).unwrap();
        assert_eq!(frame.get(1, 1), Some(4));
        assert_eq!(frame.get(2, 0), None);
        assert_eq!(frame.mean(), 2.5);
    }

    #[test]
    fn array_is_row_major() {
        let frame = Frame::from_u16(3, 2, vec![0, 1, 2, 3, 4, 5]).unwrap();
        let array = frame.to_array();
        assert_eq!(array.dim(), (2, 3));
        assert_eq!(array[[1, 0]], 3.0);
    }

    #[test]
    fn laplacian_of_flat_image_is_zero() {
        let frame = Frame::from_u16(5, 4, vec![7; 20]).unwrap();
        let lap = frame.laplacian();
        assert_eq!(lap.dim(), (2, 3));
        assert!(lap.iter().all(|&v| v == 0.0));
        assert_eq!(Frame::zeros(2, 2).laplacian().len(), 0);
    }

    #[test]
    fn laplacian_responds_to_point() {
        let mut pixels = vec![0; 9];
        pixels[4] = 10;
        let lap = Frame::from_u16(3, 3, pixels).unwrap().laplacian();
        assert_eq!(lap[[0, 0]], -40.0);
    }

    #[test]
    fn thumbnail_bins_and_autoscales() {
        // Left half dark, right half bright
        let mut pixels = Vec::new();
        for _ in 0..4 {
            pixels.extend_from_slice(&[100, 100, 900, 900]);
        }
        let frame = Frame::from_u16(4, 4, pixels).unwrap();
        let thumb = frame.thumbnail(2);
        assert_eq!((thumb.width, thumb.height), (2, 2));
        assert_eq!(thumb.pixels, vec![0, 255, 0, 255]);
    }

    #[test]
    fn flat_thumbnail_is_black() {
        let thumb = Frame::zeros(8, 8).thumbnail(4);
        assert_eq!(thumb.pixels, vec![0; 4]);
    }
}
