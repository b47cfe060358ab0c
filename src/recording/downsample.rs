// Integer spatial downsampling applied before frames reach the encoder

use std::borrow::Cow;

use crate::encoding::PixelFormat;

/// Keeps every `factor`-th pixel of every `factor`-th row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Downsampler {
    factor: u32,
    src_width: u32,
    src_height: u32,
    bytes_per_pixel: usize,
    out_width: u32,
    out_height: u32,
}

impl Downsampler {
    /// A factor of 0 is treated as 1. Output dimensions never drop below 1.
    pub fn new(factor: u32, width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        let factor = factor.max(1);
        Self {
            factor,
            src_width: width,
            src_height: height,
            bytes_per_pixel: pixel_format.bytes_per_pixel(),
            out_width: (width / factor).max(1),
            out_height: (height / factor).max(1),
        }
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    pub fn output_width(&self) -> u32 {
        self.out_width
    }

    pub fn output_height(&self) -> u32 {
        self.out_height
    }

    pub fn input_size(&self) -> usize {
        self.src_width as usize * self.src_height as usize * self.bytes_per_pixel
    }

    pub fn output_size(&self) -> usize {
        self.out_width as usize * self.out_height as usize * self.bytes_per_pixel
    }

    /// Downsample one frame. Frames of the wrong size are passed through
    /// unchanged so the encoder reports the mismatch.
    pub fn apply<'a>(&self, pixels: &'a [u8]) -> Cow<'a, [u8]> {
        if self.factor == 1 || pixels.len() != self.input_size() {
            return Cow::Borrowed(pixels);
        }

        let bpp = self.bytes_per_pixel;
        let row_stride = self.src_width as usize * bpp;
        let step = self.factor as usize;
        let mut out = Vec::with_capacity(self.output_size());

        for y in 0..self.out_height as usize {
            let row = &pixels[y * step * row_stride..][..row_stride];
            for x in 0..self.out_width as usize {
                let offset = x * step * bpp;
                out.extend_from_slice(&row[offset..offset + bpp]);
            }
        }

        Cow::Owned(out)
    }
}
