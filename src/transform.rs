//! Per-row pixel transforms applied after decoding.
//!
//! Decoders emit source rows; this module maps them onto the target buffer:
//!
//! 1. Resize with nearest-neighbour sampling. Destination pixel `d` on an
//!    axis reads source pixel `floor(d * src / dst)`. A source row `y`
//!    therefore fills destination rows `ceil(y * dh / sh) .. ceil((y + 1) * dh / sh)`,
//!    which is empty when downscaling skips that row.
//! 2. Pixel type conversion (binary, grayscale, RGB565 or full RGB).
//! 3. Transparency policy.

use crate::decoder::ImageInfo;
use image::Rgba;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Colour used to mark transparent pixels under chroma keying
pub const CHROMA_KEY: Rgba<u8> = Rgba([0, 1, 0, 0]);

/// How transparency in the source is carried into the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transparency {
    /// Alpha is dropped, every pixel is drawn
    #[default]
    Opaque,
    /// Pixels with alpha below 50% become the key colour and are skipped when drawn
    ChromaKey,
    /// Alpha is kept and blended when drawn
    #[serde(alias = "alpha_blend")]
    AlphaChannel,
}

/// Pixel storage type of the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageType {
    Binary,
    Grayscale,
    Rgb565,
    #[default]
    Rgb,
}

/// Monochrome decision, approximately 0.25 R + 0.5 G + 0.25 B > 127
fn is_color_on(px: Rgba<u8>) -> bool {
    let [r, g, b, _] = px.0;
    ((r >> 2) as u16 + (g >> 1) as u16 + (b >> 2) as u16) & 0x80 != 0
}

fn convert_type(px: Rgba<u8>, image_type: ImageType) -> Rgba<u8> {
    let [r, g, b, a] = px.0;
    match image_type {
        ImageType::Rgb => px,
        ImageType::Binary => {
            let v = if is_color_on(px) { 0xFF } else { 0 };
            Rgba([v, v, v, a])
        }
        ImageType::Grayscale => {
            let gray = (0.2125 * r as f32 + 0.7154 * g as f32 + 0.0721 * b as f32) as u8;
            Rgba([gray, gray, gray, a])
        }
        ImageType::Rgb565 => {
            let r5 = r >> 3;
            let g6 = g >> 2;
            let b5 = b >> 3;
            Rgba([(r5 << 3) | (r5 >> 2), (g6 << 2) | (g6 >> 4), (b5 << 3) | (b5 >> 2), a])
        }
    }
}

fn apply_transparency(px: Rgba<u8>, transparency: Transparency) -> Rgba<u8> {
    let [r, g, b, a] = px.0;
    match transparency {
        Transparency::Opaque => Rgba([r, g, b, 0xFF]),
        Transparency::AlphaChannel => px,
        Transparency::ChromaKey => {
            if a < 0x80 {
                CHROMA_KEY
            } else if r == 0 && g == 1 && b == 0 {
                Rgba([0, 0, 0, 0xFF])
            } else {
                Rgba([r, g, b, 0xFF])
            }
        }
    }
}

/// Maps decoded source rows onto the target buffer
#[derive(Debug, Clone)]
pub struct RowTransform {
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
    image_type: ImageType,
    transparency: Transparency,
    /// Source column for every destination column
    columns: Vec<u32>,
}

impl RowTransform {
    /// Build the transform once the source size is known. `resize` of
    /// `None` keeps the source size.
    pub fn new(
        source: ImageInfo,
        resize: Option<(u32, u32)>,
        image_type: ImageType,
        transparency: Transparency,
    ) -> Self {
        let (dst_width, dst_height) = resize.unwrap_or((source.width, source.height));
        let columns = (0..dst_width)
            .map(|x| sample(x, source.width, dst_width))
            .collect();

        Self {
            src_height: source.height,
            dst_width,
            dst_height,
            image_type,
            transparency,
            columns,
        }
    }

    /// Size of the target buffer
    pub fn output_size(&self) -> (u32, u32) {
        (self.dst_width, self.dst_height)
    }

    /// Destination rows filled by source row `src_y`
    pub fn target_rows(&self, src_y: u32) -> Range<u32> {
        let sh = self.src_height as u64;
        let dh = self.dst_height as u64;
        let y = src_y as u64;
        let start = (y * dh).div_ceil(sh);
        let end = ((y + 1) * dh).div_ceil(sh);
        start.min(dh) as u32..end.min(dh) as u32
    }

    /// Resample and convert one source row
    pub fn apply(&self, row: &[Rgba<u8>]) -> Vec<Rgba<u8>> {
        let blank = Rgba([0, 0, 0, 0]);
        self.columns
            .iter()
            .map(|&sx| row.get(sx as usize).copied().unwrap_or(blank))
            .map(|px| apply_transparency(convert_type(px, self.image_type), self.transparency))
            .collect()
    }
}

/// Nearest-neighbour source index for destination index `d`
fn sample(d: u32, src: u32, dst: u32) -> u32 {
    ((d as u64 * src as u64) / dst as u64) as u32
}
