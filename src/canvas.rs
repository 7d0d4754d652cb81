//! Canvas sink for decoded rows.
//!
//! The loader forwards each transformed row to a [`Canvas`] as soon as it is
//! produced. [`FrameBuffer`] is an in-memory RGBA implementation that can be
//! written out as PNG.

use crate::transform::Transparency;
use image::{Rgba, RgbaImage};
use thiserror::Error;

/// Canvas errors
#[derive(Error, Debug)]
pub enum CanvasError {
    #[error("Failed to write frame: {0}")]
    WriteError(#[from] image::ImageError),
}

/// Something that accepts pixel rows at a position
pub trait Canvas: Send {
    /// Draw `row` with its left end at (`x`, `y`). Pixels falling outside the
    /// canvas are clipped.
    fn blit(&mut self, x: i32, y: i32, row: &[Rgba<u8>], transparency: Transparency);

    /// Canvas dimensions
    fn size(&self) -> (u32, u32);
}

/// Draw a whole image through `canvas.blit`, one row at a time
pub fn draw_image(
    canvas: &mut dyn Canvas,
    x: i32,
    y: i32,
    image: &RgbaImage,
    transparency: Transparency,
) {
    for (row_y, row) in image.rows().enumerate() {
        let row: Vec<Rgba<u8>> = row.copied().collect();
        canvas.blit(x, y + row_y as i32, &row, transparency);
    }
}

/// In-memory RGBA frame
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    image: RgbaImage,
}

impl FrameBuffer {
    /// Create a frame filled with `background`
    pub fn new(width: u32, height: u32, background: Rgba<u8>) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, background),
        }
    }

    /// Pixel at (`x`, `y`), if inside the frame
    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba<u8>> {
        self.image.get_pixel_checked(x, y).copied()
    }

    /// Underlying image
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Write the frame as PNG
    #[cfg(feature = "png")]
    pub fn save_png(&self, path: &std::path::Path) -> Result<(), CanvasError> {
        self.image.save_with_format(path, image::ImageFormat::Png)?;
        tracing::info!("Frame written to {}", path.display());
        Ok(())
    }
}

/// Source-over blend of one channel
fn blend(src: u8, dst: u8, alpha: u8) -> u8 {
    let a = alpha as u16;
    ((src as u16 * a + dst as u16 * (255 - a) + 127) / 255) as u8
}

impl Canvas for FrameBuffer {
    fn blit(&mut self, x: i32, y: i32, row: &[Rgba<u8>], transparency: Transparency) {
        if y < 0 || y as u32 >= self.image.height() {
            return;
        }
        let width = self.image.width() as i32;

        for (i, px) in row.iter().enumerate() {
            let dx = x + i as i32;
            if dx < 0 {
                continue;
            }
            if dx >= width {
                break;
            }

            let dst = self.image.get_pixel_mut(dx as u32, y as u32);
            match transparency {
                Transparency::Opaque => *dst = Rgba([px[0], px[1], px[2], 0xFF]),
                Transparency::ChromaKey => {
                    if px[3] != 0 {
                        *dst = Rgba([px[0], px[1], px[2], 0xFF]);
                    }
                }
                Transparency::AlphaChannel => {
                    let a = px[3];
                    *dst = Rgba([
                        blend(px[0], dst[0], a),
                        blend(px[1], dst[1], a),
                        blend(px[2], dst[2], a),
                        dst[3].max(a),
                    ]);
                }
            }
        }
    }

    fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}
