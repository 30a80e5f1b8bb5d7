use atlasterm_core::U16x2;

use crate::glyph::MAX_CELL_SPAN;

/// CPU scratchpad a glyph run is rasterized into before its cells are copied to the atlas.
///
/// RGBA8, `MAX_CELL_SPAN` cells wide and one cell tall. Coverage glyphs are
/// written as white with coverage in alpha.
#[derive(Debug, Clone)]
pub struct GlyphSurface {
    cell_size: U16x2,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl GlyphSurface {
    pub fn new(cell_size: U16x2) -> Self {
        let width = cell_size.x as u32 * MAX_CELL_SPAN as u32;
        let height = cell_size.y as u32;
        Self {
            cell_size,
            width,
            height,
            pixels: vec![0; (width * height * 4) as usize],
        }
    }

    pub fn cell_size(&self) -> U16x2 {
        self.cell_size
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn bytes_per_row(&self) -> u32 {
        self.width * 4
    }

    /// Byte offset of scratch cell `index`'s top-left pixel.
    pub fn cell_offset(&self, index: usize) -> usize {
        index * self.cell_size.x as usize * 4
    }

    pub fn clear(&mut self) {
        self.pixels.fill(0);
    }

    /// RGBA of the pixel at (x, y), or transparent outside the surface.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        if x >= self.width || y >= self.height {
            return [0; 4];
        }
        let i = ((y * self.width + x) * 4) as usize;
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }

    /// Fill `[x0, x1) x [y0, y1)` with opaque white, clipped to the surface.
    pub fn fill_rect(&mut self, x0: u32, y0: u32, x1: u32, y1: u32) {
        for y in y0.min(self.height)..y1.min(self.height) {
            for x in x0.min(self.width)..x1.min(self.width) {
                let i = ((y * self.width + x) * 4) as usize;
                self.pixels[i..i + 4].copy_from_slice(&[255, 255, 255, 255]);
            }
        }
    }

    /// Draw an 8-bit coverage mask with its top-left at (left, top).
    pub fn draw_mask(&mut self, left: i32, top: i32, width: u32, height: u32, mask: &[u8]) {
        self.blit(left, top, width, height, |src, dst| {
            let coverage = mask.get(src).copied().unwrap_or(0);
            if coverage > dst[3] {
                dst.copy_from_slice(&[255, 255, 255, coverage]);
            }
        });
    }

    /// Draw straight-alpha RGBA pixels with their top-left at (left, top).
    pub fn draw_rgba(&mut self, left: i32, top: i32, width: u32, height: u32, rgba: &[u8]) {
        self.blit(left, top, width, height, |src, dst| {
            let Some(px) = rgba.get(src * 4..src * 4 + 4) else {
                return;
            };
            let a = px[3] as u32;
            for c in 0..3 {
                dst[c] = ((px[c] as u32 * a + dst[c] as u32 * (255 - a)) / 255) as u8;
            }
            dst[3] = dst[3].max(px[3]);
        });
    }

    fn blit(
        &mut self,
        left: i32,
        top: i32,
        width: u32,
        height: u32,
        mut put: impl FnMut(usize, &mut [u8]),
    ) {
        for row in 0..height {
            let y = top + row as i32;
            if y < 0 || y >= self.height as i32 {
                continue;
            }
            for col in 0..width {
                let x = left + col as i32;
                if x < 0 || x >= self.width as i32 {
                    continue;
                }
                let dst = ((y as u32 * self.width + x as u32) * 4) as usize;
                put((row * width + col) as usize, &mut self.pixels[dst..dst + 4]);
            }
        }
    }
}
