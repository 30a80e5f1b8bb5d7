use std::io::{self, Write};

use atlasterm_core::U16x2;

use super::{unpack_unorm, FrameConstants, RenderBackend};
use crate::error::BackendError;
use crate::grid::{Cell, CellFlags};
use crate::surface::GlyphSurface;

const DEFAULT_MAX_TEXTURE: u32 = 16_384;

/// Presented RGBA8 frame.
#[derive(Debug, Clone, Default)]
pub struct Framebuffer {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Framebuffer {
    fn resize(&mut self, size: U16x2) {
        self.width = size.x as u32;
        self.height = size.y as u32;
        self.pixels = vec![0; size.area() * 4];
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

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = ((y * self.width + x) * 4) as usize;
        Some([
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ])
    }

    /// Write the frame as a binary PPM (P6), dropping alpha.
    pub fn write_ppm<W: Write>(&self, mut out: W) -> io::Result<()> {
        write!(out, "P6\n{} {}\n255\n", self.width, self.height)?;
        let rgb: Vec<u8> = self
            .pixels
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect();
        out.write_all(&rgb)?;
        out.flush()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub devices_created: u32,
    pub frames_presented: u64,
    pub atlas_writes: u64,
    pub cell_uploads: u64,
    pub constant_updates: u64,
}

#[derive(Debug, Default)]
struct Device {
    framebuffer: Framebuffer,
    atlas_size: U16x2,
    atlas: Vec<u8>,
    cells: Vec<Cell>,
    constants: FrameConstants,
}

impl Device {
    fn atlas_texel(&self, x: u32, y: u32) -> [f32; 4] {
        if x >= self.atlas_size.x as u32 || y >= self.atlas_size.y as u32 {
            return [0.0; 4];
        }
        let i = ((y * self.atlas_size.x as u32 + x) * 4) as usize;
        let px = &self.atlas[i..i + 4];
        [px[0], px[1], px[2], px[3]].map(|c| c as f32 / 255.0)
    }

    /// Color of framebuffer pixel (x, y), matching `fs_main` in shader.wgsl.
    fn shade(&self, x: u32, y: u32) -> [f32; 4] {
        let c = &self.constants;
        let background = unpack_unorm(c.background);
        let (fx, fy) = (x as f32, y as f32);
        let [csx, csy] = c.cell_size;
        let inside = fx >= c.viewport[0]
            && fy >= c.viewport[1]
            && fx < c.viewport[2]
            && fy < c.viewport[3];
        if csx == 0 || csy == 0 || !inside {
            return background;
        }
        let (px, py) = (x - c.viewport[0] as u32, y - c.viewport[1] as u32);
        let index = (py / csy) as usize * c.cell_count_x as usize + (px / csx) as usize;
        let Some(cell) = self.cells.get(index) else {
            return background;
        };

        let (wx, wy) = (px % csx, py % csy);
        let slot = cell.glyph_slot();
        let texel = self.atlas_texel(slot.x as u32 + wx, slot.y as u32 + wy);
        let fg = unpack_unorm(cell.color[0]);
        let mut color = mix(unpack_unorm(cell.color[1]), fg, texel[3]);

        let flags = cell.flags();
        if flags.contains(CellFlags::CURSOR) {
            let cursor = self.atlas_texel(wx, wy);
            color = mix(color, fg, cursor[3]);
        }
        if flags.contains(CellFlags::SELECTED) {
            let selection = unpack_unorm(c.selection);
            color = mix(color, selection, selection[3]);
        }
        color
    }
}

fn mix(a: [f32; 4], b: [f32; 4], t: f32) -> [f32; 4] {
    [0, 1, 2, 3].map(|i| a[i] + (b[i] - a[i]) * t)
}

/// CPU backend producing the same image the GPU pipeline would.
///
/// The surface handle is the device generation, bumped on every device creation.
#[derive(Debug)]
pub struct SoftwareBackend {
    device: Option<Device>,
    generation: u64,
    max_texture: u32,
    lose_device_on_present: bool,
    fail_next_device: bool,
    stats: SoftwareStats,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::with_max_texture(DEFAULT_MAX_TEXTURE)
    }

    pub fn with_max_texture(max_texture: u32) -> Self {
        Self {
            device: None,
            generation: 0,
            max_texture,
            lose_device_on_present: false,
            fail_next_device: false,
            stats: SoftwareStats::default(),
        }
    }

    /// Make the next present report a removed device.
    pub fn simulate_device_loss(&mut self) {
        self.lose_device_on_present = true;
    }

    /// Make the next device creation fail with a non-recoverable error.
    pub fn fail_next_device_creation(&mut self) {
        self.fail_next_device = true;
    }

    pub fn stats(&self) -> SoftwareStats {
        self.stats
    }

    pub fn framebuffer(&self) -> Option<&Framebuffer> {
        self.device.as_ref().map(|device| &device.framebuffer)
    }

    pub fn cells(&self) -> &[Cell] {
        self.device.as_ref().map_or(&[], |device| &device.cells)
    }

    pub fn constants(&self) -> Option<FrameConstants> {
        self.device.as_ref().map(|device| device.constants)
    }

    pub fn atlas_size(&self) -> Option<U16x2> {
        self.device.as_ref().map(|device| device.atlas_size)
    }

    /// Alpha of atlas pixel (x, y).
    pub fn atlas_alpha(&self, x: u32, y: u32) -> Option<u8> {
        let device = self.device.as_ref()?;
        let texel = device.atlas_texel(x, y);
        Some((texel[3] * 255.0).round() as u8)
    }

    fn device_mut(&mut self) -> Result<&mut Device, BackendError> {
        self.device
            .as_mut()
            .ok_or_else(|| BackendError::Backend("software device not created".into()))
    }
}

impl RenderBackend for SoftwareBackend {
    type SurfaceHandle = u64;

    fn create_device(&mut self) -> Result<(), BackendError> {
        self.device = None;
        if std::mem::take(&mut self.fail_next_device) {
            return Err(BackendError::Creation {
                what: "software device",
                details: "injected failure".into(),
            });
        }
        self.device = Some(Device::default());
        self.generation += 1;
        self.stats.devices_created += 1;
        tracing::debug!(generation = self.generation, "created software device");
        Ok(())
    }

    fn release(&mut self) {
        self.device = None;
    }

    fn has_device(&self) -> bool {
        self.device.is_some()
    }

    fn max_texture_dimension(&self) -> u32 {
        self.max_texture
    }

    fn resize(&mut self, size_px: U16x2, cell_count: U16x2) -> Result<(), BackendError> {
        let device = self.device_mut()?;
        device.framebuffer.resize(size_px);
        device.cells = vec![Cell::default(); cell_count.area()];
        Ok(())
    }

    fn recreate_atlas(&mut self, size_px: U16x2) -> Result<(), BackendError> {
        let max = self.max_texture;
        if size_px.x as u32 > max || size_px.y as u32 > max {
            return Err(BackendError::Creation {
                what: "glyph atlas",
                details: format!("{size_px:?} exceeds the {max}px texture limit"),
            });
        }
        let device = self.device_mut()?;
        device.atlas_size = size_px;
        device.atlas = vec![0; size_px.area() * 4];
        Ok(())
    }

    fn write_atlas_cell(
        &mut self,
        surface: &GlyphSurface,
        index: usize,
        slot: U16x2,
    ) -> Result<(), BackendError> {
        let device = self.device_mut()?;
        let cell = surface.cell_size();
        let atlas_width = device.atlas_size.x as usize;
        let stride = surface.bytes_per_row() as usize;
        let row_bytes = cell.x as usize * 4;

        for row in 0..cell.y as usize {
            let y = slot.y as usize + row;
            if y >= device.atlas_size.y as usize
                || slot.x as usize + cell.x as usize > atlas_width
            {
                break;
            }
            let src = row * stride + surface.cell_offset(index);
            let dst = (y * atlas_width + slot.x as usize) * 4;
            device.atlas[dst..dst + row_bytes]
                .copy_from_slice(&surface.pixels()[src..src + row_bytes]);
        }
        self.stats.atlas_writes += 1;
        Ok(())
    }

    fn update_constants(&mut self, constants: &FrameConstants) -> Result<(), BackendError> {
        self.device_mut()?.constants = *constants;
        self.stats.constant_updates += 1;
        Ok(())
    }

    fn upload_cells(&mut self, cells: &[Cell]) -> Result<(), BackendError> {
        let device = self.device_mut()?;
        device.cells.clear();
        device.cells.extend_from_slice(cells);
        self.stats.cell_uploads += 1;
        Ok(())
    }

    fn draw_and_present(&mut self) -> Result<(), BackendError> {
        if std::mem::take(&mut self.lose_device_on_present) {
            self.device = None;
            return Err(BackendError::DeviceLost("simulated device removal".into()));
        }
        let device = self.device_mut()?;
        let (width, height) = (device.framebuffer.width, device.framebuffer.height);
        let mut pixels = std::mem::take(&mut device.framebuffer.pixels);
        for y in 0..height {
            for x in 0..width {
                let color = device.shade(x, y);
                let i = ((y * width + x) * 4) as usize;
                for c in 0..3 {
                    pixels[i + c] = (color[c].clamp(0.0, 1.0) * 255.0).round() as u8;
                }
                pixels[i + 3] = 255;
            }
        }
        device.framebuffer.pixels = pixels;
        self.stats.frames_presented += 1;
        Ok(())
    }

    fn surface_handle(&self) -> Option<u64> {
        self.device.as_ref().map(|_| self.generation)
    }
}
