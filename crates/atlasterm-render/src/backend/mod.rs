//! Graphics backends the engine draws through.
//!
//! The engine owns all policy (what to rebuild, what to draw). A backend only
//! owns the device objects and executes the handful of operations below.

pub mod gpu;
pub mod software;

use std::time::Duration;

use atlasterm_core::U16x2;
use bytemuck::{Pod, Zeroable};

use crate::error::BackendError;
use crate::grid::Cell;
use crate::surface::GlyphSurface;

pub use gpu::{WgpuBackend, WgpuTarget};
pub use software::{Framebuffer, SoftwareBackend, SoftwareStats};

/// Per-frame shader constants, uploaded only when they change.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct FrameConstants {
    /// Drawn area in pixels: left, top, right, bottom.
    pub viewport: [f32; 4],
    pub cell_size: [u32; 2],
    pub cell_count_x: u32,
    pub background: u32,
    pub selection: u32,
    pub _pad: [u32; 3],
}

impl FrameConstants {
    pub fn new(cell_count: U16x2, cell_size: U16x2, background: u32, selection: u32) -> Self {
        let drawn_x = cell_count.x as f32 * cell_size.x as f32;
        let drawn_y = cell_count.y as f32 * cell_size.y as f32;
        Self {
            viewport: [0.0, 0.0, drawn_x, drawn_y],
            cell_size: [cell_size.x as u32, cell_size.y as u32],
            cell_count_x: cell_count.x as u32,
            background,
            selection,
            _pad: [0; 3],
        }
    }
}

/// Required device operations plus optional ones with no-op defaults.
pub trait RenderBackend {
    /// Whatever the host binds into its window or compositor.
    type SurfaceHandle: Clone;

    /// (Re)create the device. All earlier size and atlas resources are gone afterwards.
    fn create_device(&mut self) -> Result<(), BackendError>;

    /// Drop every device-owned resource.
    fn release(&mut self);

    fn has_device(&self) -> bool;

    /// Largest texture side the device accepts, in pixels.
    fn max_texture_dimension(&self) -> u32;

    /// Resize the render target to `size_px` and the cell buffer to `cell_count` cells.
    fn resize(&mut self, size_px: U16x2, cell_count: U16x2) -> Result<(), BackendError>;

    /// Replace the atlas texture with an empty one of `size_px`.
    fn recreate_atlas(&mut self, size_px: U16x2) -> Result<(), BackendError>;

    /// Copy scratch cell `index` of `surface` into the atlas at pixel position `slot`.
    fn write_atlas_cell(
        &mut self,
        surface: &GlyphSurface,
        index: usize,
        slot: U16x2,
    ) -> Result<(), BackendError>;

    fn update_constants(&mut self, constants: &FrameConstants) -> Result<(), BackendError>;

    fn upload_cells(&mut self, cells: &[Cell]) -> Result<(), BackendError>;

    /// Draw the full-screen pass and present it with vsync.
    fn draw_and_present(&mut self) -> Result<(), BackendError>;

    /// Wait up to `timeout` for the frame-latency signal.
    /// Returns false when the backend has no such primitive.
    fn wait_for_frame(&mut self, _timeout: Duration) -> bool {
        false
    }

    fn surface_handle(&self) -> Option<Self::SurfaceHandle> {
        None
    }
}

/// RGBA of `packed` (`0xAABBGGRR`) as normalized floats.
pub(crate) fn unpack_unorm(packed: u32) -> [f32; 4] {
    packed.to_le_bytes().map(|c| c as f32 / 255.0)
}
