//! The frame pipeline.
//!
//! A frame is `start_paint`, any number of `paint_buffer_line` /
//! `paint_selection` / `paint_cursor` calls, then `present`. Host mutators in
//! between only record invalidations; resources are rebuilt lazily, in
//! dependency order, at the next `start_paint`.

use std::sync::mpsc::Sender;
use std::time::Duration;

use atlasterm_core::config::Antialiasing;
use atlasterm_core::{CellRect, Config, HostEvent, U16x2};

use crate::atlas::{AtlasLayout, AtlasStats, GlyphAtlas, CURSOR_SLOT};
use crate::backend::{FrameConstants, RenderBackend};
use crate::error::{BackendError, RenderError};
use crate::glyph::{GlyphKey, TextAttributes};
use crate::grid::{CellFlags, CellGrid};
use crate::invalidation::Invalidations;
use crate::shaping::{
    shape_line, Cluster, FontRequest, FontService, LineStats, ShapingScratch, TextFormat,
};
use crate::surface::GlyphSurface;

/// Top of the cursor bar as a fraction of the cell height.
const CURSOR_TOP: f32 = 0.81;
const BOLD_WEIGHT: u16 = 700;
const BASE_DPI: u32 = 96;

/// Lifecycle of one resource group.
#[derive(Debug)]
pub enum ResourceState<T> {
    Invalid,
    Building,
    Ready(T),
}

impl<T> ResourceState<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, ResourceState::Ready(_))
    }

    fn ready_mut(&mut self) -> Option<&mut T> {
        match self {
            ResourceState::Ready(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    ResourcesChecked,
    Shaped,
    Presented,
}

#[derive(Debug)]
struct DeviceResources {
    max_texture: u32,
}

#[derive(Debug)]
struct SizeResources {
    size_px: U16x2,
    cell_count: U16x2,
}

/// Everything tied to one font-resource generation.
#[derive(Debug)]
struct FontResources {
    /// Indexed `[italic][bold]`.
    formats: [[TextFormat; 2]; 2],
    atlas: GlyphAtlas,
    surface: GlyphSurface,
}

/// Font the host asks for; the DPI and antialiasing mode are engine state.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredFont {
    pub family: String,
    /// Size in points.
    pub size: f32,
    pub weight: u16,
}

/// The font actually selected and the cell size it produces.
#[derive(Debug, Clone, PartialEq)]
pub struct FontInfo {
    pub family: String,
    pub size: f32,
    pub weight: u16,
    pub cell_size: U16x2,
}

/// Colors and style of the text painted next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Brushes {
    pub foreground: u32,
    pub background: u32,
    pub bold: bool,
    pub italic: bool,
    pub background_is_default: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorOptions {
    pub x: u16,
    pub y: u16,
    pub visible: bool,
    pub double_width: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub frames_presented: u64,
    pub device_losses: u32,
    pub glyphs_rasterized: u64,
    pub shaping: LineStats,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub font: DesiredFont,
    pub dpi: u32,
    pub antialiasing: Antialiasing,
    pub atlas_target_cells: u32,
    pub pacing_timeout: Duration,
    pub pacing_fallback: Duration,
    pub foreground: u32,
    pub background: u32,
    pub selection: u32,
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            font: DesiredFont {
                family: config.font.family.clone(),
                size: config.font.size,
                weight: config.font.weight,
            },
            dpi: config.font.dpi,
            antialiasing: config.render.antialiasing,
            atlas_target_cells: config.render.atlas_target_cells,
            pacing_timeout: Duration::from_millis(config.render.pacing_timeout_ms),
            pacing_fallback: Duration::from_millis(config.render.pacing_fallback_ms),
            foreground: config.theme.foreground.pack(),
            background: config.theme.background.pack(),
            selection: config.selection.packed(),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

type RecreatedCallback = Box<dyn FnMut() -> anyhow::Result<()>>;

pub struct AtlasEngine<B: RenderBackend, F: FontService> {
    backend: B,
    fonts: F,
    options: EngineOptions,

    invalidations: Invalidations,
    device: ResourceState<DeviceResources>,
    size: ResourceState<SizeResources>,
    font: ResourceState<FontResources>,
    phase: FramePhase,

    grid: CellGrid,
    scratch: ShapingScratch,

    size_px: U16x2,
    cell_size: U16x2,
    cell_count: U16x2,
    dirty: CellRect,

    desired_font: DesiredFont,
    dpi: u32,
    antialiasing: Antialiasing,
    attributes: TextAttributes,
    colors: [u32; 2],
    background: u32,
    selection: u32,

    on_recreated: Option<RecreatedCallback>,
    notifier: Option<Sender<HostEvent>>,
    stats: EngineStats,
}

impl<B: RenderBackend, F: FontService> AtlasEngine<B, F> {
    pub fn new(backend: B, fonts: F, options: EngineOptions) -> Self {
        Self {
            backend,
            fonts,
            invalidations: Invalidations::DEVICE | Invalidations::DEVICE_DEPENDENTS,
            device: ResourceState::Invalid,
            size: ResourceState::Invalid,
            font: ResourceState::Invalid,
            phase: FramePhase::Idle,
            grid: CellGrid::default(),
            scratch: ShapingScratch::default(),
            size_px: U16x2::ZERO,
            cell_size: U16x2::ZERO,
            cell_count: U16x2::ZERO,
            dirty: CellRect::default(),
            desired_font: options.font.clone(),
            dpi: options.dpi,
            antialiasing: options.antialiasing,
            attributes: TextAttributes::default(),
            colors: [options.foreground, options.background],
            background: options.background,
            selection: options.selection,
            on_recreated: None,
            notifier: None,
            stats: EngineStats::default(),
            options,
        }
    }

    // ---- frame ----

    /// Repair invalidated resources and open a frame.
    pub fn start_paint(&mut self) -> Result<(), RenderError> {
        if matches!(self.phase, FramePhase::ResourcesChecked | FramePhase::Shaped) {
            tracing::debug!(phase = ?self.phase, "abandoning unpresented frame");
        }
        self.phase = FramePhase::Idle;

        if !self.invalidations.is_empty() {
            assert!(!self.size_px.has_zero(), "viewport size is zero");
            assert!(!self.cell_size.has_zero(), "cell size is zero; call update_font first");
            assert!(!self.cell_count.has_zero(), "viewport holds no cells");

            if self.invalidations.contains(Invalidations::TITLE) {
                self.invalidations.remove(Invalidations::TITLE);
                tracing::debug!("title invalidated");
                self.notify(HostEvent::TitleChanged);
            }
            if self.invalidations.contains(Invalidations::DEVICE) {
                self.create_device_resources()?;
            }
            if self.invalidations.contains(Invalidations::SIZE) {
                self.rebuild_size_resources()?;
            }
            if self.invalidations.contains(Invalidations::FONT) {
                self.rebuild_font_resources()?;
            }
        }

        self.dirty = CellRect::full(self.cell_count);
        self.phase = FramePhase::ResourcesChecked;
        Ok(())
    }

    /// Shape one line of clusters starting at column `x` of row `y` and write it into the grid.
    pub fn paint_buffer_line(
        &mut self,
        clusters: &[Cluster<'_>],
        x: u16,
        y: u16,
    ) -> Result<LineStats, RenderError> {
        self.assert_can_paint();
        if y >= self.cell_count.y {
            return Ok(LineStats::default());
        }
        let Some(font) = self.font.ready_mut() else {
            panic!("font resources missing while painting");
        };

        self.scratch.load_line(clusters);
        let attributes = self.attributes;
        let colors = self.colors;
        let format = &font.formats[attributes.italic as usize][attributes.bold as usize];
        let atlas = &mut font.atlas;
        let grid = &mut self.grid;

        let stats = shape_line(&mut self.fonts, format, &mut self.scratch, |run| {
            let key = GlyphKey::new(run.text, attributes, (run.x2 - run.x1) as usize);
            let resolved = atlas.resolve(key);
            grid.write_run(y, x.saturating_add(run.x1), &resolved.slots, colors);
        })?;

        let total = &mut self.stats.shaping;
        total.runs += stats.runs;
        total.replacement_runs += stats.replacement_runs;
        total.shaped_segments += stats.shaped_segments;
        total.glyphs += stats.glyphs;
        total.shaping_retries += stats.shaping_retries;
        self.phase = FramePhase::Shaped;
        Ok(stats)
    }

    /// Mark the cells of `rect` as selected.
    pub fn paint_selection(&mut self, rect: CellRect) {
        self.assert_can_paint();
        self.grid.add_flags_in(rect, CellFlags::SELECTED);
    }

    pub fn paint_cursor(&mut self, cursor: CursorOptions) {
        self.assert_can_paint();
        if cursor.visible {
            let cells = 1 + cursor.double_width as usize;
            self.grid
                .add_flags_linear(cursor.x, cursor.y, cells, CellFlags::CURSOR);
        }
    }

    /// Draw queued glyphs, upload constants and cells, then present.
    pub fn present(&mut self) -> Result<(), RenderError> {
        assert!(
            matches!(self.phase, FramePhase::ResourcesChecked | FramePhase::Shaped),
            "present called without start_paint"
        );
        self.phase = FramePhase::Idle;
        match self.present_frame() {
            Ok(()) => {
                self.phase = FramePhase::Presented;
                self.stats.frames_presented += 1;
                Ok(())
            }
            Err(err) => Err(self.recover(err)),
        }
    }

    /// Block until the backend can take another frame.
    pub fn wait_until_can_render(&mut self) {
        if !self.backend.wait_for_frame(self.options.pacing_timeout) {
            std::thread::sleep(self.options.pacing_fallback);
        }
    }

    fn present_frame(&mut self) -> Result<(), RenderError> {
        let Some(FontResources {
            formats,
            atlas,
            surface,
        }) = self.font.ready_mut()
        else {
            panic!("font resources missing at present");
        };

        // The queue is cleared only once every entry is in the atlas, so a
        // failed frame leaves its misses queued for the next one.
        for (key, slots) in atlas.pending() {
            surface.clear();
            let format = &formats[key.attributes.italic as usize][key.attributes.bold as usize];
            self.fonts
                .rasterize(key.text.as_str(), format, slots.len(), surface)?;
            for (index, slot) in slots.as_slice().iter().enumerate() {
                self.backend
                    .write_atlas_cell(surface, index, *slot)
                    .map_err(RenderError::Backend)?;
            }
            self.stats.glyphs_rasterized += 1;
        }
        atlas.clear_queue();

        if self.invalidations.contains(Invalidations::CONSTANTS) {
            let constants = FrameConstants::new(
                self.cell_count,
                self.cell_size,
                self.background,
                self.selection,
            );
            self.backend
                .update_constants(&constants)
                .map_err(RenderError::Backend)?;
            self.invalidations.remove(Invalidations::CONSTANTS);
        }

        self.backend
            .upload_cells(self.grid.cells())
            .map_err(RenderError::Backend)?;
        self.backend.draw_and_present().map_err(RenderError::Backend)
    }

    fn assert_can_paint(&self) {
        assert!(
            !self.invalidations.blocks_paint(),
            "painting with stale resources: {:?}",
            self.invalidations
        );
        assert!(
            matches!(self.phase, FramePhase::ResourcesChecked | FramePhase::Shaped),
            "painting outside start_paint/present"
        );
    }

    // ---- resources ----

    /// Turn a device loss into `Retry` after dropping everything built on the device.
    fn recover(&mut self, err: RenderError) -> RenderError {
        match err {
            RenderError::Backend(BackendError::DeviceLost(reason)) => {
                tracing::warn!(%reason, "device lost, dropping all resources");
                self.release_resources();
                self.invalidations.insert(Invalidations::DEVICE);
                self.stats.device_losses += 1;
                RenderError::Retry
            }
            other => other,
        }
    }

    fn release_resources(&mut self) {
        self.font = ResourceState::Invalid;
        self.size = ResourceState::Invalid;
        self.device = ResourceState::Invalid;
        self.grid.release();
        self.backend.release();
    }

    fn create_device_resources(&mut self) -> Result<(), RenderError> {
        self.release_resources();
        self.device = ResourceState::Building;
        if let Err(err) = self.backend.create_device() {
            self.device = ResourceState::Invalid;
            return Err(self.recover(RenderError::Backend(err)));
        }
        let max_texture = self.backend.max_texture_dimension();
        self.device = ResourceState::Ready(DeviceResources { max_texture });
        tracing::info!(max_texture, "created device resources");

        if let Some(callback) = self.on_recreated.as_mut() {
            if let Err(err) = callback() {
                tracing::warn!(error = %err, "resources-recreated callback failed");
            }
        }
        self.notify(HostEvent::SurfaceRecreated);

        self.invalidations.remove(Invalidations::DEVICE);
        self.invalidations.insert(Invalidations::DEVICE_DEPENDENTS);
        Ok(())
    }

    fn rebuild_size_resources(&mut self) -> Result<(), RenderError> {
        assert!(self.device.is_ready(), "size resources need a device");
        self.size = ResourceState::Building;

        if let Err(err) = self.backend.resize(self.size_px, self.cell_count) {
            self.size = ResourceState::Invalid;
            return Err(self.recover(RenderError::Backend(err)));
        }
        if self.grid.resize(self.cell_count) {
            tracing::debug!(cells = self.grid.len(), "reallocated cell buffer");
        }
        self.size = ResourceState::Ready(SizeResources {
            size_px: self.size_px,
            cell_count: self.cell_count,
        });
        tracing::info!(
            size_px = ?self.size_px,
            cell_count = ?self.cell_count,
            "rebuilt size resources"
        );

        self.invalidations.remove(Invalidations::SIZE);
        self.invalidations.insert(Invalidations::CONSTANTS);
        Ok(())
    }

    fn rebuild_font_resources(&mut self) -> Result<(), RenderError> {
        assert!(self.size.is_ready(), "font resources need size resources");
        self.font = ResourceState::Building;
        match self.build_font_resources() {
            Ok(resources) => {
                tracing::info!(
                    cell_size = ?self.cell_size,
                    atlas = ?resources.atlas.layout().size_px,
                    "rebuilt font resources"
                );
                self.font = ResourceState::Ready(resources);
                self.invalidations.remove(Invalidations::FONT);
                self.invalidations.insert(Invalidations::CONSTANTS);
                Ok(())
            }
            Err(err) => {
                self.font = ResourceState::Invalid;
                Err(self.recover(err))
            }
        }
    }

    fn build_font_resources(&mut self) -> Result<FontResources, RenderError> {
        let max_texture = match &self.device {
            ResourceState::Ready(device) => device.max_texture,
            _ => unreachable!("device checked before font rebuild"),
        };
        let layout =
            AtlasLayout::plan(self.cell_size, self.options.atlas_target_cells, max_texture);
        self.backend
            .recreate_atlas(layout.size_px)
            .map_err(RenderError::Backend)?;

        let regular = self.text_format(false, false)?;
        let bold = self.text_format(true, false)?;
        let italic = self.text_format(false, true)?;
        let bold_italic = self.text_format(true, true)?;

        let mut surface = GlyphSurface::new(self.cell_size);
        let cursor_top = (self.cell_size.y as f32 * CURSOR_TOP).round() as u32;
        surface.fill_rect(0, cursor_top, self.cell_size.x as u32, self.cell_size.y as u32);
        self.backend
            .write_atlas_cell(&surface, 0, CURSOR_SLOT)
            .map_err(RenderError::Backend)?;
        surface.clear();

        Ok(FontResources {
            formats: [[regular, bold], [italic, bold_italic]],
            atlas: GlyphAtlas::new(layout),
            surface,
        })
    }

    fn text_format(&mut self, bold: bool, italic: bool) -> Result<TextFormat, RenderError> {
        let request = FontRequest {
            family: self.desired_font.family.clone(),
            size: self.desired_font.size,
            weight: if bold { BOLD_WEIGHT } else { self.desired_font.weight },
            italic,
            dpi: self.dpi,
            antialiasing: self.antialiasing,
        };
        Ok(self.fonts.text_format(&request)?)
    }

    fn notify(&self, event: HostEvent) {
        if let Some(notifier) = &self.notifier {
            if notifier.send(event).is_err() {
                tracing::debug!("host notification channel closed");
            }
        }
    }

    // ---- host mutators ----

    pub fn set_window_size(&mut self, size_px: U16x2) {
        if size_px.has_zero() || size_px == self.size_px {
            return;
        }
        self.size_px = size_px;
        self.cell_count = size_px / self.cell_size;
        self.invalidations.insert(Invalidations::SIZE);
    }

    /// Select `desired` as the font and derive the cell size from it.
    pub fn update_font(&mut self, desired: &DesiredFont) -> Result<FontInfo, RenderError> {
        let info = self.proposed_font(desired, self.dpi)?;
        self.desired_font = desired.clone();
        self.invalidations.insert(Invalidations::FONT);
        if info.cell_size != self.cell_size {
            self.cell_size = info.cell_size;
            self.cell_count = self.size_px / self.cell_size;
            self.invalidations.insert(Invalidations::SIZE);
        }
        tracing::debug!(family = %info.family, cell_size = ?info.cell_size, "font updated");
        Ok(info)
    }

    /// The font and cell size `desired` would produce at `dpi`, without applying it.
    pub fn proposed_font(
        &mut self,
        desired: &DesiredFont,
        dpi: u32,
    ) -> Result<FontInfo, RenderError> {
        let request = FontRequest {
            family: desired.family.clone(),
            size: desired.size,
            weight: desired.weight,
            italic: false,
            dpi: BASE_DPI,
            antialiasing: self.antialiasing,
        };
        let format = self.fonts.text_format(&request)?;
        let metrics = self.fonts.measure(&format, "M")?;
        let scaling = dpi as f32 / BASE_DPI as f32;
        let cell_size = U16x2::new(
            to_cell_extent(metrics.width * scaling),
            to_cell_extent(metrics.height * scaling),
        );
        Ok(FontInfo {
            family: desired.family.clone(),
            size: desired.size,
            weight: desired.weight,
            cell_size,
        })
    }

    pub fn update_dpi(&mut self, dpi: u32) {
        if dpi != self.dpi {
            self.dpi = dpi;
            self.invalidations.insert(Invalidations::FONT);
        }
    }

    pub fn set_antialiasing_mode(&mut self, mode: Antialiasing) {
        self.antialiasing = mode;
        self.invalidations.insert(Invalidations::FONT);
    }

    pub fn update_drawing_brushes(&mut self, brushes: &Brushes, is_default: bool) {
        if !is_default {
            self.colors = [brushes.foreground, brushes.background];
            self.attributes = TextAttributes {
                bold: brushes.bold,
                italic: brushes.italic,
            };
        } else if brushes.background_is_default && brushes.background != self.background {
            self.background = brushes.background;
            self.invalidations.insert(Invalidations::CONSTANTS);
        }
    }

    /// `color` is `0x00BBGGRR`; `alpha` (0..=1) goes into the top byte.
    pub fn set_selection_background(&mut self, color: u32, alpha: f32) {
        let alpha = (alpha.clamp(0.0, 1.0) * 255.0).round() as u32;
        let selection = (color & 0x00ff_ffff) | alpha << 24;
        if selection != self.selection {
            self.selection = selection;
            self.invalidations.insert(Invalidations::CONSTANTS);
        }
    }

    pub fn invalidate_title(&mut self) {
        self.invalidations.insert(Invalidations::TITLE);
    }

    pub fn set_resources_recreated_callback(
        &mut self,
        callback: impl FnMut() -> anyhow::Result<()> + 'static,
    ) {
        self.on_recreated = Some(Box::new(callback));
    }

    pub fn set_host_notifier(&mut self, notifier: Sender<HostEvent>) {
        self.notifier = Some(notifier);
    }

    // ---- queries ----

    pub fn dirty_area(&self) -> CellRect {
        self.dirty
    }

    /// Cell size in pixels.
    pub fn font_size(&self) -> U16x2 {
        self.cell_size
    }

    pub fn cell_count(&self) -> U16x2 {
        self.cell_count
    }

    pub fn scaling(&self) -> f32 {
        self.dpi as f32 / BASE_DPI as f32
    }

    /// Convert a pixel rectangle into the cells it starts in.
    pub fn viewport_in_characters(&self, px: CellRect) -> CellRect {
        let cell = self.cell_size;
        let div = |v: u16, d: u16| v.checked_div(d).unwrap_or(0);
        CellRect::new(
            div(px.left, cell.x),
            div(px.top, cell.y),
            div(px.right, cell.x),
            div(px.bottom, cell.y),
        )
    }

    /// Convert a cell rectangle into pixels.
    pub fn viewport_in_pixels(&self, cells: CellRect) -> CellRect {
        let cell = self.cell_size;
        CellRect::new(
            cells.left.saturating_mul(cell.x),
            cells.top.saturating_mul(cell.y),
            cells.right.saturating_mul(cell.x),
            cells.bottom.saturating_mul(cell.y),
        )
    }

    /// Whether `text` is wider than one cell in the regular face.
    pub fn is_glyph_wide_by_font(&mut self, text: &str) -> Result<bool, RenderError> {
        let format = match self.font.ready_mut() {
            Some(font) => font.formats[0][0].clone(),
            None => self.text_format(false, false)?,
        };
        let metrics = self.fonts.measure(&format, text)?;
        Ok(metrics.width.ceil() > self.cell_size.x as f32)
    }

    /// The host-bindable handle, creating the device first if needed.
    pub fn surface_handle(&mut self) -> Result<Option<B::SurfaceHandle>, RenderError> {
        if !self.backend.has_device() {
            self.create_device_resources()?;
        }
        Ok(self.backend.surface_handle())
    }

    pub fn invalidations(&self) -> Invalidations {
        self.invalidations
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn has_device_resources(&self) -> bool {
        self.device.is_ready()
    }

    pub fn has_size_resources(&self) -> bool {
        self.size.is_ready()
    }

    pub fn has_font_resources(&self) -> bool {
        self.font.is_ready()
    }

    /// Viewport and cell count the size resources were built for.
    pub fn built_size(&self) -> Option<(U16x2, U16x2)> {
        match &self.size {
            ResourceState::Ready(size) => Some((size.size_px, size.cell_count)),
            _ => None,
        }
    }

    pub fn atlas_stats(&self) -> Option<AtlasStats> {
        match &self.font {
            ResourceState::Ready(font) => Some(font.atlas.stats()),
            _ => None,
        }
    }

    pub fn atlas_layout(&self) -> Option<AtlasLayout> {
        match &self.font {
            ResourceState::Ready(font) => Some(*font.atlas.layout()),
            _ => None,
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn grid(&self) -> &CellGrid {
        &self.grid
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn fonts_mut(&mut self) -> &mut F {
        &mut self.fonts
    }
}

fn to_cell_extent(px: f32) -> u16 {
    px.ceil().clamp(1.0, u16::MAX as f32) as u16
}
