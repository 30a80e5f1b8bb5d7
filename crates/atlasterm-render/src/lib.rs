//! Glyph-atlas rendering core for a terminal grid.
//!
//! [`AtlasEngine`] drives a [`RenderBackend`] and a [`FontService`]: lines of
//! grapheme clusters are shaped into glyph runs, each run is deduplicated
//! through the [`GlyphAtlas`], and only first-seen runs are rasterized.

pub mod atlas;
pub mod backend;
pub mod engine;
pub mod error;
pub mod glyph;
pub mod grid;
pub mod invalidation;
pub mod shaping;
pub mod surface;

pub use atlas::{AtlasLayout, AtlasStats, GlyphAtlas};
pub use backend::{FrameConstants, RenderBackend, SoftwareBackend, WgpuBackend, WgpuTarget};
pub use engine::{
    AtlasEngine, Brushes, CursorOptions, DesiredFont, EngineOptions, EngineStats, FontInfo,
    FramePhase,
};
pub use error::{BackendError, FontError, RenderError};
pub use glyph::{GlyphKey, GlyphSlots, TextAttributes};
pub use grid::{Cell, CellFlags, CellGrid};
pub use invalidation::Invalidations;
pub use shaping::{Cluster, FontService, SystemFonts};
pub use surface::GlyphSurface;
