//! Font fallback, shaping and rasterization contract, plus the line pipeline built on it.
//!
//! Text handed to a [`FontService`] is UTF-8. Lengths and positions are byte
//! offsets that always fall on character boundaries.

pub mod pipeline;
pub mod system;

use atlasterm_core::config::Antialiasing;

use crate::error::FontError;
use crate::surface::GlyphSurface;

pub use pipeline::{shape_line, Cluster, GlyphRun, LineStats, ShapingScratch};
pub use system::SystemFonts;

/// Handle to a concrete font face owned by a font service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaceId(pub u32);

/// What the host asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct FontRequest {
    pub family: String,
    /// Size in points.
    pub size: f32,
    pub weight: u16,
    pub italic: bool,
    pub dpi: u32,
    pub antialiasing: Antialiasing,
}

impl FontRequest {
    pub fn size_px(&self) -> f32 {
        self.size * self.dpi as f32 / 72.0
    }
}

/// A resolved family/weight/style/size combination.
#[derive(Debug, Clone, PartialEq)]
pub struct TextFormat {
    pub face: FaceId,
    pub size_px: f32,
    pub weight: u16,
    pub italic: bool,
    pub antialiasing: Antialiasing,
}

/// Layout box of a measured string, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TextMetrics {
    pub width: f32,
    pub height: f32,
    /// Baseline offset from the top of the line box.
    pub ascent: f32,
}

/// Longest prefix one face can render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FontMapping {
    pub mapped_len: usize,
    /// `None` when no available face covers the prefix.
    pub face: Option<FaceId>,
}

/// Longest prefix with uniform shaping complexity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Complexity {
    /// Every character maps to exactly one glyph occupying its own cell.
    pub simple: bool,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShapingHint {
    #[default]
    Default,
    /// Control characters and similar text with nothing to draw.
    NoVisual,
}

/// Run of text with a single script and bidi level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptSegment {
    pub position: usize,
    pub len: usize,
    /// ISO 15924 tag, e.g. `*b"Latn"`.
    pub script: [u8; 4],
    pub hint: ShapingHint,
    pub bidi_level: u8,
}

impl ScriptSegment {
    pub fn is_rtl(&self) -> bool {
        self.bidi_level & 1 == 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlyphProps {
    pub cluster_start: bool,
    pub zero_width: bool,
}

/// Caller-owned output buffers for [`FontService::shape`].
///
/// `cluster_map` and `can_break_after` hold one entry per byte of the shaped
/// text. The glyph buffers bound how many glyphs the call may produce.
#[derive(Debug)]
pub struct ShapeBuffers<'a> {
    pub cluster_map: &'a mut [u16],
    pub can_break_after: &'a mut [bool],
    pub glyph_indices: &'a mut [u16],
    pub glyph_props: &'a mut [GlyphProps],
}

/// Font fallback, shaping and rasterization service the engine drives.
pub trait FontService {
    fn text_format(&mut self, request: &FontRequest) -> Result<TextFormat, FontError>;

    fn measure(&mut self, format: &TextFormat, text: &str) -> Result<TextMetrics, FontError>;

    /// Map the longest prefix of `text` renderable by one face, starting from `format`'s face.
    fn map_characters(&mut self, text: &str, format: &TextFormat)
        -> Result<FontMapping, FontError>;

    fn classify_complexity(&mut self, text: &str, face: FaceId) -> Result<Complexity, FontError>;

    /// Replace `segments` with the script/bidi segmentation of `text`.
    fn analyze_script(
        &mut self,
        text: &str,
        segments: &mut Vec<ScriptSegment>,
    ) -> Result<(), FontError>;

    /// Shape one segment. Returns the glyph count, or
    /// [`FontError::InsufficientBuffer`] when the glyph buffers are too small.
    fn shape(
        &mut self,
        text: &str,
        face: FaceId,
        format: &TextFormat,
        segment: &ScriptSegment,
        out: ShapeBuffers<'_>,
    ) -> Result<usize, FontError>;

    /// Draw `text` centred across the first `cells` cells of `surface`.
    fn rasterize(
        &mut self,
        text: &str,
        format: &TextFormat,
        cells: usize,
        surface: &mut GlyphSurface,
    ) -> Result<(), FontError>;
}
