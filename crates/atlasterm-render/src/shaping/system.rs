//! [`FontService`] over the system font database.
//!
//! Faces come from `fontdb`, shaping from `rustybuzz`, script and bidi
//! analysis from `unicode-script`/`unicode-bidi`, and rasterization from `swash`.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use ahash::AHashMap;
use atlasterm_core::config::Antialiasing;
use fontdb::{Database, Family, Query};
use rustybuzz::UnicodeBuffer;
use swash::scale::image::Content;
use swash::scale::{Render, ScaleContext, Source, StrikeWith};
use swash::zeno::Format;
use swash::FontRef;
use unicode_script::{Script, UnicodeScript};

use super::{
    Complexity, FaceId, FontMapping, FontRequest, FontService, GlyphProps, ScriptSegment,
    ShapeBuffers, ShapingHint, TextFormat, TextMetrics,
};
use crate::error::FontError;
use crate::surface::GlyphSurface;

/// Families tried, in order, for characters the requested face lacks.
pub const FALLBACK_FAMILIES: &[&str] = &[
    "DejaVu Sans Mono",
    "Noto Sans Mono",
    "Noto Sans CJK JP",
    "Noto Sans CJK SC",
    "Microsoft YaHei",
    "Noto Sans Symbols",
    "Noto Sans Symbols 2",
    "Segoe UI Symbol",
    "DejaVu Sans",
    "Noto Color Emoji",
    "Apple Color Emoji",
    "Segoe UI Emoji",
];

struct LoadedFace {
    data: Arc<Vec<u8>>,
    index: u32,
}

impl LoadedFace {
    fn font_ref(&self) -> Option<FontRef<'_>> {
        FontRef::from_index(&self.data, self.index as usize)
    }

    fn shaper(&self) -> Option<rustybuzz::Face<'_>> {
        rustybuzz::Face::from_slice(&self.data, self.index)
    }

    fn covers(&self, ch: char) -> bool {
        self.font_ref().map_or(false, |font| font.charmap().map(ch) != 0)
    }
}

/// A glyph placed on the scratch surface, in pixels relative to the run origin.
struct PlacedGlyph {
    face: FaceId,
    glyph: u16,
    x: f32,
    y: f32,
}

pub struct SystemFonts {
    db: Database,
    faces: Vec<LoadedFace>,
    by_id: AHashMap<fontdb::ID, FaceId>,
    fallbacks: Option<Vec<FaceId>>,
    scale: ScaleContext,
    cluster_starts: Vec<bool>,
}

impl std::fmt::Debug for SystemFonts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemFonts")
            .field("database_faces", &self.db.len())
            .field("loaded_faces", &self.faces.len())
            .finish()
    }
}

impl SystemFonts {
    /// Load every system font into a fresh database.
    pub fn new() -> Self {
        let mut db = Database::new();
        db.load_system_fonts();
        tracing::info!(faces = db.len(), "loaded system fonts");
        Self::with_database(db)
    }

    pub fn with_database(db: Database) -> Self {
        Self {
            db,
            faces: Vec::new(),
            by_id: AHashMap::new(),
            fallbacks: None,
            scale: ScaleContext::new(),
            cluster_starts: Vec::new(),
        }
    }

    pub fn load_font_file(&mut self, path: &Path) -> Result<(), FontError> {
        self.db
            .load_font_file(path)
            .map_err(|source| FontError::Load {
                path: path.to_path_buf(),
                source,
            })?;
        self.fallbacks = None;
        tracing::debug!(path = %path.display(), "loaded font file");
        Ok(())
    }

    pub fn load_font_data(&mut self, data: Vec<u8>) {
        self.db.load_font_data(data);
        self.fallbacks = None;
    }

    fn load(&mut self, id: fontdb::ID) -> Result<FaceId, FontError> {
        if let Some(face) = self.by_id.get(&id) {
            return Ok(*face);
        }
        let face_id = FaceId(self.faces.len() as u32);
        let (data, index) = self
            .db
            .with_face_data(id, |data, index| (data.to_vec(), index))
            .ok_or(FontError::InvalidFace(face_id))?;
        let face = LoadedFace {
            data: Arc::new(data),
            index,
        };
        if face.font_ref().is_none() {
            return Err(FontError::InvalidFace(face_id));
        }
        self.faces.push(face);
        self.by_id.insert(id, face_id);
        Ok(face_id)
    }

    fn face(&self, id: FaceId) -> Result<&LoadedFace, FontError> {
        self.faces
            .get(id.0 as usize)
            .ok_or(FontError::UnknownFace(id))
    }

    fn ensure_fallbacks(&mut self) {
        if self.fallbacks.is_some() {
            return;
        }
        let mut chain = Vec::new();
        for family in FALLBACK_FAMILIES {
            let query = Query {
                families: &[Family::Name(family)],
                ..Query::default()
            };
            let Some(id) = self.db.query(&query) else {
                continue;
            };
            match self.load(id) {
                Ok(face) if !chain.contains(&face) => chain.push(face),
                Ok(_) => {}
                Err(err) => tracing::debug!(family, %err, "skipping fallback family"),
            }
        }
        tracing::debug!(faces = chain.len(), "built font fallback chain");
        self.fallbacks = Some(chain);
    }

    /// First face able to draw `ch`: `base`, then the fallback chain.
    fn face_for(&self, ch: char, base: FaceId) -> Option<FaceId> {
        if self.face(base).map_or(false, |face| face.covers(ch)) {
            return Some(base);
        }
        self.fallbacks
            .as_deref()
            .unwrap_or_default()
            .iter()
            .copied()
            .find(|&id| self.face(id).map_or(false, |face| face.covers(ch)))
    }

    /// Longest prefix of `text` drawn by a single face choice.
    fn map_prefix(&self, text: &str, base: FaceId) -> FontMapping {
        let mut chars = text.chars();
        let Some(first) = chars.next() else {
            return FontMapping {
                mapped_len: 0,
                face: None,
            };
        };
        let face = self.face_for(first, base);
        let mut mapped_len = first.len_utf8();
        for ch in chars {
            // Marks stay with the face of the character they attach to.
            if !is_mark(ch) && self.face_for(ch, base) != face {
                break;
            }
            mapped_len += ch.len_utf8();
        }
        FontMapping { mapped_len, face }
    }

    fn line_metrics(&self, format: &TextFormat) -> Result<TextMetrics, FontError> {
        let font = self
            .face(format.face)?
            .font_ref()
            .ok_or(FontError::InvalidFace(format.face))?;
        let metrics = font.metrics(&[]);
        let scale = format.size_px / metrics.units_per_em.max(1) as f32;
        Ok(TextMetrics {
            width: 0.0,
            height: (metrics.ascent + metrics.descent + metrics.leading) * scale,
            ascent: metrics.ascent * scale,
        })
    }

    /// Shape `text` face run by face run and place every glyph on one line.
    fn layout(
        &self,
        text: &str,
        format: &TextFormat,
    ) -> Result<(Vec<PlacedGlyph>, f32), FontError> {
        let mut placed = Vec::new();
        let mut pen = 0.0f32;
        let mut rest = text;
        while !rest.is_empty() {
            let mapping = self.map_prefix(rest, format.face);
            let (run, tail) = rest.split_at(mapping.mapped_len);
            rest = tail;
            let face_id = mapping.face.unwrap_or(format.face);
            let face = self.face(face_id)?;
            let shaper = face.shaper().ok_or(FontError::InvalidFace(face_id))?;
            let scale = format.size_px / shaper.units_per_em().max(1) as f32;

            let mut buffer = UnicodeBuffer::new();
            buffer.push_str(if mapping.face.is_some() { run } else { "\u{FFFD}" });
            let glyphs = rustybuzz::shape(&shaper, &[], buffer);
            for (info, pos) in glyphs.glyph_infos().iter().zip(glyphs.glyph_positions()) {
                placed.push(PlacedGlyph {
                    face: face_id,
                    glyph: info.glyph_id as u16,
                    x: pen + pos.x_offset as f32 * scale,
                    y: -(pos.y_offset as f32) * scale,
                });
                pen += pos.x_advance as f32 * scale;
            }
        }
        Ok((placed, pen))
    }
}

impl Default for SystemFonts {
    fn default() -> Self {
        Self::new()
    }
}

impl FontService for SystemFonts {
    fn text_format(&mut self, request: &FontRequest) -> Result<TextFormat, FontError> {
        let families = [Family::Name(&request.family), Family::Monospace];
        let query = Query {
            families: &families,
            weight: fontdb::Weight(request.weight),
            style: if request.italic {
                fontdb::Style::Italic
            } else {
                fontdb::Style::Normal
            },
            ..Query::default()
        };
        let id = self
            .db
            .query(&query)
            .ok_or_else(|| FontError::FamilyNotFound(request.family.clone()))?;
        let face = self.load(id)?;
        self.ensure_fallbacks();
        tracing::debug!(
            family = %request.family,
            weight = request.weight,
            italic = request.italic,
            ?face,
            "resolved text format"
        );
        Ok(TextFormat {
            face,
            size_px: request.size_px(),
            weight: request.weight,
            italic: request.italic,
            antialiasing: request.antialiasing,
        })
    }

    fn measure(&mut self, format: &TextFormat, text: &str) -> Result<TextMetrics, FontError> {
        self.ensure_fallbacks();
        let line = self.line_metrics(format)?;
        let (_, width) = self.layout(text, format)?;
        Ok(TextMetrics { width, ..line })
    }

    fn map_characters(
        &mut self,
        text: &str,
        format: &TextFormat,
    ) -> Result<FontMapping, FontError> {
        self.ensure_fallbacks();
        self.face(format.face)?;
        Ok(self.map_prefix(text, format.face))
    }

    fn classify_complexity(&mut self, text: &str, face: FaceId) -> Result<Complexity, FontError> {
        let face = self.face(face)?;
        let mut chars = text.chars().peekable();
        let mut simple = None;
        let mut len = 0;
        while let Some(ch) = chars.next() {
            let next_is_mark = chars.peek().map_or(false, |&next| is_mark(next));
            let this = face.covers(ch) && !is_mark(ch) && !needs_shaping(ch) && !next_is_mark;
            match simple {
                None => simple = Some(this),
                Some(prev) if prev != this => break,
                Some(_) => {}
            }
            len += ch.len_utf8();
        }
        Ok(Complexity {
            simple: simple.unwrap_or(true),
            len,
        })
    }

    fn analyze_script(
        &mut self,
        text: &str,
        segments: &mut Vec<ScriptSegment>,
    ) -> Result<(), FontError> {
        segments.clear();
        if text.is_empty() {
            return Ok(());
        }
        let bidi = unicode_bidi::BidiInfo::new(text, None);

        let mut current: Option<(ScriptSegment, Script, bool)> = None;
        for (pos, ch) in text.char_indices() {
            let level = bidi.levels[pos].number();
            let script = match ch.script() {
                Script::Common | Script::Inherited | Script::Unknown => None,
                script => Some(script),
            };
            let visual = !ch.is_control();

            if let Some((segment, seg_script, seg_visual)) = current.as_mut() {
                let same_script =
                    script.map_or(true, |s| *seg_script == Script::Common || *seg_script == s);
                if same_script && segment.bidi_level == level {
                    if let Some(s) = script {
                        if *seg_script == Script::Common {
                            *seg_script = s;
                            segment.script = script_tag(s);
                        }
                    }
                    segment.len += ch.len_utf8();
                    *seg_visual |= visual;
                    continue;
                }
            }

            if let Some((segment, _, seg_visual)) = current.take() {
                segments.push(finish_segment(segment, seg_visual));
            }
            let resolved = script.unwrap_or(Script::Common);
            current = Some((
                ScriptSegment {
                    position: pos,
                    len: ch.len_utf8(),
                    script: script_tag(resolved),
                    hint: ShapingHint::Default,
                    bidi_level: level,
                },
                resolved,
                visual,
            ));
        }
        if let Some((segment, _, seg_visual)) = current {
            segments.push(finish_segment(segment, seg_visual));
        }
        Ok(())
    }

    fn shape(
        &mut self,
        text: &str,
        face: FaceId,
        _format: &TextFormat,
        segment: &ScriptSegment,
        out: ShapeBuffers<'_>,
    ) -> Result<usize, FontError> {
        out.can_break_after.fill(false);
        out.cluster_map.fill(0);
        if segment.hint == ShapingHint::NoVisual {
            return Ok(0);
        }

        let loaded = self.faces.get(face.0 as usize).ok_or(FontError::UnknownFace(face))?;
        let shaper = loaded.shaper().ok_or(FontError::InvalidFace(face))?;

        let mut buffer = UnicodeBuffer::new();
        buffer.push_str(text);
        buffer.set_direction(if segment.is_rtl() {
            rustybuzz::Direction::RightToLeft
        } else {
            rustybuzz::Direction::LeftToRight
        });
        if let Ok(script) = std::str::from_utf8(&segment.script)
            .map_err(|_| ())
            .and_then(|tag| rustybuzz::Script::from_str(tag).map_err(|_| ()))
        {
            buffer.set_script(script);
        }

        let glyphs = rustybuzz::shape(&shaper, &[], buffer);
        let infos = glyphs.glyph_infos();
        let positions = glyphs.glyph_positions();
        if infos.len() > out.glyph_indices.len() || infos.len() > out.glyph_props.len() {
            return Err(FontError::InsufficientBuffer {
                required: infos.len(),
            });
        }

        self.cluster_starts.clear();
        self.cluster_starts.resize(text.len(), false);
        for (i, (info, pos)) in infos.iter().zip(positions).enumerate() {
            let cluster = info.cluster as usize;
            let cluster_start = i == 0 || infos[i - 1].cluster != info.cluster;
            out.glyph_indices[i] = info.glyph_id as u16;
            out.glyph_props[i] = GlyphProps {
                cluster_start,
                zero_width: pos.x_advance == 0,
            };
            if cluster_start && cluster < text.len() && !self.cluster_starts[cluster] {
                self.cluster_starts[cluster] = true;
                out.cluster_map[cluster] = i as u16;
                if cluster > 0 && !info.unsafe_to_break() {
                    out.can_break_after[cluster - 1] = true;
                }
            }
        }
        for byte in 1..text.len() {
            if !self.cluster_starts[byte] {
                out.cluster_map[byte] = out.cluster_map[byte - 1];
            }
        }
        Ok(infos.len())
    }

    fn rasterize(
        &mut self,
        text: &str,
        format: &TextFormat,
        cells: usize,
        surface: &mut GlyphSurface,
    ) -> Result<(), FontError> {
        self.ensure_fallbacks();
        let line = self.line_metrics(format)?;
        let (glyphs, advance) = self.layout(text, format)?;

        let cell = surface.cell_size();
        let area_width = (cells * cell.x as usize) as f32;
        let origin_x = ((area_width - advance) / 2.0).round();
        let baseline = ((cell.y as f32 - line.height) / 2.0 + line.ascent).round();
        let aliased = format.antialiasing == Antialiasing::Aliased;

        let Self { faces, scale, .. } = self;
        for placed in &glyphs {
            let Some(font) = faces.get(placed.face.0 as usize).and_then(LoadedFace::font_ref) else {
                continue;
            };
            let mut scaler = scale.builder(font).size(format.size_px).hint(true).build();
            let Some(image) = Render::new(&[
                Source::ColorOutline(0),
                Source::ColorBitmap(StrikeWith::BestFit),
                Source::Outline,
            ])
            .format(Format::Alpha)
            .render(&mut scaler, placed.glyph) else {
                continue;
            };

            let left = (origin_x + placed.x).round() as i32 + image.placement.left;
            let top = (baseline + placed.y).round() as i32 - image.placement.top;
            let (width, height) = (image.placement.width, image.placement.height);
            match image.content {
                Content::Mask if aliased => {
                    let mask: Vec<u8> = image
                        .data
                        .iter()
                        .map(|&a| if a > 127 { 255 } else { 0 })
                        .collect();
                    surface.draw_mask(left, top, width, height, &mask);
                }
                Content::Mask => surface.draw_mask(left, top, width, height, &image.data),
                Content::Color => surface.draw_rgba(left, top, width, height, &image.data),
                Content::SubpixelMask => {
                    tracing::trace!("unexpected subpixel mask for alpha render, skipping glyph");
                }
            }
        }
        Ok(())
    }
}

fn script_tag(script: Script) -> [u8; 4] {
    let mut tag = *b"Zyyy";
    for (dst, src) in tag.iter_mut().zip(script.short_name().bytes()) {
        *dst = src;
    }
    tag
}

fn finish_segment(mut segment: ScriptSegment, visual: bool) -> ScriptSegment {
    if !visual {
        segment.hint = ShapingHint::NoVisual;
    }
    segment
}

/// Combining marks, joiners, variation selectors and emoji modifiers.
fn is_mark(ch: char) -> bool {
    ch.script() == Script::Inherited || matches!(ch, '\u{200D}' | '\u{1F3FB}'..='\u{1F3FF}')
}

/// Characters whose glyphs depend on their neighbours.
fn needs_shaping(ch: char) -> bool {
    // Regional indicators and conjoining Hangul jamo.
    if matches!(
        ch,
        '\u{1F1E6}'..='\u{1F1FF}'
            | '\u{1100}'..='\u{11FF}'
            | '\u{A960}'..='\u{A97F}'
            | '\u{D7B0}'..='\u{D7FF}'
    ) {
        return true;
    }
    matches!(
        ch.script(),
        Script::Arabic
            | Script::Hebrew
            | Script::Syriac
            | Script::Thaana
            | Script::Nko
            | Script::Devanagari
            | Script::Bengali
            | Script::Gurmukhi
            | Script::Gujarati
            | Script::Oriya
            | Script::Tamil
            | Script::Telugu
            | Script::Kannada
            | Script::Malayalam
            | Script::Sinhala
            | Script::Thai
            | Script::Lao
            | Script::Tibetan
            | Script::Myanmar
            | Script::Khmer
            | Script::Mongolian
    )
}
