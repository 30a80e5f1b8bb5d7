#![allow(dead_code)]

use atlasterm_core::U16x2;
use atlasterm_render::error::FontError;
use atlasterm_render::shaping::{
    Cluster, Complexity, FaceId, FontMapping, FontRequest, FontService, GlyphProps,
    ScriptSegment, ShapeBuffers, ShapingHint, TextFormat, TextMetrics,
};
use atlasterm_render::surface::GlyphSurface;
use atlasterm_render::{AtlasEngine, DesiredFont, EngineOptions, SoftwareBackend};

pub const BASE_FACE: FaceId = FaceId(0);

/// Deterministic font service: every face is monospace at half an em per column.
///
/// Private-use characters have no face, U+0300..U+036F are combining marks,
/// Hebrew/Arabic need full shaping and CJK ideographs are two columns wide.
#[derive(Debug, Default)]
pub struct MockFonts {
    /// Number of upcoming `shape` calls that report a too-small glyph buffer.
    pub fail_shaping: u32,
    /// Glyph capacity seen by each `shape` call.
    pub shape_capacities: Vec<usize>,
    /// Number of upcoming `rasterize` calls that fail.
    pub fail_rasterize: u32,
    pub rasterized: Vec<String>,
    pub requests: Vec<FontRequest>,
}

pub fn is_unmapped(ch: char) -> bool {
    ('\u{E000}'..='\u{F8FF}').contains(&ch)
}

pub fn is_mark(ch: char) -> bool {
    ('\u{0300}'..='\u{036F}').contains(&ch)
}

fn is_rtl(ch: char) -> bool {
    ('\u{0590}'..='\u{08FF}').contains(&ch)
}

fn is_wide(ch: char) -> bool {
    ('\u{2E80}'..='\u{9FFF}').contains(&ch) || ('\u{AC00}'..='\u{D7A3}').contains(&ch)
}

pub fn columns(ch: char) -> u16 {
    if is_mark(ch) {
        0
    } else if is_wide(ch) {
        2
    } else {
        1
    }
}

/// Split `text` into clusters, attaching combining marks to the preceding character.
pub fn clusters(text: &str) -> Vec<Cluster<'_>> {
    let mut spans: Vec<(usize, usize, u16)> = Vec::new();
    for (pos, ch) in text.char_indices() {
        let end = pos + ch.len_utf8();
        match spans.last_mut() {
            Some(last) if is_mark(ch) => last.1 = end,
            _ => spans.push((pos, end, columns(ch).max(1))),
        }
    }
    spans
        .into_iter()
        .map(|(start, end, cols)| Cluster::new(&text[start..end], cols))
        .collect()
}

impl FontService for MockFonts {
    fn text_format(&mut self, request: &FontRequest) -> Result<TextFormat, FontError> {
        self.requests.push(request.clone());
        if request.family == "Missing" {
            return Err(FontError::FamilyNotFound(request.family.clone()));
        }
        Ok(TextFormat {
            face: BASE_FACE,
            size_px: request.size_px(),
            weight: request.weight,
            italic: request.italic,
            antialiasing: request.antialiasing,
        })
    }

    fn measure(&mut self, format: &TextFormat, text: &str) -> Result<TextMetrics, FontError> {
        let cols: u16 = text.chars().map(columns).sum();
        Ok(TextMetrics {
            width: cols as f32 * format.size_px * 0.5,
            height: format.size_px,
            ascent: format.size_px * 0.8,
        })
    }

    fn map_characters(
        &mut self,
        text: &str,
        format: &TextFormat,
    ) -> Result<FontMapping, FontError> {
        let mut chars = text.chars();
        let Some(first) = chars.next() else {
            return Ok(FontMapping {
                mapped_len: 0,
                face: Some(format.face),
            });
        };
        let unmapped = is_unmapped(first);
        let mut mapped_len = first.len_utf8();
        for ch in chars {
            if !is_mark(ch) && is_unmapped(ch) != unmapped {
                break;
            }
            mapped_len += ch.len_utf8();
        }
        Ok(FontMapping {
            mapped_len,
            face: (!unmapped).then_some(format.face),
        })
    }

    fn classify_complexity(&mut self, text: &str, _face: FaceId) -> Result<Complexity, FontError> {
        let chars: Vec<char> = text.chars().collect();
        let simple_at = |i: usize| {
            !is_mark(chars[i])
                && !is_rtl(chars[i])
                && chars.get(i + 1).map_or(true, |next| !is_mark(*next))
        };
        let simple = chars.is_empty() || simple_at(0);
        let mut len = 0;
        for i in 0..chars.len() {
            if simple_at(i) != simple {
                break;
            }
            len += chars[i].len_utf8();
        }
        Ok(Complexity { simple, len })
    }

    fn analyze_script(
        &mut self,
        text: &str,
        segments: &mut Vec<ScriptSegment>,
    ) -> Result<(), FontError> {
        segments.clear();
        segments.push(ScriptSegment {
            position: 0,
            len: text.len(),
            script: *b"Zyyy",
            hint: ShapingHint::Default,
            bidi_level: u8::from(text.chars().any(is_rtl)),
        });
        Ok(())
    }

    fn shape(
        &mut self,
        text: &str,
        _face: FaceId,
        _format: &TextFormat,
        _segment: &ScriptSegment,
        out: ShapeBuffers<'_>,
    ) -> Result<usize, FontError> {
        self.shape_capacities.push(out.glyph_indices.len());
        if self.fail_shaping > 0 {
            self.fail_shaping -= 1;
            return Err(FontError::InsufficientBuffer {
                required: out.glyph_indices.len() + 1,
            });
        }

        let chars: Vec<(usize, char)> = text.char_indices().collect();
        if chars.len() > out.glyph_indices.len() {
            return Err(FontError::InsufficientBuffer {
                required: chars.len(),
            });
        }
        let mut cluster_glyph = 0;
        for (i, &(pos, ch)) in chars.iter().enumerate() {
            let cluster_start = i == 0 || !is_mark(ch);
            if cluster_start {
                cluster_glyph = i;
            }
            out.glyph_indices[i] = ch as u16;
            out.glyph_props[i] = GlyphProps {
                cluster_start,
                zero_width: is_mark(ch),
            };
            let end = pos + ch.len_utf8();
            out.cluster_map[pos..end].fill(cluster_glyph as u16);
            let next_is_mark = chars.get(i + 1).map_or(false, |&(_, next)| is_mark(next));
            out.can_break_after[end - 1] = !next_is_mark;
        }
        Ok(chars.len())
    }

    fn rasterize(
        &mut self,
        text: &str,
        _format: &TextFormat,
        cells: usize,
        surface: &mut GlyphSurface,
    ) -> Result<(), FontError> {
        if self.fail_rasterize > 0 {
            self.fail_rasterize -= 1;
            return Err(FontError::UnknownFace(FaceId(9)));
        }
        self.rasterized.push(text.to_string());
        let cell = surface.cell_size();
        surface.fill_rect(
            0,
            2,
            cells as u32 * cell.x as u32,
            (cell.y as u32).saturating_sub(2),
        );
        Ok(())
    }
}

pub fn mock_font() -> DesiredFont {
    DesiredFont {
        family: "Mock Mono".into(),
        size: 12.0,
        weight: 400,
    }
}

/// Engine with 8x16 cells on an 800x400 viewport, before its first frame.
pub fn engine() -> AtlasEngine<SoftwareBackend, MockFonts> {
    let mut engine = AtlasEngine::new(
        SoftwareBackend::new(),
        MockFonts::default(),
        EngineOptions::default(),
    );
    let info = engine.update_font(&mock_font()).expect("update font");
    assert_eq!(info.cell_size, U16x2::new(8, 16));
    engine.set_window_size(U16x2::new(800, 400));
    engine
}

pub fn mock_format(fonts: &mut MockFonts) -> TextFormat {
    fonts
        .text_format(&FontRequest {
            family: "Mock Mono".into(),
            size: 12.0,
            weight: 400,
            italic: false,
            dpi: 96,
            antialiasing: atlasterm_core::config::Antialiasing::Grayscale,
        })
        .expect("format")
}
