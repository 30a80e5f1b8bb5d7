use crate::error::{FontError, RenderError};

use super::{FaceId, FontService, GlyphProps, ScriptSegment, ShapeBuffers, TextFormat};

/// How many times one segment is shaped before giving up on glyph buffer growth.
pub const MAX_SHAPING_ATTEMPTS: u32 = 8;

pub const REPLACEMENT_CHARACTER: &str = "\u{FFFD}";

/// One grapheme cluster of a buffer line and the columns it occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cluster<'a> {
    pub text: &'a str,
    pub columns: u16,
}

impl<'a> Cluster<'a> {
    pub fn new(text: &'a str, columns: u16) -> Self {
        Self { text, columns }
    }
}

/// Text that renders as one atlas entry, covering columns `x1..x2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlyphRun<'a> {
    pub text: &'a str,
    pub x1: u16,
    pub x2: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStats {
    pub runs: usize,
    pub replacement_runs: usize,
    pub shaped_segments: usize,
    pub glyphs: usize,
    pub shaping_retries: u32,
}

/// Per-line buffers reused across lines. They grow on demand and never shrink.
#[derive(Debug, Default)]
pub struct ShapingScratch {
    text: String,
    /// Starting column of the cluster each text byte belongs to, plus a trailing total.
    columns: Vec<u16>,
    segments: Vec<ScriptSegment>,
    cluster_map: Vec<u16>,
    can_break_after: Vec<bool>,
    glyph_indices: Vec<u16>,
    glyph_props: Vec<GlyphProps>,
}

impl ShapingScratch {
    /// Flatten `clusters` into the text buffer and its column index.
    pub fn load_line(&mut self, clusters: &[Cluster<'_>]) {
        self.text.clear();
        self.columns.clear();

        let mut column: u16 = 0;
        for cluster in clusters {
            self.text.push_str(cluster.text);
            self.columns
                .extend(std::iter::repeat(column).take(cluster.text.len()));
            column = column.saturating_add(cluster.columns);
        }
        self.columns.push(column);

        self.reserve_line();
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn columns(&self) -> &[u16] {
        &self.columns
    }

    pub fn glyph_capacity(&self) -> usize {
        self.glyph_indices.len()
    }

    fn reserve_line(&mut self) {
        let len = self.text.len();
        let projected_glyphs = 3 * len / 2 + 16;
        if self.cluster_map.len() < len {
            self.cluster_map.resize(len, 0);
        }
        if self.can_break_after.len() < len {
            self.can_break_after.resize(len, false);
        }
        if self.glyph_indices.len() < projected_glyphs {
            self.glyph_indices.resize(projected_glyphs, 0);
        }
        if self.glyph_props.len() < projected_glyphs {
            self.glyph_props.resize(projected_glyphs, GlyphProps::default());
        }
    }
}

/// Shape the line loaded into `scratch` with `format`, calling `emit` once per glyph run.
pub fn shape_line<F>(
    fonts: &mut F,
    format: &TextFormat,
    scratch: &mut ShapingScratch,
    mut emit: impl FnMut(GlyphRun<'_>),
) -> Result<LineStats, RenderError>
where
    F: FontService + ?Sized,
{
    let ShapingScratch {
        text,
        columns,
        segments,
        cluster_map,
        can_break_after,
        glyph_indices,
        glyph_props,
    } = scratch;
    let text = text.as_str();
    let columns = columns.as_slice();
    let mut buffers = GlyphBuffers {
        cluster_map,
        can_break_after,
        glyph_indices,
        glyph_props,
    };
    let mut line = LineEmitter {
        text,
        columns,
        emit: &mut emit,
        stats: LineStats::default(),
    };

    let mut idx = 0;
    while idx < text.len() {
        let mapping = fonts.map_characters(&text[idx..], format)?;
        let mapped_end = advance_to_boundary(text, idx, mapping.mapped_len);

        let Some(face) = mapping.face else {
            line.replacements(idx, mapped_end);
            idx = mapped_end;
            continue;
        };

        let mut pos = idx;
        while pos < mapped_end {
            let complexity = fonts.classify_complexity(&text[pos..mapped_end], face)?;
            let end = advance_to_boundary(text, pos, complexity.len).min(mapped_end);
            if complexity.simple {
                line.clusters(pos, end);
            } else {
                line.complex(fonts, face, format, pos, end, segments, &mut buffers)?;
            }
            pos = end;
        }
        idx = mapped_end;
    }

    Ok(line.stats)
}

/// `from + len` moved forward to a char boundary, at least one character past `from`.
fn advance_to_boundary(text: &str, from: usize, len: usize) -> usize {
    let mut end = from.saturating_add(len.max(1)).min(text.len());
    while !text.is_char_boundary(end) {
        end += 1;
    }
    end
}

struct GlyphBuffers<'s> {
    cluster_map: &'s mut Vec<u16>,
    can_break_after: &'s mut Vec<bool>,
    glyph_indices: &'s mut Vec<u16>,
    glyph_props: &'s mut Vec<GlyphProps>,
}

impl GlyphBuffers<'_> {
    fn shape<F: FontService + ?Sized>(
        &mut self,
        fonts: &mut F,
        text: &str,
        face: FaceId,
        format: &TextFormat,
        segment: &ScriptSegment,
        stats: &mut LineStats,
    ) -> Result<usize, RenderError> {
        let len = text.len();
        let mut attempts = 0;
        loop {
            self.can_break_after[..len].fill(false);
            let out = ShapeBuffers {
                cluster_map: &mut self.cluster_map[..len],
                can_break_after: &mut self.can_break_after[..len],
                glyph_indices: &mut self.glyph_indices[..],
                glyph_props: &mut self.glyph_props[..],
            };
            match fonts.shape(text, face, format, segment, out) {
                Ok(count) => return Ok(count),
                Err(FontError::InsufficientBuffer { required }) => {
                    attempts += 1;
                    let size = self.glyph_indices.len();
                    if attempts >= MAX_SHAPING_ATTEMPTS {
                        return Err(RenderError::ShapingRetriesExhausted {
                            attempts,
                            capacity: size,
                        });
                    }
                    let grown = size + (size >> 1);
                    tracing::debug!(
                        attempts,
                        required,
                        from = size,
                        to = grown,
                        "growing glyph buffers"
                    );
                    self.glyph_indices.resize(grown, 0);
                    self.glyph_props.resize(grown, GlyphProps::default());
                    stats.shaping_retries += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

struct LineEmitter<'t, E> {
    text: &'t str,
    columns: &'t [u16],
    emit: E,
    stats: LineStats,
}

impl<'t, E: FnMut(GlyphRun<'_>)> LineEmitter<'t, E> {
    /// Emit `text[start..end]` unless it covers no columns.
    fn run(&mut self, start: usize, end: usize) -> bool {
        let text = self.text;
        let (x1, x2) = (self.columns[start], self.columns[end]);
        if x2 <= x1 {
            return false;
        }
        (self.emit)(GlyphRun {
            text: &text[start..end],
            x1,
            x2,
        });
        self.stats.runs += 1;
        true
    }

    /// One run per cluster. Characters sharing a cluster stay in one run.
    fn clusters(&mut self, start: usize, end: usize) {
        let mut run_start = start;
        for i in start + 1..end {
            if self.columns[i] != self.columns[run_start] && self.text.is_char_boundary(i) {
                self.run(run_start, i);
                run_start = i;
            }
        }
        self.run(run_start, end);
    }

    /// One replacement glyph per cluster of an unmapped span.
    fn replacements(&mut self, start: usize, end: usize) {
        let mut begin = self.columns[start];
        for &column in &self.columns[start + 1..=end] {
            if column != begin {
                (self.emit)(GlyphRun {
                    text: REPLACEMENT_CHARACTER,
                    x1: begin,
                    x2: column,
                });
                self.stats.runs += 1;
                self.stats.replacement_runs += 1;
                begin = column;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn complex<F: FontService + ?Sized>(
        &mut self,
        fonts: &mut F,
        face: FaceId,
        format: &TextFormat,
        start: usize,
        end: usize,
        segments: &mut Vec<ScriptSegment>,
        buffers: &mut GlyphBuffers<'_>,
    ) -> Result<(), RenderError> {
        let text = self.text;
        let span = &text[start..end];
        segments.clear();
        fonts.analyze_script(span, segments)?;

        // Runs may continue across segments while they still cover no columns.
        let mut run_start = start;
        for segment in segments.iter() {
            let seg_start = start + segment.position.min(span.len());
            let seg_end = (seg_start + segment.len).min(end);
            if seg_start >= seg_end
                || !text.is_char_boundary(seg_start)
                || !text.is_char_boundary(seg_end)
            {
                tracing::trace!(?segment, "skipping malformed script segment");
                continue;
            }
            let seg_text = &text[seg_start..seg_end];
            let glyphs =
                buffers.shape(fonts, seg_text, face, format, segment, &mut self.stats)?;
            self.stats.glyphs += glyphs;
            self.stats.shaped_segments += 1;

            let breaks = &mut buffers.can_break_after[..seg_text.len()];
            if let Some(last) = breaks.last_mut() {
                *last = true;
            }
            for i in 0..seg_text.len() {
                let next = seg_start + i + 1;
                if breaks[i] && seg_text.is_char_boundary(i + 1) && self.run(run_start, next) {
                    run_start = next;
                }
            }
        }

        if run_start < end {
            tracing::trace!(tail = &text[run_start..end], "dropping zero-width tail");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_line_builds_column_index_per_byte() {
        let mut scratch = ShapingScratch::default();
        scratch.load_line(&[
            Cluster::new("a", 1),
            Cluster::new("漢", 2),
            Cluster::new("e\u{301}", 1),
        ]);
        assert_eq!(scratch.text(), "a漢e\u{301}");
        // "a" = 1 byte, "漢" = 3 bytes, "e" + U+0301 = 3 bytes, then the sentinel.
        assert_eq!(scratch.columns(), &[0, 1, 1, 1, 3, 3, 3, 4]);
        assert_eq!(scratch.glyph_capacity(), 3 * 7 / 2 + 16);
    }

    #[test]
    fn scratch_never_shrinks() {
        let mut scratch = ShapingScratch::default();
        let long = [Cluster::new("x", 1); 200];
        scratch.load_line(&long);
        let capacity = scratch.glyph_capacity();
        scratch.load_line(&[Cluster::new("y", 1)]);
        assert_eq!(scratch.glyph_capacity(), capacity);
        assert_eq!(scratch.columns(), &[0, 1]);
    }

    #[test]
    fn boundary_advances_past_partial_characters() {
        let text = "a漢b";
        assert_eq!(advance_to_boundary(text, 0, 0), 1);
        assert_eq!(advance_to_boundary(text, 1, 1), 4);
        assert_eq!(advance_to_boundary(text, 1, 99), 5);
    }
}
