use std::fmt;
use std::hash::{Hash, Hasher};

use atlasterm_core::U16x2;

/// Longest key text, counted in UTF-16 code units.
pub const MAX_KEY_UTF16: usize = 15;
/// Widest glyph run the atlas stores, in cells.
pub const MAX_CELL_SPAN: usize = 16;

// Worst case is 15 BMP characters at 3 bytes each.
const KEY_TEXT_BYTES: usize = MAX_KEY_UTF16 * 3;

/// Bold/italic state applied to a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TextAttributes {
    pub bold: bool,
    pub italic: bool,
}

/// Inline, fixed-capacity glyph run text.
///
/// Construction is lossy: characters past [`MAX_KEY_UTF16`] UTF-16 code units
/// are dropped. Only whole characters are kept.
#[derive(Clone, Copy)]
pub struct KeyText {
    bytes: [u8; KEY_TEXT_BYTES],
    len: u8,
}

impl KeyText {
    pub fn truncated(text: &str) -> Self {
        let mut bytes = [0u8; KEY_TEXT_BYTES];
        let mut len = 0;
        let mut units = 0;
        for ch in text.chars() {
            units += ch.len_utf16();
            if units > MAX_KEY_UTF16 {
                break;
            }
            let end = len + ch.len_utf8();
            ch.encode_utf8(&mut bytes[len..end]);
            len = end;
        }
        Self {
            bytes,
            len: len as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for KeyText {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for KeyText {}

impl Hash for KeyText {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl fmt::Debug for KeyText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

/// Identity of one rendered glyph run in the atlas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlyphKey {
    pub text: KeyText,
    pub attributes: TextAttributes,
    cell_span: u8,
}

impl GlyphKey {
    /// Build a key, truncating `text` and clamping `cells` into `1..=16`.
    pub fn new(text: &str, attributes: TextAttributes, cells: usize) -> Self {
        Self {
            text: KeyText::truncated(text),
            attributes,
            cell_span: cells.clamp(1, MAX_CELL_SPAN) as u8,
        }
    }

    pub fn cell_span(&self) -> usize {
        self.cell_span as usize
    }
}

/// Atlas pixel positions of a run's cells, one per cell it spans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlyphSlots {
    slots: [U16x2; MAX_CELL_SPAN],
    len: u8,
}

impl GlyphSlots {
    pub fn push(&mut self, slot: U16x2) {
        assert!(
            (self.len as usize) < MAX_CELL_SPAN,
            "a glyph run spans at most {MAX_CELL_SPAN} cells"
        );
        self.slots[self.len as usize] = slot;
        self.len += 1;
    }

    pub fn as_slice(&self) -> &[U16x2] {
        &self.slots[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
