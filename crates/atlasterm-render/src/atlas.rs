use ahash::AHashMap;
use atlasterm_core::U16x2;
use std::collections::hash_map::Entry;

use crate::glyph::{GlyphKey, GlyphSlots};

/// Pixel position reserved for the cursor glyph.
pub const CURSOR_SLOT: U16x2 = U16x2::ZERO;

/// Dimensions of one atlas generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasLayout {
    pub cell_size: U16x2,
    /// Capacity in cells per row and per column.
    pub cells: U16x2,
    pub size_px: U16x2,
}

impl AtlasLayout {
    /// Size an atlas that holds roughly `target_cells` cells of `cell_size`
    /// while each side stays within `max_texture` pixels.
    pub fn plan(cell_size: U16x2, target_cells: u32, max_texture: u32) -> Self {
        assert!(!cell_size.has_zero(), "atlas cell size must be non-zero");
        let max = max_texture.min(u16::MAX as u32);
        let target = target_cells.max(2);
        let csx = cell_size.x as u32;
        let csy = cell_size.y as u32;

        // Two columns at least, so the first glyph slot next to the cursor exists.
        let x_fit = target.min(max / csx).max(2);
        let y_fit = ((target + x_fit - 1) / x_fit).min(max / csy).max(1);

        let cells = U16x2::new(x_fit as u16, y_fit as u16);
        let size_px = U16x2::new(
            (x_fit * csx).min(u16::MAX as u32) as u16,
            (y_fit * csy).min(u16::MAX as u32) as u16,
        );
        Self {
            cell_size,
            cells,
            size_px,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.area()
    }
}

/// Bump allocator handing out cell-sized atlas positions left to right, top to bottom.
#[derive(Debug)]
pub struct AtlasAllocator {
    cell_size: U16x2,
    size_px: U16x2,
    next: U16x2,
    wraps: u32,
}

impl AtlasAllocator {
    pub fn new(layout: &AtlasLayout) -> Self {
        Self {
            cell_size: layout.cell_size,
            size_px: layout.size_px,
            next: Self::first_slot(layout.cell_size),
            wraps: 0,
        }
    }

    fn first_slot(cell_size: U16x2) -> U16x2 {
        U16x2::new(cell_size.x, 0)
    }

    /// Next free slot. Once the atlas is exhausted allocation starts over
    /// next to the cursor slot and hands out positions that are still in use.
    pub fn allocate(&mut self) -> U16x2 {
        let slot = self.next;

        let x = self.next.x as u32 + self.cell_size.x as u32;
        if x + self.cell_size.x as u32 <= self.size_px.x as u32 {
            self.next.x = x as u16;
            return slot;
        }

        let y = self.next.y as u32 + self.cell_size.y as u32;
        if y + self.cell_size.y as u32 <= self.size_px.y as u32 {
            self.next = U16x2::new(0, y as u16);
            return slot;
        }

        self.next = Self::first_slot(self.cell_size);
        self.wraps += 1;
        tracing::warn!(
            wraps = self.wraps,
            atlas = ?self.size_px,
            "glyph atlas exhausted, reusing slots from the start"
        );
        slot
    }

    pub fn wraps(&self) -> u32 {
        self.wraps
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtlasStats {
    pub hits: u64,
    pub misses: u64,
    pub slots_allocated: u64,
    pub glyphs: usize,
    pub wraps: u32,
}

/// Result of looking a key up in the atlas.
#[derive(Debug, Clone, Copy)]
pub struct Resolved {
    pub slots: GlyphSlots,
    /// True when the slots were just allocated and the glyph is queued for drawing.
    pub queued: bool,
}

/// Glyph cache for one font-resource generation.
#[derive(Debug)]
pub struct GlyphAtlas {
    layout: AtlasLayout,
    allocator: AtlasAllocator,
    glyphs: AHashMap<GlyphKey, GlyphSlots>,
    queue: Vec<(GlyphKey, GlyphSlots)>,
    hits: u64,
    misses: u64,
    slots_allocated: u64,
}

impl GlyphAtlas {
    pub fn new(layout: AtlasLayout) -> Self {
        tracing::debug!(
            cells = ?layout.cells,
            size_px = ?layout.size_px,
            "new glyph atlas generation"
        );
        Self {
            allocator: AtlasAllocator::new(&layout),
            layout,
            glyphs: AHashMap::new(),
            queue: Vec::with_capacity(64),
            hits: 0,
            misses: 0,
            slots_allocated: 0,
        }
    }

    pub fn layout(&self) -> &AtlasLayout {
        &self.layout
    }

    /// Slots for `key`, allocating and queueing them on first sight.
    pub fn resolve(&mut self, key: GlyphKey) -> Resolved {
        match self.glyphs.entry(key) {
            Entry::Occupied(entry) => {
                self.hits += 1;
                Resolved {
                    slots: *entry.get(),
                    queued: false,
                }
            }
            Entry::Vacant(entry) => {
                self.misses += 1;
                let mut slots = GlyphSlots::default();
                for _ in 0..key.cell_span() {
                    slots.push(self.allocator.allocate());
                }
                self.slots_allocated += slots.len() as u64;
                entry.insert(slots);
                self.queue.push((key, slots));
                Resolved {
                    slots,
                    queued: true,
                }
            }
        }
    }

    pub fn pending(&self) -> &[(GlyphKey, GlyphSlots)] {
        &self.queue
    }

    /// Forget every queued draw. The queue keeps its allocation.
    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.glyphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.glyphs.is_empty()
    }

    pub fn stats(&self) -> AtlasStats {
        AtlasStats {
            hits: self.hits,
            misses: self.misses,
            slots_allocated: self.slots_allocated,
            glyphs: self.glyphs.len(),
            wraps: self.allocator.wraps(),
        }
    }
}
