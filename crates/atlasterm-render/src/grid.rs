use atlasterm_core::{CellRect, U16x2};
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::glyph::GlyphSlots;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CellFlags: u32 {
        const CURSOR = 1;
        const SELECTED = 2;
    }
}

/// One grid position as the shader reads it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Cell {
    /// Atlas pixel position of this cell's slice of its glyph run.
    pub glyph: [u16; 2],
    pub flags: u32,
    /// Packed foreground and background colors.
    pub color: [u32; 2],
}

impl Cell {
    pub fn glyph_slot(&self) -> U16x2 {
        U16x2::new(self.glyph[0], self.glyph[1])
    }

    pub fn flags(&self) -> CellFlags {
        CellFlags::from_bits_truncate(self.flags)
    }

    pub fn add_flags(&mut self, flags: CellFlags) {
        self.flags |= flags.bits();
    }
}

/// Row-major cell buffer sized to the viewport in cells.
#[derive(Debug, Default)]
pub struct CellGrid {
    cells: Vec<Cell>,
    size: U16x2,
}

impl CellGrid {
    pub fn size(&self) -> U16x2 {
        self.size
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Match the grid to `cell_count`. Returns true if the buffer was reallocated.
    pub fn resize(&mut self, cell_count: U16x2) -> bool {
        self.size = cell_count;
        let total = cell_count.area();
        if total == self.cells.len() {
            return false;
        }
        // Release the old buffer before allocating the new one.
        self.cells = Vec::new();
        self.cells = vec![Cell::default(); total];
        true
    }

    pub fn release(&mut self) {
        self.cells = Vec::new();
        self.size = U16x2::ZERO;
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.cells)
    }

    pub fn get(&self, x: u16, y: u16) -> Option<&Cell> {
        if x >= self.size.x {
            return None;
        }
        self.cells.get(self.index(x, y))
    }

    pub fn row_mut(&mut self, y: u16) -> &mut [Cell] {
        let width = self.size.x as usize;
        let start = y as usize * width;
        &mut self.cells[start..start + width]
    }

    /// Write one glyph run starting at column `x`, clipped to the row end.
    pub fn write_run(&mut self, y: u16, x: u16, slots: &GlyphSlots, color: [u32; 2]) {
        let row = self.row_mut(y);
        let cells = row.iter_mut().skip(x as usize);
        for (cell, slot) in cells.zip(slots.as_slice()) {
            cell.glyph = [slot.x, slot.y];
            cell.flags = 0;
            cell.color = color;
        }
    }

    /// OR `flags` into every cell of `rect`, clipped to the grid.
    pub fn add_flags_in(&mut self, rect: CellRect, flags: CellFlags) {
        let rect = rect.clamp_to(self.size);
        if rect.is_empty() {
            return;
        }
        for y in rect.top..rect.bottom {
            let row = self.row_mut(y);
            for cell in &mut row[rect.left as usize..rect.right as usize] {
                cell.add_flags(flags);
            }
        }
    }

    /// OR `flags` into `count` consecutive cells starting at (x, y), stopping at the buffer end.
    pub fn add_flags_linear(&mut self, x: u16, y: u16, count: usize, flags: CellFlags) {
        let start = self.index(x, y);
        let end = start.saturating_add(count).min(self.cells.len());
        if start >= end {
            return;
        }
        for cell in &mut self.cells[start..end] {
            cell.add_flags(flags);
        }
    }

    fn index(&self, x: u16, y: u16) -> usize {
        y as usize * self.size.x as usize + x as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<Cell>(), 16);
    }

    #[test]
    fn resize_tracks_cell_count() {
        let mut grid = CellGrid::default();
        assert!(grid.resize(U16x2::new(100, 25)));
        assert_eq!(grid.len(), 2500);
        assert!(!grid.resize(U16x2::new(25, 100)));
        assert_eq!(grid.len(), 2500);
        assert_eq!(grid.size(), U16x2::new(25, 100));
        assert!(grid.resize(U16x2::new(10, 10)));
        assert_eq!(grid.len(), 100);
    }

    #[test]
    fn run_is_clipped_to_row() {
        let mut grid = CellGrid::default();
        grid.resize(U16x2::new(4, 2));
        let mut slots = GlyphSlots::default();
        for i in 1..=3 {
            slots.push(U16x2::new(i * 8, 0));
        }
        grid.write_run(1, 2, &slots, [7, 9]);

        assert_eq!(grid.get(2, 1).map(Cell::glyph_slot), Some(U16x2::new(8, 0)));
        assert_eq!(grid.get(3, 1).map(Cell::glyph_slot), Some(U16x2::new(16, 0)));
        assert_eq!(grid.get(3, 1).map(|c| c.color), Some([7, 9]));
        assert_eq!(grid.get(0, 1).map(Cell::glyph_slot), Some(U16x2::ZERO));
        assert!(grid.get(4, 1).is_none());
    }

    #[test]
    fn selection_flags_are_ored_into_rect() {
        let mut grid = CellGrid::default();
        grid.resize(U16x2::new(5, 3));
        grid.add_flags_in(CellRect::new(1, 0, 3, 2), CellFlags::SELECTED);
        grid.add_flags_in(CellRect::new(2, 1, 4, 3), CellFlags::CURSOR);

        let flags = |x, y| grid.get(x, y).map(Cell::flags).unwrap_or_default();
        assert_eq!(flags(1, 0), CellFlags::SELECTED);
        assert_eq!(flags(2, 1), CellFlags::SELECTED | CellFlags::CURSOR);
        assert_eq!(flags(3, 2), CellFlags::CURSOR);
        assert_eq!(flags(0, 0), CellFlags::empty());
    }

    #[test]
    fn linear_flags_stop_at_buffer_end() {
        let mut grid = CellGrid::default();
        grid.resize(U16x2::new(3, 2));
        grid.add_flags_linear(2, 1, 2, CellFlags::CURSOR);
        assert_eq!(grid.get(2, 1).map(Cell::flags), Some(CellFlags::CURSOR));

        grid.add_flags_linear(2, 0, 2, CellFlags::CURSOR);
        assert_eq!(grid.get(0, 1).map(Cell::flags), Some(CellFlags::CURSOR));
    }
}
