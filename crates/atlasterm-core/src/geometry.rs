use std::ops::{Div, Mul};

/// Pair of 16-bit unsigned coordinates: pixel sizes, cell counts, atlas positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct U16x2 {
    pub x: u16,
    pub y: u16,
}

impl U16x2 {
    pub const ZERO: Self = Self { x: 0, y: 0 };

    pub const fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }

    /// True when either component is zero.
    pub fn has_zero(self) -> bool {
        self.x == 0 || self.y == 0
    }

    pub fn area(self) -> usize {
        self.x as usize * self.y as usize
    }

    /// Convert from 32-bit components, returning `None` if either does not fit.
    pub fn try_from_u32(x: u32, y: u32) -> Option<Self> {
        Some(Self {
            x: u16::try_from(x).ok()?,
            y: u16::try_from(y).ok()?,
        })
    }
}

/// Component-wise multiplication. Overflow is a contract violation and panics.
impl Mul for U16x2 {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        let x = self.x.checked_mul(rhs.x);
        let y = self.y.checked_mul(rhs.y);
        match (x, y) {
            (Some(x), Some(y)) => Self { x, y },
            _ => panic!("U16x2 multiplication overflow: {self:?} * {rhs:?}"),
        }
    }
}

/// Component-wise integer division. A zero divisor component yields zero,
/// which keeps `size / cell_size` well defined before a font is configured.
impl Div for U16x2 {
    type Output = Self;

    fn div(self, rhs: Self) -> Self {
        Self {
            x: self.x.checked_div(rhs.x).unwrap_or(0),
            y: self.y.checked_div(rhs.y).unwrap_or(0),
        }
    }
}

/// Rectangle of grid cells; `right` and `bottom` are exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellRect {
    pub left: u16,
    pub top: u16,
    pub right: u16,
    pub bottom: u16,
}

impl CellRect {
    pub const fn new(left: u16, top: u16, right: u16, bottom: u16) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// The whole grid of `cell_count` cells.
    pub const fn full(cell_count: U16x2) -> Self {
        Self::new(0, 0, cell_count.x, cell_count.y)
    }

    pub fn width(&self) -> u16 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u16 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Clip to the grid of `cell_count` cells.
    pub fn clamp_to(&self, cell_count: U16x2) -> Self {
        Self {
            left: self.left.min(cell_count.x),
            top: self.top.min(cell_count.y),
            right: self.right.min(cell_count.x),
            bottom: self.bottom.min(cell_count.y),
        }
    }
}
