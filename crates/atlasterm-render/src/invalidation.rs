use bitflags::bitflags;

bitflags! {
    /// Resource groups that are stale and must be rebuilt before the next paint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Invalidations: u8 {
        const DEVICE = 1 << 0;
        const SIZE = 1 << 1;
        const FONT = 1 << 2;
        const CONSTANTS = 1 << 3;
        const TITLE = 1 << 4;
    }
}

impl Invalidations {
    /// Groups that must be clean before shaping or painting.
    pub const PAINT_BLOCKING: Self = Self::DEVICE.union(Self::SIZE).union(Self::FONT);

    /// What a fresh device invalidates below it.
    pub const DEVICE_DEPENDENTS: Self = Self::SIZE.union(Self::FONT).union(Self::CONSTANTS);

    pub fn blocks_paint(self) -> bool {
        self.intersects(Self::PAINT_BLOCKING)
    }
}
