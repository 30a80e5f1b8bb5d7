use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Colors the renderer needs before any per-cell attributes arrive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Theme {
    pub foreground: RgbColor,
    pub background: RgbColor,
    pub cursor: RgbColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RgbColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl RgbColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Pack as `0xAABBGGRR` with an opaque alpha byte, the layout cells and constants use.
    pub const fn pack(self) -> u32 {
        self.r as u32 | (self.g as u32) << 8 | (self.b as u32) << 16 | 0xff00_0000
    }

    /// Pack with `alpha` (0..=1) rounded into the top byte.
    pub fn pack_with_alpha(self, alpha: f32) -> u32 {
        let a = (alpha.clamp(0.0, 1.0) * 255.0).round() as u32;
        (self.pack() & 0x00ff_ffff) | a << 24
    }

    pub const fn unpack(packed: u32) -> Self {
        Self {
            r: packed as u8,
            g: (packed >> 8) as u8,
            b: (packed >> 16) as u8,
        }
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim_start_matches('#');
        if hex.len() != 6 {
            return None;
        }
        let r = u8::from_str_radix(hex.get(0..2)?, 16).ok()?;
        let g = u8::from_str_radix(hex.get(2..4)?, 16).ok()?;
        let b = u8::from_str_radix(hex.get(4..6)?, 16).ok()?;
        Some(Self { r, g, b })
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl Serialize for RgbColor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RgbColor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RgbColor::from_hex(&s).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid color {s:?}, expected #rrggbb"))
        })
    }
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            foreground: RgbColor::new(0xef, 0xf0, 0xea), // #eff0ea
            background: RgbColor::new(0x27, 0x29, 0x35), // #272935
            cursor: RgbColor::new(0xe9, 0xe9, 0xe9),     // #e9e9e9
        }
    }
}
