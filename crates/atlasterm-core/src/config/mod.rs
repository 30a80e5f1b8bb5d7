pub mod theme;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

pub use theme::{RgbColor, Theme};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub font: FontConfig,
    pub render: RenderConfig,
    pub selection: SelectionConfig,
    pub theme: Theme,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FontConfig {
    pub family: String,
    /// Size in points.
    pub size: f32,
    /// CSS-style weight, 100..=900.
    pub weight: u16,
    pub dpi: u32,
    /// Extra font files loaded into the font database before system fonts are queried.
    pub extra_font_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Software,
    Wgpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Antialiasing {
    Grayscale,
    Aliased,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub backend: BackendKind,
    pub antialiasing: Antialiasing,
    /// Sleep used when the backend has no frame-latency primitive.
    pub pacing_fallback_ms: u64,
    /// Upper bound on waiting for the backend's frame-latency primitive.
    pub pacing_timeout_ms: u64,
    /// Number of glyph cells the atlas texture should hold when the GPU allows it.
    pub atlas_target_cells: u32,
    /// How many times the driver retries a frame after a device loss.
    pub max_frame_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub color: String,
    pub opacity: f32,
}

impl Config {
    /// Load config from default path (~/.config/atlasterm/config.toml)
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, falling back to defaults when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn config_dir() -> PathBuf {
        ProjectDirs::from("", "", "atlasterm")
            .map(|d| d.config_dir().to_path_buf())
            .unwrap_or_else(|| dirs_fallback().join("atlasterm"))
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

impl SelectionConfig {
    /// Selection color packed with its opacity in the top byte.
    pub fn packed(&self) -> u32 {
        let color = RgbColor::from_hex(&self.color).unwrap_or_else(|| {
            tracing::warn!(color = %self.color, "invalid selection color, using default");
            SelectionConfig::default_color()
        });
        color.pack_with_alpha(self.opacity)
    }

    fn default_color() -> RgbColor {
        RgbColor::new(0x92, 0xbb, 0xd0)
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

impl Default for FontConfig {
    fn default() -> Self {
        Self {
            family: "monospace".to_string(),
            size: 12.0,
            weight: 400,
            dpi: 96,
            extra_font_files: Vec::new(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Software,
            antialiasing: Antialiasing::Grayscale,
            pacing_fallback_ms: 8,
            pacing_timeout_ms: 1000,
            atlas_target_cells: 64 * 1024,
            max_frame_retries: 3,
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            color: "#92bbd0".to_string(),
            opacity: 0.5,
        }
    }
}
