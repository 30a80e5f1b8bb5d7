pub mod config;
pub mod event;
pub mod geometry;

pub use config::{Config, RgbColor, Theme};
pub use event::HostEvent;
pub use geometry::{CellRect, U16x2};
