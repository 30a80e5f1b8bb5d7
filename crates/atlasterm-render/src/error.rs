//! Typed errors at the render crate boundary.
//!
//! Callers driving frames only need [`RenderError::is_retry`] to tell a
//! recoverable device loss apart from a failure that should end the frame loop.

use std::path::PathBuf;

use thiserror::Error;

use crate::shaping::FaceId;

/// Failures reported by a [`FontService`](crate::shaping::FontService).
#[derive(Debug, Error)]
pub enum FontError {
    /// The glyph output buffers were too small; `required` is a lower bound on the needed capacity.
    #[error("glyph buffer too small: {required} glyphs required")]
    InsufficientBuffer { required: usize },

    #[error("no font face matches family {0:?}")]
    FamilyNotFound(String),

    #[error("font face {0:?} is not loaded")]
    UnknownFace(FaceId),

    #[error("font face {0:?} could not be parsed")]
    InvalidFace(FaceId),

    #[error("loading font file '{path}': {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures reported by a [`RenderBackend`](crate::backend::RenderBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// The device was removed or reset. Everything created from it is gone.
    #[error("graphics device lost: {0}")]
    DeviceLost(String),

    #[error("creating {what}: {details}")]
    Creation { what: &'static str, details: String },

    #[error("backend failure: {0}")]
    Backend(String),
}

impl BackendError {
    pub fn is_device_lost(&self) -> bool {
        matches!(self, BackendError::DeviceLost(_))
    }
}

/// Error returned by the engine's frame and resource entry points.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Resources were dropped after a device loss. Call `start_paint` again.
    #[error("device lost, retry the frame")]
    Retry,

    #[error(transparent)]
    Backend(BackendError),

    #[error(transparent)]
    Font(#[from] FontError),

    #[error("shaping still short of glyph space after {attempts} attempts (capacity {capacity})")]
    ShapingRetriesExhausted { attempts: u32, capacity: usize },
}

impl RenderError {
    pub fn is_retry(&self) -> bool {
        matches!(self, RenderError::Retry)
    }
}
