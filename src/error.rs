// THEORY:
// The matcher, the orchestrator and the motion detector never fail: an empty
// template, a degenerate window or a too-small scale all collapse into a
// "not found" result. The only fallible surfaces are at the edges of the
// crate, where bytes come in from disk or from a capture backend. This module
// names those failures in one enum so callers can use `?` throughout.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for fallible boundary operations.
pub type VisionResult<T> = Result<T, VisionError>;

/// Errors raised while loading, validating or persisting frames and configuration.
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("frame buffer is invalid: {0}")]
    InvalidFrame(String),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl VisionError {
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }
}
