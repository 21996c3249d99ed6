use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures reported by the inference backend for a single call.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Nothing answered at the backend address and it could not be started.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend answered but refused the payload.
    #[error("backend rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// The backend did not finish within the allotted time.
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    /// The backend process died or reported an internal failure.
    #[error("backend crashed: {0}")]
    Crashed(String),

    /// Transport-level failure talking to the backend.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The backend returned an image the codec could not read.
    #[error("backend returned an unreadable image: {0}")]
    BadImage(#[from] image::ImageError),
}

/// Failures while embedding metadata or encoding an image.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize request metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("png encoding failed: {0}")]
    Png(#[from] png::EncodingError),

    #[error("png decoding failed: {0}")]
    PngDecode(#[from] png::DecodingError),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// Anything that can go wrong while turning a request into images.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Encoding(#[from] EncodeError),
}

/// The backend could not be confirmed stopped.
///
/// Escalates to the outer iteration: a lingering backend may break the next attempt.
#[derive(Debug, Error)]
#[error("failed to terminate backend: {reason}")]
pub struct TerminationFailure {
    pub reason: String,
    #[source]
    pub source: Option<std::io::Error>,
}

impl TerminationFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn io(reason: impl Into<String>, source: std::io::Error) -> Self {
        Self {
            reason: reason.into(),
            source: Some(source),
        }
    }
}

/// A scratch entry could not be removed, or the free-space probe failed.
#[derive(Debug, Error)]
pub enum DiskReclaimError {
    #[error("failed to measure free space at {path}: {source}")]
    Probe {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to purge {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The display surface failed; this is the one fatal path of the worker loop.
#[derive(Debug, Error)]
#[error("display surface failed: {0:#}")]
pub struct DisplayError(pub anyhow::Error);
