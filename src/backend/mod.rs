//! Capability contract for the external inference backend.
//!
//! The worker only ever talks to a backend through [`Backend`] and the
//! [`Session`] handles it hands out. A session is an owned value: terminating
//! it consumes the handle, so a dead session cannot be used for another
//! generation call.

pub mod comfy;

use image::DynamicImage;
use serde_json::Value;

use crate::error::{BackendError, TerminationFailure};

/// Raw image as returned by the backend, before metadata embedding.
pub type RawImage = DynamicImage;

pub trait Backend {
    type Session: Session;

    /// Get a usable session, starting the backend if it is not running.
    ///
    /// May block until the backend reports ready.
    fn connect_or_attach(&mut self) -> Result<Self::Session, BackendError>;

    /// Forcibly stop the backend so the next `connect_or_attach` starts clean.
    ///
    /// `session` is `None` when establishing the session itself failed. Must
    /// be safe to call when the backend is already dead or never started.
    fn terminate(&mut self, session: Option<Self::Session>) -> Result<(), TerminationFailure>;
}

pub trait Session {
    /// Run the generation pipeline once with `payload`.
    ///
    /// Either the full result set or an error; never a partial result.
    fn generate(&mut self, payload: &Value) -> Result<Vec<RawImage>, BackendError>;
}
