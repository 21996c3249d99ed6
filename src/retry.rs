use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::backend::Backend;
use crate::error::{FetchError, TerminationFailure};
use crate::fetch::{GeneratedImage, fetch};
use crate::request::Request;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Result of one bounded-retry run. Exhaustion is a value, not an error.
#[derive(Debug)]
pub enum RetryOutcome {
    Succeeded(Vec<GeneratedImage>),
    Exhausted { attempts: u32, last_error: FetchError },
}

impl RetryOutcome {
    pub fn images(&self) -> Option<&[GeneratedImage]> {
        match self {
            Self::Succeeded(images) => Some(images),
            Self::Exhausted { .. } => None,
        }
    }

    pub fn into_images(self) -> Option<Vec<GeneratedImage>> {
        match self {
            Self::Succeeded(images) => Some(images),
            Self::Exhausted { .. } => None,
        }
    }
}

/// Runs the fetch pipeline with a fresh session per attempt.
///
/// Any failed attempt terminates the backend before the next one. The
/// controller is the only component that terminates sessions.
pub struct RetryController<B> {
    backend: B,
    max_attempts: u32,
    retry_delay: Duration,
}

impl<B: Backend> RetryController<B> {
    pub fn new(backend: B, max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            backend,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// # Errors
    /// [`TerminationFailure`] when the backend could not be confirmed stopped
    /// after a failed attempt. Nothing else escapes.
    pub fn run(&mut self, request: &Request) -> Result<RetryOutcome, TerminationFailure> {
        let max_attempts = self.max_attempts;
        let mut attempt = 1;
        loop {
            let (session, result) = self.attempt(request);
            let err = match result {
                Ok(images) => {
                    info!(attempt, images = images.len(), "worker attempt succeeded");
                    return Ok(RetryOutcome::Succeeded(images));
                }
                Err(err) => err,
            };

            if let Err(failure) = self.backend.terminate(session) {
                error!(
                    attempt,
                    max_attempts,
                    error = %failure,
                    "could not terminate backend after failed attempt"
                );
                return Err(failure);
            }

            if attempt < max_attempts {
                warn!(
                    attempt,
                    max_attempts,
                    error = %err,
                    "worker attempt failed; backend terminated, retrying"
                );
                thread::sleep(self.retry_delay);
                attempt += 1;
            } else {
                error!(
                    attempt,
                    max_attempts,
                    error = %err,
                    "worker attempt failed; backend terminated, giving up"
                );
                return Ok(RetryOutcome::Exhausted {
                    attempts: attempt,
                    last_error: err,
                });
            }
        }
    }

    // A failed connect counts as a failed attempt with no session to hand back.
    fn attempt(
        &mut self,
        request: &Request,
    ) -> (Option<B::Session>, Result<Vec<GeneratedImage>, FetchError>) {
        let mut session = match self.backend.connect_or_attach() {
            Ok(session) => session,
            Err(err) => return (None, Err(err.into())),
        };
        let result = fetch(&mut session, request);
        (Some(session), result)
    }
}
