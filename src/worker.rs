//! The outer loop body: build request, generate with retries, display, reclaim disk.
//!
//! Failure handling per iteration:
//!
//! | failure | effect |
//! |---|---|
//! | backend error, retries left | terminate backend, pause, retry |
//! | all attempts failed | log, nothing displayed |
//! | backend termination failed | log, skip display for the iteration |
//! | unexpected (e.g. undecodable image) | log, force-terminate backend |
//! | disk reclaim failed | log |
//! | display surface failed | fatal, returned to the caller |
//!
//! The disk guard runs last in every iteration, whatever happened before it.

use std::fmt::Display;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, info_span};

use crate::backend::Backend;
use crate::config::Configuration;
use crate::disk::{DiskGuard, ReclaimReport, SpaceProbe, VolumeProbe};
use crate::error::DisplayError;
use crate::request::Request;
use crate::retry::{RetryController, RetryOutcome};
use crate::viewer::DisplaySurface;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Every generated image reached the surface.
    Displayed,
    /// All attempts failed; the previous image stays on screen.
    Exhausted,
    /// The backend could not be confirmed stopped; display was skipped.
    TerminationFailed,
    /// Something unexpected went wrong after generation.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationReport {
    pub iteration: u64,
    pub outcome: IterationOutcome,
    pub displayed: usize,
    pub reclaim: Option<ReclaimReport>,
}

pub struct Worker<B, P = VolumeProbe> {
    payload: Value,
    images_per_batch: u32,
    controller: RetryController<B>,
    disk_guard: DiskGuard<P>,
    started: Instant,
    iteration: u64,
}

impl<B: Backend> Worker<B, VolumeProbe> {
    pub fn new(cfg: &Configuration, payload: Value, backend: B) -> Self {
        Self::with_parts(
            payload,
            cfg.images_per_batch,
            RetryController::new(backend, cfg.max_worker_attempts, cfg.retry_delay),
            DiskGuard::from_config(cfg),
        )
    }
}

impl<B: Backend, P: SpaceProbe> Worker<B, P> {
    pub fn with_parts(
        payload: Value,
        images_per_batch: u32,
        controller: RetryController<B>,
        disk_guard: DiskGuard<P>,
    ) -> Self {
        Self {
            payload,
            images_per_batch,
            controller,
            disk_guard,
            started: Instant::now(),
            iteration: 0,
        }
    }

    pub fn controller(&self) -> &RetryController<B> {
        &self.controller
    }

    /// Run one outer iteration against `surface`.
    ///
    /// # Errors
    /// Only a failing display surface is returned; every other failure is
    /// logged and absorbed so the loop keeps running.
    pub fn run_iteration<S: DisplaySurface + ?Sized>(
        &mut self,
        surface: &mut S,
    ) -> Result<IterationReport, DisplayError> {
        self.iteration += 1;
        let span = info_span!(
            "iteration",
            n = self.iteration,
            uptime_s = self.started.elapsed().as_secs()
        );
        let _enter = span.enter();

        let shown = self.generate_and_display(surface);
        let reclaim = match self.disk_guard.check_and_reclaim() {
            Ok(report) => Some(report),
            Err(err) => {
                error!(error = %err, "disk reclaim failed");
                None
            }
        };
        let (outcome, displayed) = shown?;
        debug!(?outcome, displayed, "iteration finished");

        Ok(IterationReport {
            iteration: self.iteration,
            outcome,
            displayed,
            reclaim,
        })
    }

    fn generate_and_display<S: DisplaySurface + ?Sized>(
        &mut self,
        surface: &mut S,
    ) -> Result<(IterationOutcome, usize), DisplayError> {
        // the payload is cloned per request so provenance never aliases the template
        let request = match Request::new(self.payload.clone(), self.images_per_batch) {
            Ok(request) => request,
            Err(err) => {
                self.recover_unexpected(&err);
                return Ok((IterationOutcome::Failed, 0));
            }
        };

        let images = match self.controller.run(&request) {
            Ok(RetryOutcome::Succeeded(images)) => images,
            Ok(RetryOutcome::Exhausted {
                attempts,
                last_error,
            }) => {
                error!(attempts, error = %last_error, "no images this iteration");
                return Ok((IterationOutcome::Exhausted, 0));
            }
            Err(failure) => {
                error!(error = %failure, "backend state unknown; skipping display this iteration");
                return Ok((IterationOutcome::TerminationFailed, 0));
            }
        };

        info!(images = images.len(), "displaying generated images");
        let mut displayed = 0;
        for image in &images {
            let decoded = match image.decode() {
                Ok(decoded) => decoded.to_rgba8(),
                Err(err) => {
                    self.recover_unexpected(&err);
                    return Ok((IterationOutcome::Failed, displayed));
                }
            };
            surface.render(&decoded).map_err(DisplayError)?;
            debug!(filename = image.filename(), "image displayed");
            displayed += 1;
        }
        Ok((IterationOutcome::Displayed, displayed))
    }

    // No session is live outside the retry controller, so there is none to hand over.
    fn recover_unexpected(&mut self, err: &dyn Display) {
        error!(error = %err, "unhandled error in worker iteration; terminating backend");
        if let Err(failure) = self.controller.backend_mut().terminate(None) {
            error!(error = %failure, "backend termination after unhandled error failed");
        }
    }
}
