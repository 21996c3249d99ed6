#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Result, bail};
use distillery_kiosk::backend::{Backend, RawImage, Session};
use distillery_kiosk::disk::SpaceProbe;
use distillery_kiosk::error::{BackendError, TerminationFailure};
use distillery_kiosk::viewer::DisplaySurface;
use image::{DynamicImage, Rgba, RgbaImage};
use serde_json::Value;

pub const GIB: u64 = 1 << 30;

/// What one attempt against the fake backend does.
#[derive(Debug, Clone, Copy)]
pub enum Attempt {
    ConnectFails,
    GenerateFails,
    /// Every generate call returns this many images.
    Images(usize),
}

/// Backend that plays back a script of attempts and counts every call.
pub struct FakeBackend {
    script: VecDeque<Attempt>,
    fallback: Attempt,
    pub connects: u32,
    pub terminates: u32,
    pub terminates_without_session: u32,
    pub fail_termination: bool,
    pub generate_calls: Rc<Cell<u32>>,
    pub payloads: Rc<RefCell<Vec<Value>>>,
}

impl FakeBackend {
    pub fn scripted(steps: impl IntoIterator<Item = Attempt>) -> Self {
        Self {
            script: steps.into_iter().collect(),
            fallback: Attempt::GenerateFails,
            connects: 0,
            terminates: 0,
            terminates_without_session: 0,
            fail_termination: false,
            generate_calls: Rc::new(Cell::new(0)),
            payloads: Rc::default(),
        }
    }

    pub fn always(attempt: Attempt) -> Self {
        let mut backend = Self::scripted([]);
        backend.fallback = attempt;
        backend
    }
}

impl Backend for FakeBackend {
    type Session = FakeSession;

    fn connect_or_attach(&mut self) -> Result<FakeSession, BackendError> {
        self.connects += 1;
        let step = self.script.pop_front().unwrap_or(self.fallback);
        if let Attempt::ConnectFails = step {
            return Err(BackendError::Unreachable("scripted connect failure".into()));
        }
        Ok(FakeSession {
            step,
            generate_calls: self.generate_calls.clone(),
            payloads: self.payloads.clone(),
        })
    }

    fn terminate(&mut self, session: Option<FakeSession>) -> Result<(), TerminationFailure> {
        self.terminates += 1;
        if session.is_none() {
            self.terminates_without_session += 1;
        }
        if self.fail_termination {
            return Err(TerminationFailure::new("scripted termination failure"));
        }
        Ok(())
    }
}

pub struct FakeSession {
    step: Attempt,
    generate_calls: Rc<Cell<u32>>,
    payloads: Rc<RefCell<Vec<Value>>>,
}

impl Session for FakeSession {
    fn generate(&mut self, payload: &Value) -> Result<Vec<RawImage>, BackendError> {
        let call = self.generate_calls.get();
        self.generate_calls.set(call + 1);
        self.payloads.borrow_mut().push(payload.clone());
        match self.step {
            Attempt::Images(count) => Ok((0..count).map(|idx| tagged_image(call, idx)).collect()),
            _ => Err(BackendError::Crashed("scripted generation failure".into())),
        }
    }
}

/// 2x2 image whose pixels encode the generate call and position in the result.
pub fn tagged_image(call: u32, index: usize) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        2,
        2,
        Rgba([call as u8, index as u8, 7, 255]),
    ))
}

/// Reads back the `(call, index)` tag written by [`tagged_image`].
pub fn tag_of(image: &RgbaImage) -> (u8, u8) {
    let px = image.get_pixel(0, 0).0;
    (px[0], px[1])
}

#[derive(Default)]
pub struct RecordingSurface {
    pub frames: Vec<RgbaImage>,
    pub fail: bool,
}

impl DisplaySurface for RecordingSurface {
    fn render(&mut self, image: &RgbaImage) -> Result<()> {
        if self.fail {
            bail!("surface lost");
        }
        self.frames.push(image.clone());
        Ok(())
    }
}

/// Probe reporting a fixed amount of free space.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub u64);

impl FixedProbe {
    pub fn gib(gb: u64) -> Self {
        Self(gb * GIB)
    }
}

impl SpaceProbe for FixedProbe {
    fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

/// Probe that always fails.
#[derive(Debug, Clone, Copy)]
pub struct BrokenProbe;

impl SpaceProbe for BrokenProbe {
    fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
        Err(io::Error::other("statvfs unavailable"))
    }
}
