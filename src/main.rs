//! Binary entrypoint for the kiosk worker.
//!
//! Delegates all logic to the library crate.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{Level, info, info_span};
use tracing_subscriber::{EnvFilter, fmt};

use distillery_kiosk::Configuration;
use distillery_kiosk::backend::comfy::ComfyBackend;
use distillery_kiosk::identity::InstanceId;
use distillery_kiosk::viewer;
use distillery_kiosk::worker::Worker;

fn init_tracing(verbosity: u8) -> Result<()> {
    // map -v to log level
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("distillery_kiosk={level}").parse()?)
        .add_directive("wgpu=warn".parse()?)
        .add_directive("winit=warn".parse()?);
    fmt().with_env_filter(filter).with_target(true).init();
    Ok(())
}

fn main() -> Result<()> {
    let cfg = Configuration::parse();
    init_tracing(cfg.verbose)?;
    let cfg = cfg.validated().context("validating configuration")?;

    let instance = InstanceId::generate(&cfg.app_name);
    let span = info_span!("worker", instance = %instance);
    let _enter = span.enter();

    let payload = cfg.load_payload()?;
    info!(
        payload = %cfg.payload_path.display(),
        images_per_batch = cfg.images_per_batch,
        max_attempts = cfg.max_worker_attempts,
        backend = %cfg.backend.base_url,
        "worker starting"
    );

    let backend = ComfyBackend::new(cfg.backend.clone()).context("building backend client")?;
    let worker = Worker::new(&cfg, payload, backend);
    viewer::run_fullscreen(&cfg.window_title, cfg.iteration_pause, worker)
}
