use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use clap::{ArgAction, Args, Parser};
use serde_json::Value;

/// Static worker configuration.
///
/// Every setting is sourced from the environment variable named in its
/// `env = ...` attribute; the long flag is an equivalent override.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "distillery-kiosk",
    version,
    about = "Generate images with an inference backend and show them full-screen"
)]
pub struct Configuration {
    /// Application name, used as the instance identifier prefix
    #[arg(long, env = "APP_NAME")]
    pub app_name: String,

    /// Backend output folder purged when disk space runs low
    #[arg(long, env = "INFERENCE_OUTPUT_FOLDER", value_parser = scratch_folder)]
    pub inference_output_folder: Option<PathBuf>,

    /// Backend input folder purged when disk space runs low
    #[arg(long, env = "INFERENCE_INPUT_FOLDER", value_parser = scratch_folder)]
    pub inference_input_folder: Option<PathBuf>,

    /// Camera picture folder purged when disk space runs low
    #[arg(long, env = "CAMERA_PICTURE_FOLDER", value_parser = scratch_folder)]
    pub camera_picture_folder: Option<PathBuf>,

    /// Purge scratch folders when free space drops below this many GiB
    #[arg(
        long = "minimum-gb-free-disk-space",
        env = "MINIMUM_GB_FREE_DISK_SPACE",
        default_value_t = 100
    )]
    pub minimum_free_disk_gb: u64,

    /// JSON document sent to the backend on every request
    #[arg(long = "payload", env = "COMFY_PAYLOAD", default_value = "payload_api.json")]
    pub payload_path: PathBuf,

    /// Title of the full-screen window
    #[arg(long, env = "APP_WINDOW_TITLE", default_value = "Rethinking the Past")]
    pub window_title: String,

    /// Backend generation calls per outer iteration
    #[arg(long, env = "IMAGES_PER_BATCH", default_value_t = 1)]
    pub images_per_batch: u32,

    /// Attempts per outer iteration before giving up
    #[arg(long, env = "MAX_WORKER_ATTEMPTS", default_value_t = 2)]
    pub max_worker_attempts: u32,

    /// Pause after terminating a failed backend before the next attempt
    #[arg(long, env = "RETRY_DELAY", default_value = "250ms", value_parser = humantime::parse_duration)]
    pub retry_delay: Duration,

    /// Pause between outer iterations
    #[arg(long, env = "ITERATION_PAUSE", default_value = "100ms", value_parser = humantime::parse_duration)]
    pub iteration_pause: Duration,

    /// Path whose volume is checked for free space
    #[arg(long, env = "DISK_PROBE_PATH", default_value = "/")]
    pub disk_probe_path: PathBuf,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    #[command(flatten)]
    pub backend: BackendSettings,
}

#[derive(Debug, Clone, Args)]
pub struct BackendSettings {
    /// Base URL of the inference server
    #[arg(long = "comfy-url", env = "COMFY_URL", default_value = "http://127.0.0.1:8188")]
    pub base_url: String,

    /// Shell command that starts the inference server when it is not running
    #[arg(long = "comfy-launch-command", env = "COMFY_LAUNCH_COMMAND")]
    pub launch_command: Option<String>,

    /// How long to wait for a freshly started server to answer
    #[arg(long = "comfy-startup-timeout", env = "COMFY_STARTUP_TIMEOUT", default_value = "120s", value_parser = humantime::parse_duration)]
    pub startup_timeout: Duration,

    /// Upper bound for a single generation call
    #[arg(long = "comfy-generation-timeout", env = "COMFY_GENERATION_TIMEOUT", default_value = "600s", value_parser = humantime::parse_duration)]
    pub generation_timeout: Duration,

    /// Interval between readiness and history polls
    #[arg(long = "comfy-poll-interval", env = "COMFY_POLL_INTERVAL", default_value = "500ms", value_parser = humantime::parse_duration)]
    pub poll_interval: Duration,
}

// Accepts empty values so an empty env var means "not configured".
fn scratch_folder(raw: &str) -> Result<PathBuf, String> {
    Ok(PathBuf::from(raw.trim()))
}

impl Configuration {
    pub fn validated(mut self) -> Result<Self> {
        ensure!(!self.app_name.trim().is_empty(), "APP_NAME must not be blank");
        ensure!(
            self.images_per_batch >= 1,
            "images-per-batch must be at least 1"
        );
        ensure!(
            self.max_worker_attempts >= 1,
            "max-worker-attempts must be at least 1"
        );
        ensure!(
            !self.backend.poll_interval.is_zero(),
            "comfy-poll-interval must be greater than zero"
        );
        reqwest::Url::parse(&self.backend.base_url)
            .with_context(|| format!("invalid comfy-url '{}'", self.backend.base_url))?;

        for folder in [
            &mut self.inference_output_folder,
            &mut self.inference_input_folder,
            &mut self.camera_picture_folder,
        ] {
            if folder.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
                *folder = None;
            }
        }
        if self
            .backend
            .launch_command
            .as_deref()
            .is_some_and(|cmd| cmd.trim().is_empty())
        {
            self.backend.launch_command = None;
        }
        Ok(self)
    }

    /// Configured scratch folders in purge order: output, input, camera.
    pub fn scratch_folders(&self) -> Vec<PathBuf> {
        [
            &self.inference_output_folder,
            &self.inference_input_folder,
            &self.camera_picture_folder,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }

    pub fn load_payload(&self) -> Result<Value> {
        load_payload(&self.payload_path)
    }
}

pub fn load_payload(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read backend payload {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse backend payload {}", path.display()))
}
