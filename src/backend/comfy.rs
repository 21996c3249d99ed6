//! ComfyUI-compatible backend: HTTP API plus an optional locally launched server.

use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Backend, RawImage, Session};
use crate::config::BackendSettings;
use crate::error::{BackendError, TerminationFailure};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_BODY_LIMIT: usize = 512;

pub struct ComfyBackend {
    settings: BackendSettings,
    http: HttpClient,
    process: Option<Child>,
}

impl ComfyBackend {
    pub fn new(settings: BackendSettings) -> Result<Self, BackendError> {
        let http = HttpClient::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            settings,
            http,
            process: None,
        })
    }

    /// Whether this backend launched the server it is talking to.
    pub fn owns_process(&self) -> bool {
        self.process.is_some()
    }

    fn endpoint(&self, path: &str) -> String {
        endpoint(&self.settings.base_url, path)
    }

    fn is_ready(&self) -> bool {
        match self.http.get(self.endpoint("system_stats")).send() {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(error = %err, "backend readiness probe failed");
                false
            }
        }
    }

    /// Drop our handle to a server process that has already exited.
    ///
    /// Whatever the server left running in its process group is killed first.
    fn reap_exited(&mut self) -> Option<String> {
        let child = self.process.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                if let Err(err) = kill_tree(child) {
                    warn!(error = %err, "failed to clean up after exited backend");
                }
                self.process = None;
                Some(status.to_string())
            }
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "failed to poll backend process");
                None
            }
        }
    }

    fn spawn(&mut self, command: &str) -> Result<(), BackendError> {
        info!(command, "launching backend");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // own process group so termination reaches the whole server tree
            cmd.process_group(0);
        }
        let child = cmd.spawn().map_err(|err| {
            BackendError::Unreachable(format!("failed to spawn '{command}': {err}"))
        })?;
        debug!(pid = child.id(), "backend process started");
        self.process = Some(child);
        Ok(())
    }

    fn wait_until_ready(&mut self) -> Result<(), BackendError> {
        let started = Instant::now();
        loop {
            if self.is_ready() {
                info!(
                    waited_ms = started.elapsed().as_millis() as u64,
                    "backend ready"
                );
                return Ok(());
            }
            if let Some(status) = self.reap_exited() {
                return Err(BackendError::Crashed(format!(
                    "backend exited during startup ({status})"
                )));
            }
            if started.elapsed() >= self.settings.startup_timeout {
                return Err(BackendError::Timeout(self.settings.startup_timeout));
            }
            thread::sleep(self.settings.poll_interval);
        }
    }

    fn reset_attached(&self) {
        let interrupt = self.http.post(self.endpoint("interrupt")).send();
        let free = self
            .http
            .post(self.endpoint("free"))
            .json(&json!({"unload_models": true, "free_memory": true}))
            .send();
        for (action, result) in [("interrupt", interrupt), ("free", free)] {
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(action, "attached backend reset")
                }
                Ok(response) => warn!(
                    action,
                    status = response.status().as_u16(),
                    "attached backend refused reset"
                ),
                Err(err) => warn!(action, error = %err, "attached backend reset failed"),
            }
        }
    }

    /// Kill and reap the server process this backend launched, if any.
    ///
    /// The handle is only released once the process is reaped; on failure it
    /// stays in place so a later `terminate` or drop can try again.
    fn stop_owned<K>(&mut self, kill: K) -> Result<bool, TerminationFailure>
    where
        K: FnOnce(&mut Child) -> Result<(), TerminationFailure>,
    {
        let Some(child) = self.process.as_mut() else {
            return Ok(false);
        };
        let pid = child.id();
        kill(child)?;
        let status = child.wait().map_err(|err| {
            TerminationFailure::io(format!("failed to reap backend process {pid}"), err)
        })?;
        self.process = None;
        info!(pid, %status, "backend process terminated");
        Ok(true)
    }
}

impl Backend for ComfyBackend {
    type Session = ComfySession;

    fn connect_or_attach(&mut self) -> Result<ComfySession, BackendError> {
        if !self.is_ready() {
            let command = self.settings.launch_command.clone().ok_or_else(|| {
                BackendError::Unreachable(format!(
                    "no backend at {} and no launch command configured",
                    self.settings.base_url
                ))
            })?;
            if let Some(status) = self.reap_exited() {
                warn!(status, "previous backend process had exited");
            }
            if self.process.is_none() {
                self.spawn(&command)?;
            }
            self.wait_until_ready()?;
        }
        Ok(ComfySession {
            http: self.http.clone(),
            base_url: self.settings.base_url.clone(),
            client_id: Uuid::new_v4().to_string(),
            generation_timeout: self.settings.generation_timeout,
            poll_interval: self.settings.poll_interval,
        })
    }

    fn terminate(&mut self, session: Option<ComfySession>) -> Result<(), TerminationFailure> {
        if let Some(session) = session {
            debug!(client_id = %session.client_id, "invalidating backend session");
        }
        if !self.stop_owned(kill_tree)? {
            self.reset_attached();
        }
        Ok(())
    }
}

impl Drop for ComfyBackend {
    fn drop(&mut self) {
        if let Some(mut child) = self.process.take() {
            if let Err(err) = kill_tree(&mut child) {
                warn!(error = %err, "failed to stop backend on shutdown");
            }
            let _ = child.wait();
        }
    }
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) -> Result<(), TerminationFailure> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pid = child.id();
    let group = i32::try_from(pid)
        .map_err(|_| TerminationFailure::new(format!("backend pid {pid} out of range")))?;
    match killpg(Pid::from_raw(group), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(TerminationFailure::io(
            format!("failed to kill backend process group {pid}"),
            std::io::Error::from(errno),
        )),
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<(), TerminationFailure> {
    match child.kill() {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(err) => Err(TerminationFailure::io(
            format!("failed to kill backend process {}", child.id()),
            err,
        )),
    }
}

/// Handle for one attempt against a running server.
pub struct ComfySession {
    http: HttpClient,
    base_url: String,
    client_id: String,
    generation_timeout: Duration,
    poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ImageRef {
    filename: String,
    subfolder: String,
    kind: String,
}

impl ComfySession {
    fn queue_prompt(&self, payload: &Value) -> Result<String, BackendError> {
        let response = self
            .http
            .post(endpoint(&self.base_url, "prompt"))
            .json(&json!({"prompt": payload, "client_id": self.client_id}))
            .send()?;
        let body = json_or_rejected(response)?;
        body.get("prompt_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BackendError::Crashed(format!("prompt response without id: {body}")))
    }

    fn await_history(&self, prompt_id: &str) -> Result<Value, BackendError> {
        let started = Instant::now();
        let url = endpoint(&self.base_url, &format!("history/{prompt_id}"));
        loop {
            let history = json_or_rejected(self.http.get(&url).send()?)?;
            if let Some(entry) = history.get(prompt_id) {
                let status = entry
                    .pointer("/status/status_str")
                    .and_then(Value::as_str)
                    .unwrap_or("success");
                if status == "error" {
                    let messages = entry
                        .pointer("/status/messages")
                        .cloned()
                        .unwrap_or(Value::Null);
                    return Err(BackendError::Crashed(format!(
                        "prompt {prompt_id} failed: {}",
                        truncate_text(&messages.to_string(), ERROR_BODY_LIMIT)
                    )));
                }
                return Ok(entry.clone());
            }
            if started.elapsed() >= self.generation_timeout {
                return Err(BackendError::Timeout(self.generation_timeout));
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn download(&self, image: &ImageRef) -> Result<RawImage, BackendError> {
        let response = self
            .http
            .get(endpoint(&self.base_url, "view"))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(BackendError::Rejected {
                status: status.as_u16(),
                body: truncate_text(&body, ERROR_BODY_LIMIT),
            });
        }
        let bytes = response.bytes()?;
        debug!(filename = %image.filename, bytes = bytes.len(), "downloaded backend image");
        Ok(image::load_from_memory(&bytes)?)
    }
}

impl Session for ComfySession {
    fn generate(&mut self, payload: &Value) -> Result<Vec<RawImage>, BackendError> {
        let prompt_id = self.queue_prompt(payload)?;
        debug!(prompt_id, client_id = %self.client_id, "prompt queued");
        let entry = self.await_history(&prompt_id)?;
        output_images(&entry)
            .iter()
            .map(|image| self.download(image))
            .collect()
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

fn json_or_rejected(response: HttpResponse) -> Result<Value, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(BackendError::Rejected {
            status: status.as_u16(),
            body: truncate_text(&body, ERROR_BODY_LIMIT),
        });
    }
    Ok(response.json::<Value>()?)
}

/// Every image listed under `outputs.<node>.images`, in the order the server listed the nodes.
fn output_images(entry: &Value) -> Vec<ImageRef> {
    let Some(outputs) = entry.get("outputs").and_then(Value::as_object) else {
        return Vec::new();
    };
    outputs
        .values()
        .filter_map(|node| node.get("images").and_then(Value::as_array))
        .flatten()
        .filter_map(|image| {
            let field = |name: &str| image.get(name).and_then(Value::as_str);
            Some(ImageRef {
                filename: field("filename")?.to_string(),
                subfolder: field("subfolder").unwrap_or_default().to_string(),
                kind: field("type").unwrap_or("output").to_string(),
            })
        })
        .collect()
}

fn truncate_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_images_across_output_nodes() {
        let entry = json!({
            "outputs": {
                "12": {"images": [{"filename": "b.png", "subfolder": "", "type": "output"}]},
                "9": {"images": [
                    {"filename": "a.png", "subfolder": "runs", "type": "output"},
                    {"filename": "tmp.png", "type": "temp"}
                ]},
                "20": {"text": ["no images here"]}
            },
            "status": {"status_str": "success", "completed": true}
        });
        let names: Vec<_> = output_images(&entry)
            .into_iter()
            .map(|img| (img.filename, img.subfolder, img.kind))
            .collect();
        assert_eq!(
            names,
            vec![
                ("b.png".into(), "".into(), "output".into()),
                ("a.png".into(), "runs".into(), "output".into()),
                ("tmp.png".into(), "".into(), "temp".into()),
            ]
        );
    }

    #[test]
    fn output_nodes_keep_server_order() {
        let entry = json!({
            "outputs": {
                "9": {"images": [{"filename": "first.png", "type": "output"}]},
                "10": {"images": [{"filename": "second.png", "type": "output"}]}
            }
        });
        let names: Vec<_> = output_images(&entry)
            .into_iter()
            .map(|img| img.filename)
            .collect();
        assert_eq!(names, vec!["first.png", "second.png"]);
    }

    #[test]
    fn missing_outputs_yield_nothing() {
        assert!(output_images(&json!({"status": {}})).is_empty());
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(
            endpoint("http://127.0.0.1:8188/", "prompt"),
            "http://127.0.0.1:8188/prompt"
        );
    }

    #[test]
    fn truncates_long_bodies() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }

    fn offline_settings() -> BackendSettings {
        BackendSettings {
            base_url: "http://127.0.0.1:9".into(),
            launch_command: None,
            startup_timeout: Duration::from_secs(1),
            generation_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(20),
        }
    }

    #[cfg(unix)]
    #[test]
    fn failed_kill_keeps_the_process_handle() {
        let mut backend = ComfyBackend::new(offline_settings()).unwrap();
        backend.spawn("sleep 30").unwrap();

        let err = backend
            .stop_owned(|_| Err(TerminationFailure::new("kill denied")))
            .unwrap_err();
        assert_eq!(err.reason, "kill denied");
        assert!(backend.owns_process());

        // the retained handle lets the next terminate finish the job
        backend.terminate(None).unwrap();
        assert!(!backend.owns_process());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn exited_server_takes_its_process_group_with_it() {
        use std::fs;

        fn running(stat: &str) -> bool {
            fs::read_to_string(stat)
                .ok()
                .and_then(|raw| {
                    let (_, rest) = raw.rsplit_once(')')?;
                    rest.trim_start().chars().next()
                })
                .is_some_and(|state| state != 'Z')
        }

        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("child.pid");
        let mut backend = ComfyBackend::new(offline_settings()).unwrap();
        backend
            .spawn(&format!("sleep 30 & echo $! > {}; exit 0", pid_file.display()))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while backend.reap_exited().is_none() {
            assert!(Instant::now() < deadline, "launcher never exited");
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!backend.owns_process());

        let leftover = fs::read_to_string(&pid_file).unwrap();
        let stat = format!("/proc/{}/stat", leftover.trim());
        while running(&stat) {
            assert!(Instant::now() < deadline, "leftover group member survived");
            thread::sleep(Duration::from_millis(20));
        }
    }
}
