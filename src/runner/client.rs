//! Synchronous client for the Rails runner worker.
//!
//! [`create`] is the entry point hosts should use. It never fails: when the
//! project is not a Rails app, or the worker cannot be booted, it hands back a
//! [`NullClient`] that answers every query with `None`. Callers hold a
//! `Box<dyn RunnerService>` and never branch on which variant they got.
//!
//! All operations block the calling thread until the worker answers or the
//! connection is found dead. There is a single request in flight at a time.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, ChildStdout};

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, RunnerConfig};
use crate::runner::framing::{
    decode_body, read_frame, read_message, write_message, FrameError, ReadError, Response,
};
use crate::runner::process::{StderrCapture, WorkerProcess};

/// Result object returned by the worker.
pub type JsonObject = Map<String, Value>;

/// Client errors.
///
/// These never escape the [`RunnerService`] operations; they are available
/// through [`RunnerClient::call`] for callers that want to tell a worker-side
/// failure apart from a broken connection.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Configuration rejected before spawning.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The worker process could not be started.
    #[error("failed to spawn Rails runner: {0}")]
    Spawn(#[source] std::io::Error),

    /// Framing-level failure on the connection.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The worker answered with an `error` body.
    #[error("Rails runner error: {0}")]
    Worker(String),

    /// The client's streams have already been closed.
    #[error("Rails runner connection is closed")]
    Closed,

    /// The startup handshake did not complete.
    #[error("failed to initialize Rails runner: {reason}")]
    Initialization {
        /// What went wrong during boot
        reason: String,
        /// Worker stderr captured up to the failure
        stderr: String,
    },
}

impl RunnerError {
    fn is_incomplete(&self) -> bool {
        matches!(self, RunnerError::Frame(FrameError::IncompleteMessage))
    }
}

/// Lifecycle of a [`RunnerClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Spawned, waiting for the handshake frame.
    Booting,
    /// Handshake received; requests are accepted.
    Ready,
    /// `shutdown` sent, streams being closed.
    ShuttingDown,
    /// All streams closed and the worker is gone.
    Stopped,
}

/// Operations shared by the real client and the null client.
///
/// The typed queries have default implementations on top of
/// [`RunnerService::request`]; [`RunnerClient`] overrides them to attach
/// query-specific diagnostics when a call fails.
pub trait RunnerService {
    /// Send `method` and wait for its result. `None` on any failure.
    fn request(&mut self, method: &str, params: Option<JsonObject>) -> Option<JsonObject>;

    /// Send `method` without waiting for a reply.
    fn notify(&mut self, method: &str);

    /// Ask the worker to exit and release its streams.
    fn shutdown(&mut self);

    /// True once every stream is closed and the worker is no longer running.
    fn stopped(&mut self) -> bool;

    /// Application root reported by the worker.
    fn rails_root(&self) -> &Path;

    /// Schema information for an ActiveRecord model.
    fn model(&mut self, name: &str) -> Option<JsonObject> {
        self.request("model", Some(params(json!({ "name": name }))))
    }

    /// Source location of the class an association points at.
    fn association_target_location(
        &mut self,
        model_name: &str,
        association_name: &str,
    ) -> Option<JsonObject> {
        self.request(
            "association_target_location",
            Some(params(json!({
                "model_name": model_name,
                "association_name": association_name,
            }))),
        )
    }

    /// Definition site of a named route helper.
    fn route_location(&mut self, name: &str) -> Option<JsonObject> {
        self.request("route_location", Some(params(json!({ "name": name }))))
    }

    /// Route information for a controller action.
    fn route(&mut self, controller: &str, action: &str) -> Option<JsonObject> {
        self.request(
            "route_info",
            Some(params(json!({ "controller": controller, "action": action }))),
        )
    }

    /// Ask the worker to reload application code.
    fn trigger_reload(&mut self) {
        self.notify("reload");
    }
}

/// Start a client for the project in `work_dir`, configured from the environment.
pub fn create(work_dir: &Path) -> Box<dyn RunnerService> {
    create_with_config(work_dir, RunnerConfig::from_env())
}

/// Start a client for the project in `work_dir`.
///
/// Falls back to a [`NullClient`] when the marker file is missing or the
/// worker fails to boot. Never fails.
pub fn create_with_config(work_dir: &Path, config: RunnerConfig) -> Box<dyn RunnerService> {
    let marker = config.marker_path(work_dir);
    if !marker.exists() {
        warn!(
            "Rails runner: {} not found in {}, running without a worker",
            config.marker.display(),
            work_dir.display()
        );
        return Box::new(NullClient::new(work_dir));
    }

    match RunnerClient::start(work_dir, config) {
        Ok(client) => Box::new(client),
        Err(RunnerError::Initialization { reason, stderr }) => {
            error!("Rails runner failed to initialize: {}", reason);
            if !stderr.is_empty() {
                error!("Rails runner stderr:\n{}", stderr.trim_end());
            }
            Box::new(NullClient::new(work_dir))
        }
        Err(e) => {
            error!("Rails runner could not be started: {}", e);
            Box::new(NullClient::new(work_dir))
        }
    }
}

/// Client owning a live worker process.
///
/// # Process Cleanup Safety
/// The client owns the child and its three pipes. Dropping a client that was
/// never shut down closes the pipes, gives the worker the shutdown grace
/// period to exit on its own, and then kills it.
pub struct RunnerClient {
    config: RunnerConfig,
    process: WorkerProcess,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    stderr: StderrCapture,
    state: ClientState,
    root: PathBuf,
}

impl RunnerClient {
    /// Spawn the worker and wait for its ready frame.
    ///
    /// Empty frames during boot are re-read (no resend, no delay) up to
    /// `config.max_retries` times after the first attempt.
    pub fn start(work_dir: &Path, config: RunnerConfig) -> Result<Self, RunnerError> {
        config.validate()?;

        let (process, streams) =
            WorkerProcess::spawn(&config.command, work_dir).map_err(RunnerError::Spawn)?;

        let mut client = Self {
            stderr: StderrCapture::new(streams.stderr, config.stderr_capture_bytes),
            stdin: Some(streams.stdin),
            stdout: Some(streams.stdout),
            process,
            state: ClientState::Booting,
            root: work_dir.to_path_buf(),
            config,
        };

        if let Err(reason) = client.handshake() {
            return Err(client.abort(reason));
        }

        Ok(client)
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn pid(&self) -> u32 {
        self.process.id()
    }

    /// Send a request and return its result, keeping failure kinds apart.
    ///
    /// `Ok(None)` means the worker answered with a null result or the
    /// connection went away while reading.
    pub fn call(
        &mut self,
        method: &str,
        params: Option<&JsonObject>,
    ) -> Result<Option<JsonObject>, RunnerError> {
        if self.state != ClientState::Ready {
            return Err(RunnerError::Closed);
        }

        debug!("Rails runner request: {}", method);
        let sent = self.send(method, params);
        let response = sent.and_then(|()| self.read_response());
        self.relay_stderr();

        match response? {
            Response::Result(result) => Ok(Some(result)),
            Response::Absent => Ok(None),
            Response::Error(message) => Err(RunnerError::Worker(message)),
        }
    }

    fn handshake(&mut self) -> Result<(), String> {
        let mut retries = 0;

        let body = loop {
            let stdout = self
                .stdout
                .as_mut()
                .ok_or_else(|| RunnerError::Closed.to_string())?;

            match read_frame(stdout, self.config.max_message_size) {
                Ok(body) => break body,
                Err(ReadError::Frame(FrameError::EmptyMessage))
                    if retries < self.config.max_retries =>
                {
                    retries += 1;
                    info!("Rails runner is retrying initialize ({})", retries);
                }
                Err(ReadError::Frame(FrameError::EmptyMessage)) => {
                    return Err(format!(
                        "worker sent only empty messages after {} retries",
                        retries
                    ));
                }
                Err(ReadError::Frame(e)) => return Err(e.to_string()),
                Err(ReadError::Io(e)) => {
                    return Err(format!("connection to worker failed during boot: {}", e));
                }
            }
        };

        match decode_body(&body) {
            Ok(Response::Result(result)) => {
                if let Some(root) = result.get("root").and_then(Value::as_str) {
                    self.root = PathBuf::from(root);
                }
                self.state = ClientState::Ready;
                self.relay_stderr();
                info!("Finished booting Rails runner (root: {})", self.root.display());
                Ok(())
            }
            Ok(Response::Absent) => Err("worker answered boot with a null result".to_string()),
            Ok(Response::Error(message)) => Err(format!("worker reported an error: {}", message)),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Kill a worker that failed to boot and build the initialization error.
    fn abort(&mut self, reason: String) -> RunnerError {
        self.process.terminate();

        // Helpers still holding the pipes exit once stdin closes; wait for
        // their stderr to flush before collecting it.
        self.stdin = None;
        self.stdout = None;
        self.stderr.wait_for_eof(self.config.shutdown_grace());
        let stderr = self.stderr.take_tail();
        self.stderr.close();
        self.state = ClientState::Stopped;

        RunnerError::Initialization { reason, stderr }
    }

    fn send(&mut self, method: &str, params: Option<&JsonObject>) -> Result<(), RunnerError> {
        let stdin = self.stdin.as_mut().ok_or(RunnerError::Closed)?;
        write_message(stdin, method, params)?;
        Ok(())
    }

    fn read_response(&mut self) -> Result<Response, RunnerError> {
        let stdout = self.stdout.as_mut().ok_or(RunnerError::Closed)?;
        Ok(read_message(stdout, self.config.max_message_size)?)
    }

    /// Re-emit anything the worker printed on stderr since the last exchange.
    fn relay_stderr(&mut self) {
        let text = self.stderr.drain();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            debug!("Rails runner stderr: {}", line);
        }
    }

    /// Log a failed query together with the worker's recent stderr.
    fn recover(
        &mut self,
        result: Result<Option<JsonObject>, RunnerError>,
        context: &str,
    ) -> Option<JsonObject> {
        match result {
            Ok(result) => result,
            // Already reported by the decoder.
            Err(RunnerError::Worker(_)) => None,
            Err(e) => {
                let stderr = self.stderr.take_tail();
                if e.is_incomplete() {
                    error!("Rails runner failed to {}: {}", context, stderr.trim_end());
                } else {
                    error!("Rails runner failed to {} ({}): {}", context, e, stderr.trim_end());
                }
                None
            }
        }
    }

    fn close_streams(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.stderr.close();
    }

    fn streams_closed(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_closed()
    }
}

impl RunnerService for RunnerClient {
    fn request(&mut self, method: &str, params: Option<JsonObject>) -> Option<JsonObject> {
        let result = self.call(method, params.as_ref());
        self.recover(result, &format!("handle {}", method))
    }

    fn notify(&mut self, method: &str) {
        if let Err(e) = self.send(method, None) {
            warn!("Rails runner failed to send {}: {}", method, e);
        }
    }

    fn shutdown(&mut self) {
        if matches!(self.state, ClientState::ShuttingDown | ClientState::Stopped) {
            return;
        }

        info!("Rails runner shutting down worker");
        self.state = ClientState::ShuttingDown;

        match self.send("shutdown", None) {
            Ok(()) => {
                if !self.process.wait_for_exit(self.config.shutdown_grace()) {
                    debug!("Rails runner still running after shutdown grace period");
                }
            }
            Err(e) => {
                // The connection died; nothing will read the notification.
                warn!("Rails runner shutdown could not be delivered: {}", e);
                self.process.terminate();
            }
        }

        self.relay_stderr();
        self.close_streams();
    }

    fn stopped(&mut self) -> bool {
        if self.state == ClientState::Stopped {
            return true;
        }

        let stopped = self.streams_closed() && !self.process.is_alive();
        if stopped {
            self.state = ClientState::Stopped;
        }
        stopped
    }

    fn rails_root(&self) -> &Path {
        &self.root
    }

    fn model(&mut self, name: &str) -> Option<JsonObject> {
        let result = self.call("model", Some(&params(json!({ "name": name }))));
        self.recover(result, "get model information")
    }

    fn association_target_location(
        &mut self,
        model_name: &str,
        association_name: &str,
    ) -> Option<JsonObject> {
        let request = params(json!({
            "model_name": model_name,
            "association_name": association_name,
        }));

        match self.call("association_target_location", Some(&request)) {
            Ok(result) => result,
            Err(e) => {
                let stderr = self.stderr.take_tail();
                error!("Rails runner failed with {}: {}", e, stderr.trim_end());
                None
            }
        }
    }

    fn route_location(&mut self, name: &str) -> Option<JsonObject> {
        let result = self.call("route_location", Some(&params(json!({ "name": name }))));
        self.recover(result, "get route location")
    }

    fn route(&mut self, controller: &str, action: &str) -> Option<JsonObject> {
        let request = params(json!({ "controller": controller, "action": action }));
        let result = self.call("route_info", Some(&request));
        self.recover(result, "get route information")
    }

    fn trigger_reload(&mut self) {
        info!("Reloading Rails application");
        if let Err(e) = self.send("reload", None) {
            warn!("Rails runner failed to trigger reload: {}", e);
        }
    }
}

impl Drop for RunnerClient {
    fn drop(&mut self) {
        if self.state == ClientState::Stopped {
            return;
        }

        // EOF on stdin lets a healthy worker exit by itself.
        self.close_streams();

        if !self.process.wait_for_exit(self.config.shutdown_grace()) {
            warn!("Rails runner didn't exit after teardown, killing");
            self.process.terminate();
        }
        self.state = ClientState::Stopped;
    }
}

/// Stand-in used when no worker could be started.
#[derive(Debug, Clone)]
pub struct NullClient {
    root: PathBuf,
}

impl NullClient {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            root: work_dir.to_path_buf(),
        }
    }
}

impl RunnerService for NullClient {
    fn request(&mut self, _method: &str, _params: Option<JsonObject>) -> Option<JsonObject> {
        None
    }

    fn notify(&mut self, _method: &str) {}

    fn shutdown(&mut self) {}

    fn stopped(&mut self) -> bool {
        true
    }

    fn rails_root(&self) -> &Path {
        &self.root
    }
}

fn params(value: Value) -> JsonObject {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
