//! Runner configuration.
//!
//! Defaults match a stock Rails project: the worker is started with
//! `bin/rails runner <server-script> start` from the project root, and the
//! presence of `bin/rails` marks the project as compatible. Hosts can embed
//! [`RunnerConfig`] in their own serde config or overlay environment variables
//! with [`RunnerConfig::from_env`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::framing::MAX_MESSAGE_SIZE;

/// Environment variable holding a whitespace-separated worker command.
pub const COMMAND_ENV: &str = "RAILS_RUNNER_COMMAND";

/// Environment variable holding the worker entry script path.
pub const SERVER_SCRIPT_ENV: &str = "RAILS_RUNNER_SERVER_SCRIPT";

/// Entry script passed to `bin/rails runner` when none is configured.
pub const DEFAULT_SERVER_SCRIPT: &str = "rails_runner/server.rb";

/// Marker file that identifies a compatible project.
pub const DEFAULT_MARKER: &str = "bin/rails";

/// Retries allowed after the first handshake read returns an empty frame.
pub const MAX_RETRIES: u32 = 5;

/// Grace period between the shutdown notification and closing the pipes.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 500;

/// Bytes of worker stderr kept for diagnostics.
pub const DEFAULT_STDERR_CAPTURE_BYTES: usize = 64 * 1024;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker command is empty")]
    EmptyCommand,

    #[error("max_message_size must be greater than zero")]
    ZeroMessageSize,
}

/// Settings for spawning and talking to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Argument vector launching the worker; the first element is the program.
    pub command: Vec<String>,
    /// Path, relative to the project root, that must exist before spawning.
    pub marker: PathBuf,
    /// Handshake retries on empty frames.
    pub max_retries: u32,
    /// Sleep after sending `shutdown`, in milliseconds.
    pub shutdown_grace_ms: u64,
    /// Largest accepted response body.
    pub max_message_size: usize,
    /// Tail of worker stderr retained for error reports.
    pub stderr_capture_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: default_command(DEFAULT_SERVER_SCRIPT),
            marker: PathBuf::from(DEFAULT_MARKER),
            max_retries: MAX_RETRIES,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            max_message_size: MAX_MESSAGE_SIZE,
            stderr_capture_bytes: DEFAULT_STDERR_CAPTURE_BYTES,
        }
    }
}

impl RunnerConfig {
    /// Defaults overlaid with `RAILS_RUNNER_COMMAND` / `RAILS_RUNNER_SERVER_SCRIPT`.
    ///
    /// An explicit command wins over a server script.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(script) = std::env::var(SERVER_SCRIPT_ENV) {
            if !script.trim().is_empty() {
                config.command = default_command(script.trim());
            }
        }

        if let Ok(command) = std::env::var(COMMAND_ENV) {
            let argv = split_command(&command);
            if !argv.is_empty() {
                config.command = argv;
            }
        }

        config
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_marker(mut self, marker: impl Into<PathBuf>) -> Self {
        self.marker = marker.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Location of the marker file inside `work_dir`.
    pub fn marker_path(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(&self.marker)
    }

    /// Check invariants the client relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.first().map_or(true, |program| program.is_empty()) {
            return Err(ConfigError::EmptyCommand);
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::ZeroMessageSize);
        }
        Ok(())
    }
}

fn default_command(server_script: &str) -> Vec<String> {
    vec![
        DEFAULT_MARKER.to_string(),
        "runner".to_string(),
        server_script.to_string(),
        "start".to_string(),
    ]
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}
