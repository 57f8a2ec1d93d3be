//! Rails Runner Client Library
//!
//! This library supervises a long-lived Rails runner worker and queries it
//! over a Content-Length framed JSON protocol on the worker's stdio:
//!
//! - `runner` - process supervision, message framing and the client
//! - `config` - worker command, marker file, retry and shutdown settings
//!
//! # Runner Module
//!
//! ```ignore
//! use rails_runner::runner::{create, RunnerService};
//!
//! let mut client = create(std::path::Path::new("."));
//! let route = client.route("users", "index");
//! client.shutdown();
//! ```

pub mod config;
pub mod runner;

pub use config::{ConfigError, RunnerConfig};
pub use runner::{create, create_with_config, NullClient, RunnerClient, RunnerError, RunnerService};
