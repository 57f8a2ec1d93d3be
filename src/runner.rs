//! Client for the Rails runner worker process.
//!
//! The worker is a long-lived child process that boots the host Rails
//! application once and then answers introspection queries over its stdio.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    stdin  (requests)     ┌─────────────────────┐
//! │   Host process  │ ───────────────────────► │  bin/rails runner   │
//! │ (RunnerClient)  │ ◄─────────────────────── │   server.rb start   │
//! └─────────────────┘    stdout (responses)    └─────────────────────┘
//!                        stderr (diagnostics)
//! ```
//!
//! # Protocol
//!
//! Messages use HTTP-style Content-Length framing (same as LSP):
//!
//! ```text
//! Content-Length: 43\r\n
//! \r\n
//! {"method":"model","params":{"name":"User"}}
//! ```
//!
//! Replies carry either `{"result": {...}}` or `{"error": "..."}`. While the
//! worker boots it may emit frames with `Content-Length: 0`; the client
//! re-reads those a bounded number of times before giving up.
//!
//! # Usage
//!
//! ```ignore
//! use rails_runner::runner::{create, RunnerService};
//!
//! let mut client = create(&std::env::current_dir()?);
//! if let Some(model) = client.model("User") {
//!     println!("{}", serde_json::to_string_pretty(&model)?);
//! }
//! client.shutdown();
//! ```

mod client;
pub mod framing;
mod process;

pub use client::{
    create, create_with_config, ClientState, JsonObject, NullClient, RunnerClient, RunnerError,
    RunnerService,
};
pub use framing::{encode, read_message, write_message, FrameError, Request, Response};
pub use process::{StderrCapture, WorkerProcess, WorkerStreams};
