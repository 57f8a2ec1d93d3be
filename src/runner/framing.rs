//! Content-Length message framing for the runner protocol over stdio pipes.
//!
//! Every message travels as an HTTP-style header block followed by a JSON
//! body, the same framing the Language Server Protocol uses:
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! Header parsing is case-insensitive. A header block that declares a zero
//! (or no) length is reported as [`FrameError::EmptyMessage`]: the worker is
//! alive but has nothing to say yet, which is what it does while booting.

use std::io::{self, BufRead, ErrorKind, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Maximum message size (100MB) to prevent OOM from a misbehaving worker.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Upper bound on the header block; real headers are a few dozen bytes.
const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Separator between the header block and the body.
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Errors raised while framing or unframing a message.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended before a complete header or body was available.
    #[error("incomplete message: stream ended before a complete frame")]
    IncompleteMessage,

    /// The frame declared a zero or missing Content-Length.
    #[error("empty message: frame declared no content")]
    EmptyMessage,

    /// Declared body size exceeds the configured maximum.
    #[error("message size {size} exceeds maximum {max} bytes")]
    TooLarge {
        /// Declared Content-Length
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// The body could not be interpreted as a protocol message.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Failed to serialize an outbound request.
    #[error("failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl FrameError {
    /// True for the "connection alive, no payload yet" condition.
    pub fn is_empty_message(&self) -> bool {
        matches!(self, FrameError::EmptyMessage)
    }

    /// True when the stream was cut short.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, FrameError::IncompleteMessage)
    }
}

/// Outbound request body.
///
/// `params` is skipped entirely when absent rather than serialized as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Map<String, Value>>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// The `result` object of a successful reply.
    Result(Map<String, Value>),
    /// The worker answered with an `error` field.
    Error(String),
    /// No body: `result` was null or the connection is gone.
    Absent,
}

impl Response {
    /// Collapse into the optional result the public client API hands out.
    pub fn into_result(self) -> Option<Map<String, Value>> {
        match self {
            Response::Result(map) => Some(map),
            Response::Error(_) | Response::Absent => None,
        }
    }
}

/// Encode a request into its wire representation.
pub fn encode(method: &str, params: Option<&Map<String, Value>>) -> Result<Vec<u8>, FrameError> {
    #[derive(Serialize)]
    struct Outbound<'a> {
        method: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<&'a Map<String, Value>>,
    }

    let body = serde_json::to_vec(&Outbound { method, params }).map_err(FrameError::Serialize)?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encode and write one request, flushing the stream.
///
/// A worker that has closed its end of the pipe surfaces as
/// [`FrameError::IncompleteMessage`]: the frame could not be delivered.
pub fn write_message<W: Write>(
    writer: &mut W,
    method: &str,
    params: Option<&Map<String, Value>>,
) -> Result<(), FrameError> {
    let frame = encode(method, params)?;

    writer
        .write_all(&frame)
        .and_then(|()| writer.flush())
        .map_err(|e| {
            debug!("Failed to write {} frame: {}", method, e);
            FrameError::IncompleteMessage
        })
}

/// Read one frame and return its raw body bytes.
///
/// # Protocol
///
/// 1. Read up to and including the first `\r\n\r\n`
/// 2. Extract Content-Length (case-insensitive, missing means 0)
/// 3. Read exactly that many bytes for the body (or skip them when the
///    frame is over `max_size`)
///
/// I/O failures other than a short read are passed through untouched so the
/// caller can decide how to treat a dead connection.
pub fn read_frame<R: BufRead>(reader: &mut R, max_size: usize) -> Result<Vec<u8>, ReadError> {
    let header = read_header(reader)?;
    let size = content_length(&header);

    if size == 0 {
        return Err(FrameError::EmptyMessage.into());
    }

    if size > max_size {
        // Discard the body so the next frame starts on a header.
        let skipped = io::copy(&mut reader.by_ref().take(size as u64), &mut io::sink())
            .map_err(ReadError::Io)?;
        if skipped < size as u64 {
            return Err(FrameError::IncompleteMessage.into());
        }
        return Err(FrameError::TooLarge {
            size,
            max: max_size,
        }
        .into());
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => ReadError::Frame(FrameError::IncompleteMessage),
        _ => ReadError::Io(e),
    })?;

    Ok(body)
}

/// Read and decode one response frame.
///
/// Broken pipes and other stream failures resolve to [`Response::Absent`];
/// only framing problems are returned as errors.
pub fn read_message<R: BufRead>(reader: &mut R, max_size: usize) -> Result<Response, FrameError> {
    let body = match read_frame(reader, max_size) {
        Ok(body) => body,
        Err(ReadError::Frame(e)) => return Err(e),
        Err(ReadError::Io(e)) => {
            warn!("Worker connection failed while reading: {}", e);
            return Ok(Response::Absent);
        }
    };

    decode_body(&body)
}

/// Interpret a response body.
pub fn decode_body(body: &[u8]) -> Result<Response, FrameError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| FrameError::Malformed(format!("invalid JSON body: {}", e)))?;

    let Value::Object(mut object) = value else {
        return Err(FrameError::Malformed(
            "response body is not a JSON object".to_string(),
        ));
    };

    if let Some(err) = object.remove("error") {
        let message = match err {
            Value::String(s) => s,
            other => other.to_string(),
        };
        error!("Rails runner error: {}", message);
        return Ok(Response::Error(message));
    }

    match object.remove("result") {
        Some(Value::Object(map)) => Ok(Response::Result(map)),
        Some(Value::Null) => Ok(Response::Absent),
        Some(other) => Err(FrameError::Malformed(format!(
            "result is not an object: {}",
            other
        ))),
        None => Err(FrameError::Malformed(
            "response has neither result nor error".to_string(),
        )),
    }
}

/// Failure from [`read_frame`]: either a framing condition or a raw I/O error.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

fn read_header<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, ReadError> {
    let mut header = Vec::new();

    loop {
        let bytes_read = reader.read_until(b'\n', &mut header).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => ReadError::Frame(FrameError::IncompleteMessage),
            _ => ReadError::Io(e),
        })?;

        // EOF before the blank line
        if bytes_read == 0 {
            if !header.is_empty() {
                debug!("Stream closed mid-header after {} bytes", header.len());
            }
            return Err(FrameError::IncompleteMessage.into());
        }

        if header.ends_with(HEADER_TERMINATOR) {
            return Ok(header);
        }

        if header.len() > MAX_HEADER_SIZE {
            return Err(FrameError::Malformed(format!(
                "header block exceeds {} bytes",
                MAX_HEADER_SIZE
            ))
            .into());
        }
    }
}

fn content_length(header: &[u8]) -> usize {
    let header = String::from_utf8_lossy(header);

    for line in header.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        if key.trim().eq_ignore_ascii_case("Content-Length") {
            match value.trim().parse::<usize>() {
                Ok(len) => return len,
                Err(_) => {
                    debug!("Ignoring unparsable Content-Length: {:?}", value.trim());
                    return 0;
                }
            }
        }
        // Ignore other headers (e.g., Content-Type)
    }

    0
}
