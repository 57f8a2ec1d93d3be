//! Integration tests for the runner client against a scripted worker.
//!
//! The fake worker is a `/bin/sh` script that replays a prepared file of
//! response frames on stdout and records everything the client sends on
//! stdin, so each test can assert both what the client returned and what
//! went over the wire.
//!
//! # Running
//!
//! ```bash
//! cargo test --test runner_integration -- --nocapture
//! ```

#![cfg(unix)]

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;

use rails_runner::runner::framing::{encode, read_frame, MAX_MESSAGE_SIZE};
use rails_runner::runner::{
    create_with_config, ClientState, FrameError, Request, RunnerClient, RunnerError,
    RunnerService,
};
use rails_runner::RunnerConfig;

/// Generous upper bound for the worker to notice its stdin closed.
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A temporary Rails-looking project with a scripted worker.
struct FakeProject {
    dir: TempDir,
}

impl FakeProject {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/rails"), "#!/bin/sh\n").unwrap();
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn requests_log(&self) -> PathBuf {
        self.path().join("requests.log")
    }

    /// Config whose worker prints `stderr`, replays `frames`, then records stdin.
    fn config(&self, stderr: &str, frames: &[Vec<u8>]) -> RunnerConfig {
        self.config_with_prelude(&format!("printf '%s' '{}' >&2", stderr), frames)
    }

    /// Like [`FakeProject::config`], running the shell `prelude` before replaying.
    fn config_with_prelude(&self, prelude: &str, frames: &[Vec<u8>]) -> RunnerConfig {
        self.config_with_recorder(prelude, frames, "cat > \"$2\"")
    }

    fn config_with_recorder(
        &self,
        prelude: &str,
        frames: &[Vec<u8>],
        recorder: &str,
    ) -> RunnerConfig {
        let frames_path = self.path().join("frames.bin");
        fs::write(&frames_path, frames.concat()).unwrap();

        let script = format!(
            "{}; cat \"$1\"; exec 1>&-; {}",
            prelude, recorder
        );

        RunnerConfig::default()
            .with_command([
                "sh".to_string(),
                "-c".to_string(),
                script,
                "fake-runner".to_string(),
                frames_path.display().to_string(),
                self.requests_log().display().to_string(),
            ])
            .with_shutdown_grace(Duration::from_millis(100))
    }

    /// Requests the worker received, in order.
    fn requests(&self) -> Vec<Request> {
        let bytes = fs::read(self.requests_log()).unwrap_or_default();
        let mut cursor = Cursor::new(bytes);
        let mut requests = Vec::new();

        while let Ok(body) = read_frame(&mut cursor, MAX_MESSAGE_SIZE) {
            requests.push(serde_json::from_slice(&body).expect("request body is JSON"));
        }
        requests
    }
}

fn frame(body: Value) -> Vec<u8> {
    let body = body.to_string();
    format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
}

fn empty_frame() -> Vec<u8> {
    b"Content-Length: 0\r\n\r\n".to_vec()
}

fn ready_frame() -> Vec<u8> {
    frame(json!({ "result": { "message": "ok", "root": "/srv/app" } }))
}

fn object(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

fn wait_until_stopped(client: &mut dyn RunnerService) -> bool {
    let deadline = Instant::now() + EXIT_TIMEOUT;
    while Instant::now() < deadline {
        if client.stopped() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    client.stopped()
}

#[test]
fn test_boot_and_route_lookup() {
    let project = FakeProject::new();
    let config = project.config(
        "",
        &[
            ready_frame(),
            frame(json!({ "result": { "path": "/users", "verb": "GET" } })),
        ],
    );

    let mut client = RunnerClient::start(project.path(), config).expect("worker should boot");
    assert_eq!(client.state(), ClientState::Ready);
    assert_eq!(client.rails_root(), Path::new("/srv/app"));

    let route = client.route("users", "index");
    assert_eq!(route, Some(object(json!({ "path": "/users", "verb": "GET" }))));

    client.shutdown();
    assert!(wait_until_stopped(&mut client));
    assert_eq!(client.state(), ClientState::Stopped);

    let requests = project.requests();
    assert_eq!(
        requests,
        vec![
            Request::new(
                "route_info",
                Some(object(json!({ "controller": "users", "action": "index" })))
            ),
            Request::new("shutdown", None),
        ]
    );
}

#[test]
fn test_typed_queries_send_expected_requests() {
    let project = FakeProject::new();
    let config = project.config(
        "",
        &[
            ready_frame(),
            frame(json!({ "result": { "columns": [["id", "integer"]] } })),
            frame(json!({ "result": { "location": "app/models/post.rb:1" } })),
            frame(json!({ "result": null })),
        ],
    );

    let mut client = create_with_config(project.path(), config);

    assert_eq!(
        client.model("User"),
        Some(object(json!({ "columns": [["id", "integer"]] })))
    );
    assert_eq!(
        client.association_target_location("User", "posts"),
        Some(object(json!({ "location": "app/models/post.rb:1" })))
    );
    assert_eq!(client.route_location("missing_path"), None);
    client.trigger_reload();

    client.shutdown();
    assert!(wait_until_stopped(client.as_mut()));

    let methods: Vec<String> = project.requests().into_iter().map(|r| r.method).collect();
    assert_eq!(
        methods,
        vec![
            "model",
            "association_target_location",
            "route_location",
            "reload",
            "shutdown"
        ]
    );

    let requests = project.requests();
    assert_eq!(requests[0].params, Some(object(json!({ "name": "User" }))));
    assert_eq!(
        requests[1].params,
        Some(object(json!({ "model_name": "User", "association_name": "posts" })))
    );
    assert_eq!(requests[3].params, None);
}

#[test]
fn test_boot_retries_empty_messages() {
    let project = FakeProject::new();
    let mut frames = vec![empty_frame(); 5];
    frames.push(ready_frame());

    let mut client = RunnerClient::start(project.path(), project.config("", &frames))
        .expect("five empty frames are within the retry budget");
    assert_eq!(client.state(), ClientState::Ready);

    client.shutdown();
}

#[test]
fn test_sixth_empty_message_fails_initialization() {
    let project = FakeProject::new();
    let mut frames = vec![empty_frame(); 6];
    frames.push(ready_frame());

    let err = RunnerClient::start(project.path(), project.config("still booting", &frames))
        .err()
        .expect("boot should fail");

    match err {
        RunnerError::Initialization { reason, stderr } => {
            assert!(reason.contains("empty"), "reason: {}", reason);
            assert!(stderr.contains("still booting"), "stderr: {:?}", stderr);
        }
        other => panic!("Expected Initialization error, got {:?}", other),
    }
}

#[test]
fn test_worker_exit_during_boot_degrades_to_null_client() {
    let project = FakeProject::new();
    let config = RunnerConfig::default().with_command([
        "sh",
        "-c",
        "echo 'LoadError: cannot load such file' >&2; exit 1",
    ]);

    let err = RunnerClient::start(project.path(), config.clone())
        .err()
        .expect("boot should fail");
    match err {
        RunnerError::Initialization { stderr, .. } => {
            assert!(stderr.contains("LoadError"), "stderr: {:?}", stderr);
        }
        other => panic!("Expected Initialization error, got {:?}", other),
    }

    let mut client = create_with_config(project.path(), config);
    assert!(client.stopped());
    assert_eq!(client.model("User"), None);
    assert_eq!(client.rails_root(), project.path());
}

#[test]
fn test_missing_marker_returns_null_client() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunnerConfig::default().with_command(["sh", "-c", "exit 1"]);

    let mut client = create_with_config(dir.path(), config);

    assert_eq!(client.request("model", Some(object(json!({ "name": "User" })))), None);
    assert!(client.stopped());
}

#[test]
fn test_error_response_returns_none() {
    let project = FakeProject::new();
    let config = project.config(
        "",
        &[
            ready_frame(),
            frame(json!({ "error": "undefined method `unknown'" })),
            frame(json!({ "result": { "still": "alive" } })),
        ],
    );

    let mut client = RunnerClient::start(project.path(), config).unwrap();

    assert_eq!(client.request("unknown", None), None);
    // The connection stays usable after a worker-side error.
    assert_eq!(
        client.request("model", Some(object(json!({ "name": "User" })))),
        Some(object(json!({ "still": "alive" })))
    );

    client.shutdown();
}

#[test]
fn test_call_distinguishes_worker_errors() {
    let project = FakeProject::new();
    let config = project.config(
        "",
        &[ready_frame(), frame(json!({ "error": "boom" }))],
    );

    let mut client = RunnerClient::start(project.path(), config).unwrap();

    match client.call("explode", None) {
        Err(RunnerError::Worker(message)) => assert_eq!(message, "boom"),
        other => panic!("Expected worker error, got {:?}", other),
    }

    client.shutdown();
}

#[test]
fn test_request_after_worker_output_ends_returns_none() {
    let project = FakeProject::new();
    let config = project.config("", &[ready_frame()]);

    let mut client = RunnerClient::start(project.path(), config).unwrap();

    // No more frames: stdout hits EOF mid-conversation.
    assert_eq!(client.model("User"), None);
    assert_eq!(client.route("users", "index"), None);
    assert_eq!(client.association_target_location("User", "posts"), None);

    client.shutdown();
    assert!(wait_until_stopped(&mut client));
}

#[test]
fn test_notify_after_worker_closed_stdin() {
    let project = FakeProject::new();
    let frames = project.path().join("frames.bin");
    fs::write(&frames, ready_frame()).unwrap();
    let frames = frames.display().to_string();
    let config = RunnerConfig::default()
        .with_command([
            "sh",
            "-c",
            "cat \"$1\"; exec 0<&-; sleep 1",
            "fake-runner",
            frames.as_str(),
        ])
        .with_shutdown_grace(Duration::from_millis(100));

    let mut client = RunnerClient::start(project.path(), config).unwrap();
    thread::sleep(Duration::from_millis(200));

    client.trigger_reload();
    client.notify("reload");

    client.shutdown();
    assert!(wait_until_stopped(&mut client));
}

#[test]
fn test_shutdown_is_idempotent_and_blocks_requests() {
    let project = FakeProject::new();
    let config = project.config("", &[ready_frame()]);

    let mut client = RunnerClient::start(project.path(), config).unwrap();
    client.shutdown();
    client.shutdown();

    assert!(matches!(client.call("model", None), Err(RunnerError::Closed)));
    assert_eq!(client.model("User"), None);
    assert!(wait_until_stopped(&mut client));

    let methods: Vec<String> = project.requests().into_iter().map(|r| r.method).collect();
    assert_eq!(methods, vec!["shutdown"]);
}

#[test]
fn test_drop_without_shutdown_reaps_worker() {
    let project = FakeProject::new();
    // Ignores stdin EOF, so teardown has to kill it.
    let frames = project.path().join("frames.bin");
    fs::write(&frames, ready_frame()).unwrap();
    let frames = frames.display().to_string();
    let config = RunnerConfig::default()
        .with_command([
            "sh",
            "-c",
            "cat \"$1\"; exec sleep 30",
            "fake-runner",
            frames.as_str(),
        ])
        .with_shutdown_grace(Duration::from_millis(100));

    let client = RunnerClient::start(project.path(), config).unwrap();
    let pid = nix::unistd::Pid::from_raw(client.pid() as i32);

    let started = Instant::now();
    drop(client);
    assert!(started.elapsed() < EXIT_TIMEOUT);

    // The child has been killed and reaped, so the pid no longer exists.
    assert!(nix::sys::signal::kill(pid, None).is_err());
}

#[test]
fn test_boot_survives_stderr_flood() {
    let project = FakeProject::new();
    // Far more than a pipe buffer, written before the ready frame.
    let config = project.config_with_prelude(
        "head -c 204800 /dev/zero | tr '\\0' w >&2",
        &[
            ready_frame(),
            frame(json!({ "result": { "path": "/users" } })),
        ],
    );
    let root = project.path().to_path_buf();

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(RunnerClient::start(&root, config));
    });

    let mut client = rx
        .recv_timeout(EXIT_TIMEOUT)
        .expect("boot should not stall on a full stderr pipe")
        .expect("worker should boot");
    assert_eq!(client.state(), ClientState::Ready);
    assert_eq!(
        client.route_location("users_path"),
        Some(object(json!({ "path": "/users" })))
    );

    client.shutdown();
    assert!(wait_until_stopped(&mut client));
}

#[test]
fn test_oversized_response_does_not_desync_later_requests() {
    let project = FakeProject::new();
    let config = project
        .config(
            "",
            &[
                ready_frame(),
                frame(json!({ "result": { "blob": "x".repeat(2000) } })),
                frame(json!({ "result": { "path": "/users" } })),
                frame(json!({ "result": { "path": "/posts" } })),
            ],
        )
        .with_max_message_size(1024);

    let mut client = RunnerClient::start(project.path(), config).unwrap();

    assert!(matches!(
        client.call("model", None),
        Err(RunnerError::Frame(FrameError::TooLarge { .. }))
    ));
    assert_eq!(
        client.route_location("users_path"),
        Some(object(json!({ "path": "/users" })))
    );
    assert_eq!(
        client.route_location("posts_path"),
        Some(object(json!({ "path": "/posts" })))
    );

    client.shutdown();
}

#[test]
fn test_null_ready_frame_fails_initialization() {
    let project = FakeProject::new();
    let config = project.config("", &[frame(json!({ "result": null }))]);

    let err = RunnerClient::start(project.path(), config)
        .err()
        .expect("boot should fail");

    match err {
        RunnerError::Initialization { reason, .. } => {
            assert!(reason.contains("null result"), "reason: {}", reason);
        }
        other => panic!("Expected Initialization error, got {:?}", other),
    }
}

#[test]
fn test_stopped_right_after_shutdown_when_worker_exits() {
    let project = FakeProject::new();
    // Records exactly the shutdown frame, then exits.
    let shutdown_len = encode("shutdown", None).unwrap().len();
    let grace = Duration::from_secs(2);
    let config = project
        .config_with_recorder(
            ":",
            &[ready_frame()],
            &format!("head -c {} > \"$2\"", shutdown_len),
        )
        .with_shutdown_grace(grace);

    let mut client = RunnerClient::start(project.path(), config).unwrap();

    let started = Instant::now();
    client.shutdown();
    assert!(started.elapsed() < grace, "shutdown took {:?}", started.elapsed());
    assert!(client.stopped());
    assert_eq!(client.state(), ClientState::Stopped);

    assert_eq!(project.requests(), vec![Request::new("shutdown", None)]);
}
