//! Worker process supervision.
//!
//! Spawns the worker with all three stdio streams piped, detached into its
//! own session so that terminal signals aimed at the host (Ctrl-C, SIGHUP on
//! terminal close) are not delivered to the worker as well. Liveness checks
//! never block; termination is forceful and idempotent. Stderr is read on a
//! background thread.

use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Poll interval while waiting for the worker to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The pipes attached to a freshly spawned worker.
pub struct WorkerStreams {
    pub stdin: ChildStdin,
    pub stdout: BufReader<ChildStdout>,
    pub stderr: ChildStderr,
}

/// Handle to the spawned worker used for liveness checks and termination.
pub struct WorkerProcess {
    child: Child,
    killed: bool,
}

impl WorkerProcess {
    /// Spawn `command` in `work_dir` with piped stdio and the caller's environment.
    ///
    /// A relative program path containing a separator (e.g. `bin/rails`) is
    /// resolved against `work_dir`; bare names go through `PATH`.
    pub fn spawn(command: &[String], work_dir: &Path) -> io::Result<(Self, WorkerStreams)> {
        let (program, args) = command.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "worker command is empty")
        })?;
        let program = resolve_program(program, work_dir);

        info!("Starting Rails runner: {} {}", program.display(), args.join(" "));

        let mut cmd = Command::new(&program);
        cmd.args(args)
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate(&mut cmd);

        let mut child = cmd.spawn()?;

        let streams = match take_streams(&mut child) {
            Ok(streams) => streams,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        debug!("Rails runner spawned with pid {}", child.id());

        Ok((
            Self {
                child,
                killed: false,
            },
            streams,
        ))
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking liveness check. Reaps the child if it has exited.
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("Rails runner exited: {}", status);
                false
            }
            Err(e) => {
                warn!("Error checking Rails runner status: {}", e);
                false
            }
        }
    }

    /// Poll until the worker exits or `timeout` elapses. Returns true if it exited.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if !self.is_alive() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(EXIT_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Forcefully kill the worker and reap it.
    ///
    /// `Child::kill` sends SIGKILL on Unix and calls `TerminateProcess` on
    /// Windows. Safe on an already-dead process; only the first call signals.
    pub fn terminate(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;

        if !self.is_alive() {
            return;
        }

        warn!("Killing Rails runner (pid {})", self.child.id());
        if let Err(e) = self.child.kill() {
            debug!("Kill failed (worker likely already exited): {}", e);
        }
        let _ = self.child.wait();
    }
}

/// Background reader over the worker's stderr.
///
/// A dedicated thread empties the pipe as soon as the worker writes to it, so
/// a chatty worker never blocks on a full stderr buffer while the client is
/// waiting on stdout. Keeps a bounded tail of everything read so that
/// failures can be reported together with what the worker printed before
/// dying.
pub struct StderrCapture {
    shared: Arc<(Mutex<CaptureBuffer>, Condvar)>,
    closed: bool,
}

/// State shared with the reader thread.
#[derive(Default)]
struct CaptureBuffer {
    /// Text not yet handed out by `drain`.
    pending: String,
    /// Everything read recently, for failure reports.
    tail: String,
    limit: usize,
    /// The worker closed its end of the pipe.
    eof: bool,
}

impl CaptureBuffer {
    fn push(&mut self, text: &str) {
        push_bounded(&mut self.pending, text, self.limit);
        push_bounded(&mut self.tail, text, self.limit);
    }
}

impl StderrCapture {
    pub fn new(stream: ChildStderr, limit: usize) -> Self {
        let shared = Arc::new((
            Mutex::new(CaptureBuffer {
                limit,
                ..CaptureBuffer::default()
            }),
            Condvar::new(),
        ));
        let shared_clone = Arc::clone(&shared);

        if let Err(e) = thread::Builder::new()
            .name("rails-runner-stderr".to_string())
            .spawn(move || Self::reader_thread(stream, shared_clone))
        {
            warn!("Worker stderr capture disabled: {}", e);
            Self::mark_eof(&shared);
        }

        Self {
            shared,
            closed: false,
        }
    }

    /// Reader thread that copies worker stderr into the shared buffer until EOF.
    fn reader_thread(mut stream: ChildStderr, shared: Arc<(Mutex<CaptureBuffer>, Condvar)>) {
        let mut buf = [0u8; 4096];

        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]);
                    lock(&shared.0).push(&text);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Failed to read worker stderr: {}", e);
                    break;
                }
            }
        }

        Self::mark_eof(&shared);
    }

    fn mark_eof(shared: &(Mutex<CaptureBuffer>, Condvar)) {
        lock(&shared.0).eof = true;
        shared.1.notify_all();
    }

    /// Hand back whatever the worker printed since the last call. Never blocks
    /// on the pipe.
    pub fn drain(&mut self) -> String {
        if self.closed {
            return String::new();
        }
        std::mem::take(&mut lock(&self.shared.0).pending)
    }

    /// Hand back and clear the accumulated tail.
    pub fn take_tail(&mut self) -> String {
        let mut buffer = lock(&self.shared.0);
        buffer.pending.clear();
        std::mem::take(&mut buffer.tail)
    }

    /// Wait until the worker's stderr reaches EOF or `timeout` elapses.
    /// Returns true on EOF.
    pub fn wait_for_eof(&self, timeout: Duration) -> bool {
        let (buffer, changed) = &*self.shared;
        let guard = lock(buffer);
        let (guard, _) = changed
            .wait_timeout_while(guard, timeout, |b| !b.eof)
            .unwrap_or_else(PoisonError::into_inner);
        guard.eof
    }

    /// Stop handing out output. The reader thread exits on its own at EOF.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Lock the shared buffer, ignoring poisoning.
fn lock(buffer: &Mutex<CaptureBuffer>) -> MutexGuard<'_, CaptureBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Append `text`, dropping the oldest bytes beyond `limit` on a char boundary.
fn push_bounded(buffer: &mut String, text: &str, limit: usize) {
    buffer.push_str(text);

    if buffer.len() > limit {
        let mut cut = buffer.len() - limit;
        while !buffer.is_char_boundary(cut) {
            cut += 1;
        }
        buffer.drain(..cut);
    }
}

fn resolve_program(program: &str, work_dir: &Path) -> PathBuf {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        work_dir.join(path)
    } else {
        path.to_path_buf()
    }
}

fn take_streams(child: &mut Child) -> io::Result<WorkerStreams> {
    let missing = |name: &str| {
        io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("worker {} not captured", name),
        )
    };

    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    Ok(WorkerStreams {
        stdin,
        stdout: BufReader::new(stdout),
        stderr,
    })
}

/// Detach the child into a new session (and therefore a new process group).
///
/// Failure is ignored: the worker then simply shares the parent's group.
#[cfg(unix)]
fn isolate(cmd: &mut Command) {
    use nix::unistd::{setpgid, setsid, Pid};
    use std::os::unix::process::CommandExt;

    // Safety: `pre_exec` runs in the child after `fork` and before `exec`.
    // setsid/setpgid are async-signal-safe and the closure does not allocate.
    unsafe {
        cmd.pre_exec(|| {
            if setsid().is_err() {
                let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn isolate(_cmd: &mut Command) {}
