//! Supervised child processes.
//!
//! A process is launched with piped stdio, fed its input, and drained by
//! two reader threads while the calling thread waits for exit or timeout.

use crate::env::Environment;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

/// Exit code text reported for a process that was killed after timing out.
pub const TIMED_OUT_EXIT: &str = "(did not exit; timedout; killed)";

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const INTERRUPT_GRACE: Duration = Duration::from_millis(200);
const DRAIN_AFTER_EXIT: Duration = Duration::from_secs(1);

/// What to launch and how.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    /// Applied on top of the inherited environment.
    pub env: Environment,
    /// Written to stdin followed by a newline; stdin is then closed.
    pub input: Option<String>,
    pub timeout: Duration,
}

/// Captured output and exit state of a finished process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Both streams, interleaved in arrival order.
    pub merged: String,
    pub exit_code: Option<i32>,
    /// Exit code as reported in results.
    pub exit_display: String,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
enum StreamEvent {
    Line(Stream, String),
    Eof(Stream),
}

/// Run a process to completion or until its timeout expires.
///
/// On timeout the process is interrupted, given a short grace period, and
/// then killed.
pub fn run_process(spec: &ProcessSpec) -> std::io::Result<ProcessOutput> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    cmd.current_dir(&spec.working_directory);
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    tracing::debug!(
        "starting {} {:?} in {}",
        spec.program.display(),
        spec.args,
        spec.working_directory.display()
    );
    let mut child = cmd.spawn()?;

    let (tx, rx) = mpsc::channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, Stream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, Stream::Stderr, tx.clone());
    }
    drop(tx);

    if let Some(mut stdin) = child.stdin.take() {
        let input = spec.input.as_deref().unwrap_or_default();
        // A process may exit without reading its input.
        if let Err(e) = stdin.write_all(format!("{input}\n").as_bytes()) {
            tracing::debug!("cannot write stdin of {}: {e}", spec.program.display());
        }
    }

    let mut collector = Collector::new();
    let start = Instant::now();
    let status = loop {
        collector.receive(&rx, POLL_INTERVAL);
        match child.try_wait()? {
            Some(status) => break Some(status),
            None if start.elapsed() > spec.timeout => break None,
            None => {}
        }
    };

    let mut output = match status {
        Some(status) => {
            collector.drain(&rx, DRAIN_AFTER_EXIT);
            collector.finish(status)
        }
        None => {
            tracing::warn!(
                "{} timed out after {}ms",
                spec.program.display(),
                spec.timeout.as_millis()
            );
            cancel(&mut child, &rx, &mut collector);
            collector.drain(&rx, DRAIN_AFTER_EXIT);
            let mut output = collector.into_output();
            output.timed_out = true;
            output.exit_display = TIMED_OUT_EXIT.to_string();
            output
        }
    };
    output.stdout.truncate(output.stdout.trim_end_matches('\n').len());
    output.stderr.truncate(output.stderr.trim_end_matches('\n').len());
    Ok(output)
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, stream: Stream, tx: Sender<StreamEvent>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']).to_string();
                    if tx.send(StreamEvent::Line(stream, line)).is_err() {
                        return;
                    }
                }
            }
        }
        let _ = tx.send(StreamEvent::Eof(stream));
    });
}

/// Interrupt, wait briefly, then kill.
///
/// The caller reports the process as timed out either way: exiting after
/// the interrupt still means it overran its timeout.
fn cancel(child: &mut Child, rx: &Receiver<StreamEvent>, collector: &mut Collector) {
    if interrupt(child) {
        let deadline = Instant::now() + INTERRUPT_GRACE;
        while Instant::now() < deadline {
            collector.receive(rx, POLL_INTERVAL);
            if let Ok(Some(status)) = child.try_wait() {
                tracing::debug!("process {} exited after interrupt: {status}", child.id());
                return;
            }
        }
    }
    if let Err(e) = child.kill() {
        tracing::debug!("kill failed: {e}");
    }
    let _ = child.wait();
}

#[cfg(unix)]
fn interrupt(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(child.id()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGINT) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("cannot interrupt process {pid}: {e}");
            false
        }
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) -> bool {
    false
}

struct Collector {
    stdout: String,
    stderr: String,
    merged: String,
    open: [bool; 2],
}

impl Collector {
    fn new() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            merged: String::new(),
            open: [true, true],
        }
    }

    fn is_open(&self) -> bool {
        self.open.iter().any(|o| *o)
    }

    fn push(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Line(stream, line) => {
                let buffer = match stream {
                    Stream::Stdout => &mut self.stdout,
                    Stream::Stderr => &mut self.stderr,
                };
                buffer.push_str(&line);
                buffer.push('\n');
                self.merged.push_str(&line);
                self.merged.push('\n');
            }
            StreamEvent::Eof(stream) => self.open[stream as usize] = false,
        }
    }

    /// Take events for up to `wait`.
    fn receive(&mut self, rx: &Receiver<StreamEvent>, wait: Duration) {
        match rx.recv_timeout(wait) {
            Ok(event) => self.push(event),
            Err(RecvTimeoutError::Timeout) => return,
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(wait);
                return;
            }
        }
        while let Ok(event) = rx.try_recv() {
            self.push(event);
        }
    }

    /// Take events until both streams end or `limit` passes.
    fn drain(&mut self, rx: &Receiver<StreamEvent>, limit: Duration) {
        let deadline = Instant::now() + limit;
        while self.is_open() {
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!("output streams still open; continuing without them");
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(event) => self.push(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn finish(self, status: ExitStatus) -> ProcessOutput {
        let exit_code = status.code();
        let exit_display = exit_display(status);
        ProcessOutput {
            exit_code,
            exit_display,
            ..self.into_output()
        }
    }

    fn into_output(self) -> ProcessOutput {
        ProcessOutput {
            stdout: self.stdout,
            stderr: self.stderr,
            merged: self.merged,
            ..ProcessOutput::default()
        }
    }
}

fn exit_display(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return code.to_string();
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("(killed by signal {signal})");
        }
    }
    "(unknown)".to_string()
}
