use std::{
    io::Read,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 8 * 1024;
/// How long output is still forwarded once the child is gone.
const OUTPUT_GRACE: Duration = Duration::from_millis(250);

type Chunk = (OutputStream, Vec<u8>);

/// One external command with a hard wall-clock limit.
#[derive(Clone, Debug, TypedBuilder, Serialize, Deserialize)]
pub struct ProcessRequest {
    #[builder(setter(into))]
    pub name: String,
    /// Created when missing.
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    pub command: Vec<String>,
    /// `VAR=value` entries added to the inherited environment.
    #[builder(default)]
    #[serde(default)]
    pub env: Vec<String>,
    pub timeout: Duration,
    #[builder(default = true)]
    #[serde(default = "default_expect_success")]
    pub expect_success: bool,
}

fn default_expect_success() -> bool {
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    pub elapsed: Duration,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives process output as it is produced.
///
/// `write` is called on the thread running [`ProcessRunner::run`], one chunk at a time
/// and in order per stream. `finish` is called once before `run` returns.
pub trait OutputSink: Send + Sync {
    fn write(&self, stream: OutputStream, chunk: &[u8]);

    fn finish(&self) {}
}

/// Drops all output.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl OutputSink for DiscardSink {
    fn write(&self, _: OutputStream, _: &[u8]) {}
}

/// Keeps all output in memory.
#[derive(Debug, Default)]
pub struct CaptureSink {
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout.lock()).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr.lock()).into_owned()
    }
}

impl OutputSink for CaptureSink {
    fn write(&self, stream: OutputStream, chunk: &[u8]) {
        match stream {
            OutputStream::Stdout => self.stdout.lock().extend_from_slice(chunk),
            OutputStream::Stderr => self.stderr.lock().extend_from_slice(chunk),
        }
    }
}

/// Emits output line by line as tracing events prefixed with the process name.
#[derive(Debug)]
pub struct LogSink {
    prefix: String,
    pending: Mutex<[Vec<u8>; 2]>,
}

impl LogSink {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            pending: Mutex::new([Vec::new(), Vec::new()]),
        }
    }

    fn emit(&self, stream: OutputStream, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\r');
        match stream {
            OutputStream::Stdout => tracing::info!("[{}] {}", self.prefix, line),
            OutputStream::Stderr => tracing::warn!("[{}] {}", self.prefix, line),
        }
    }
}

impl OutputSink for LogSink {
    fn write(&self, stream: OutputStream, chunk: &[u8]) {
        let mut pending = self.pending.lock();
        let buf = &mut pending[stream as usize];
        buf.extend_from_slice(chunk);
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            self.emit(stream, &line[..line.len() - 1]);
        }
    }

    fn finish(&self) {
        let mut pending = self.pending.lock();
        let streams = [OutputStream::Stdout, OutputStream::Stderr];
        for (buf, stream) in pending.iter_mut().zip(streams) {
            if !buf.is_empty() {
                let rest = std::mem::take(buf);
                self.emit(stream, &rest);
            }
        }
    }
}

/// Runs external commands to completion or until their timeout.
///
/// Each command is started in its own process group. On timeout the whole group is
/// killed with `SIGKILL` and the child is reaped before [`Error::Timeout`] is returned;
/// after a normal exit any leftover group members are killed as well. The call blocks the
/// current thread.
///
/// Output is read by detached threads. A descendant that left the group (`setsid`) can
/// keep the pipes open past the child's exit; output is forwarded for a short grace
/// period after the child is reaped and the readers are then abandoned, so the deadline
/// holds regardless.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn run(&self, request: &ProcessRequest, sink: &dyn OutputSink) -> Result<ProcessOutcome> {
        let Some((program, args)) = request.command.split_first() else {
            return Err(Error::config(format!(
                "process '{}' has an empty command",
                request.name
            )));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = &request.work_dir {
            std::fs::create_dir_all(dir)?;
            cmd.current_dir(dir);
        }
        for entry in &request.env {
            let (key, value) = parse_env(entry)?;
            cmd.env(key, value);
        }

        tracing::debug!("Starting process '{}': {:?}", request.name, request.command);
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            Error::execution(format!("failed to launch process '{}'", request.name), e)
        })?;
        let pgid = child.id() as libc::pid_t;

        let (tx, rx) = channel::unbounded();
        let stdout = spawn_reader(&request.name, child.stdout.take(), OutputStream::Stdout, &tx);
        let readers = stdout.and_then(|()| {
            spawn_reader(&request.name, child.stderr.take(), OutputStream::Stderr, &tx)
        });
        drop(tx);
        if let Err(e) = readers {
            kill_group(pgid);
            let _ = child.wait();
            return Err(e);
        }

        let waited = wait_for_child(&mut child, started + request.timeout, &rx, sink);
        kill_group(pgid);
        let waited = match waited {
            Ok(Some(status)) => Ok(Some(status)),
            Ok(None) => child.wait().map(|_| None),
            Err(e) => {
                let _ = child.wait();
                Err(e)
            }
        };
        if !forward_until_closed(&rx, sink, Instant::now() + OUTPUT_GRACE) {
            tracing::warn!(
                "Output of process '{}' still open after exit, no longer reading it",
                request.name
            );
        }
        sink.finish();
        let elapsed = started.elapsed();

        let Some(status) = waited? else {
            tracing::warn!(
                "Process '{}' killed after {:?} (timeout {:?})",
                request.name,
                elapsed,
                request.timeout
            );
            return Err(Error::Timeout {
                name: request.name.clone(),
                timeout: request.timeout,
            });
        };

        tracing::debug!("Process '{}' exited with {} after {:?}", request.name, status, elapsed);
        if request.expect_success && !status.success() {
            return Err(Error::execution(
                format!("process '{}' failed", request.name),
                format!("{status}"),
            ));
        }
        Ok(ProcessOutcome {
            code: status.code(),
            elapsed,
        })
    }
}

fn parse_env(entry: &str) -> Result<(&str, &str)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(Error::config(format!("invalid env entry '{entry}', expected VAR=value"))),
    }
}

/// Waits for the child until `deadline`, forwarding output in the meantime.
fn wait_for_child(
    child: &mut Child,
    deadline: Instant,
    output: &Receiver<Chunk>,
    sink: &dyn OutputSink,
) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        let wait = POLL_INTERVAL.min(deadline - now);
        match output.recv_timeout(wait) {
            Ok((stream, chunk)) => sink.write(stream, &chunk),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(wait),
        }
    }
}

/// Forwards buffered output until every reader is done or `until` passes. Returns
/// whether all readers finished.
fn forward_until_closed(output: &Receiver<Chunk>, sink: &dyn OutputSink, until: Instant) -> bool {
    loop {
        match output.recv_deadline(until) {
            Ok((stream, chunk)) => sink.write(stream, &chunk),
            Err(RecvTimeoutError::Disconnected) => return true,
            Err(RecvTimeoutError::Timeout) => return false,
        }
    }
}

fn kill_group(pgid: libc::pid_t) {
    // ESRCH once every member has exited
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

fn spawn_reader<R>(
    name: &str,
    reader: Option<R>,
    stream: OutputStream,
    tx: &Sender<Chunk>,
) -> Result<()>
where
    R: Read + Send + 'static,
{
    let Some(reader) = reader else {
        return Ok(());
    };
    let tx = tx.clone();
    thread::Builder::new()
        .name(format!("{name}-{stream:?}").to_lowercase())
        .spawn(move || pump(reader, stream, &tx))
        .map(|_| ())
        .map_err(|e| Error::execution(format!("failed to read output of process '{name}'"), e))
}

fn pump(mut reader: impl Read, stream: OutputStream, tx: &Sender<Chunk>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                // the runner stopped listening
                if tx.send((stream, buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_entries_must_have_a_name() {
        assert_eq!(parse_env("A=1").unwrap(), ("A", "1"));
        assert_eq!(parse_env("A=x=y").unwrap(), ("A", "x=y"));
        assert_eq!(parse_env("A=").unwrap(), ("A", ""));
        assert!(parse_env("=1").is_err());
        assert!(parse_env("A").is_err());
    }

    #[test]
    fn log_sink_splits_lines_across_chunks() {
        let sink = LogSink::new("t");
        sink.write(OutputStream::Stdout, b"hel");
        sink.write(OutputStream::Stdout, b"lo\nwor");
        assert_eq!(sink.pending.lock()[0], b"wor");
        sink.finish();
        assert!(sink.pending.lock()[0].is_empty());
    }

    #[test]
    fn empty_command_is_configuration_error() {
        let req = ProcessRequest::builder()
            .name("empty")
            .command(vec![])
            .timeout(Duration::from_secs(1))
            .build();
        let err = ProcessRunner.run(&req, &DiscardSink).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
