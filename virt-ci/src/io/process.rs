//! Child processes with a hard timeout and bounded output capture.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long reader threads may keep draining after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Exited on its own with status zero.
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

/// Run a command with a timeout, reading stdout/stderr on separate threads so
/// a chatty child cannot deadlock on a full pipe.
///
/// Bytes past `output_limit_bytes` are drained and counted but not kept. The
/// child leads its own process group; on timeout the whole group is killed
/// and whatever it wrote so far is returned with `timed_out` set. Readers get
/// [`DRAIN_GRACE`] after the child is reaped; a descendant that escaped the
/// group and still holds a pipe cannot stall the caller past that.
/// Spawn and wait failures are errors.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_command(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_reader = StreamReader::spawn(stdout, output_limit_bytes);
    let stderr_reader = StreamReader::spawn(stderr, output_limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            if let Err(err) = kill_process_group(&child) {
                warn!(err = %format!("{err:#}"), "group kill failed, killing child only");
                child.kill().context("kill command")?;
            }
            child.wait().context("wait command after kill")?
        }
    };
    let elapsed = started.elapsed();

    let deadline = Instant::now() + DRAIN_GRACE;
    let (stdout, stdout_truncated) = stdout_reader.finish(deadline).context("join stdout")?;
    let (stderr, stderr_truncated) = stderr_reader.finish(deadline).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(
        exit_code = ?status.code(),
        timed_out,
        elapsed_ms = elapsed.as_millis() as u64,
        "command finished"
    );
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

/// SIGKILL the process group led by `child`. The child is not reaped yet, so
/// its pid still names the group.
#[allow(unsafe_code)]
fn kill_process_group(child: &Child) -> Result<()> {
    let pgid = libc::pid_t::try_from(child.id()).context("child pid out of range")?;
    // SAFETY: killpg only sends a signal and touches no memory of ours.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("kill process group");
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: usize,
}

/// One output stream drained on its own thread into a shared buffer, so the
/// bytes read so far survive an abandoned reader.
struct StreamReader {
    capture: Arc<Mutex<Capture>>,
    handle: thread::JoinHandle<Result<()>>,
}

impl StreamReader {
    fn spawn<R: Read + Send + 'static>(reader: R, limit: usize) -> Self {
        let capture = Arc::new(Mutex::new(Capture::default()));
        let sink = Arc::clone(&capture);
        let handle = thread::spawn(move || read_stream_limited(reader, limit, &sink));
        Self { capture, handle }
    }

    /// Wait for EOF until `deadline`. A stray process still holding the pipe
    /// open past it only costs the bytes it has not written yet.
    fn finish(self, deadline: Instant) -> Result<(Vec<u8>, usize)> {
        let Self { capture, handle } = self;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("output pipe still held open after exit, abandoning reader");
                return take_capture(&capture);
            }
            thread::sleep(Duration::from_millis(10));
        }
        match handle.join() {
            Ok(result) => result?,
            Err(_) => return Err(anyhow!("output reader thread panicked")),
        }
        take_capture(&capture)
    }
}

fn take_capture(capture: &Mutex<Capture>) -> Result<(Vec<u8>, usize)> {
    let mut guard = capture.lock().map_err(|_| anyhow!("output buffer poisoned"))?;
    let taken = std::mem::take(&mut *guard);
    Ok((taken.bytes, taken.truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize, sink: &Mutex<Capture>) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut capture = sink.lock().map_err(|_| anyhow!("output buffer poisoned"))?;
        let keep = n.min(limit.saturating_sub(capture.bytes.len()));
        capture.bytes.extend_from_slice(&chunk[..keep]);
        capture.truncated += n - keep;
    }
}
