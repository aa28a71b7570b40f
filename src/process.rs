//! Supervised execution of the external builder.
//!
//! [`Cmd`] spawns exactly one child with stdout and stderr piped, collects
//! both streams into one combined transcript (interleaved in arrival order)
//! and polls a [`CancelToken`] while it waits. On cancellation the child and
//! everything in its process group is killed and the call fails with
//! [`ConvertError::Cancelled`].
//!
//! Output is never interpreted here; callers parse it.

use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{ConvertError, ConvertResult};

/// How long to block on the output channel before re-checking cancellation.
const OUTPUT_POLL: Duration = Duration::from_millis(100);

/// How often to poll for child exit after its streams have closed.
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Output still accepted after the child exits while a descendant holds its
/// pipes open.
const EXIT_DRAIN: Duration = Duration::from_millis(500);

/// Captured result of a finished child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Combined stdout and stderr, one line per output line.
    pub output: String,
    /// Exit code, or `-1` when the child was terminated by a signal.
    pub exit_code: i32,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Builder for one supervised child process.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: PathBuf,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
}

impl Cmd {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Human-readable command line, for logs.
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Run to completion and return the combined output and exit code.
    ///
    /// A nonzero exit is not an error here; the caller decides.
    pub fn run(&self, cancel: &CancelToken) -> ConvertResult<ProcessOutput> {
        self.supervise(None, cancel)
    }

    /// Run to completion, handing every output line to `on_line` as it arrives.
    ///
    /// A nonzero exit fails with [`ConvertError::BuilderExitNonzero`] carrying
    /// the combined output.
    pub fn run_streaming<F>(&self, mut on_line: F, cancel: &CancelToken) -> ConvertResult<ProcessOutput>
    where
        F: FnMut(&str),
    {
        let callback: &mut dyn FnMut(&str) = &mut on_line;
        let result = self.supervise(Some(callback), cancel)?;
        if !result.success() {
            return Err(ConvertError::BuilderExitNonzero {
                code: result.exit_code,
                output: result.output,
            });
        }
        Ok(result)
    }

    fn supervise(
        &self,
        mut on_line: Option<&mut dyn FnMut(&str)>,
        cancel: &CancelToken,
    ) -> ConvertResult<ProcessOutput> {
        cancel.check()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group so cancellation can take down grandchildren.
            cmd.process_group(0);
        }

        debug!("spawning: {}", self.display());
        let mut child = cmd.spawn().map_err(|source| ConvertError::BuilderSpawn {
            program: self.program.display().to_string(),
            source,
        })?;

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx.clone());
        }
        drop(tx);

        let mut combined = String::new();
        let mut exited = None;
        loop {
            if cancel.is_cancelled() {
                terminate(&mut child);
                return Err(ConvertError::Cancelled);
            }
            match rx.recv_timeout(OUTPUT_POLL) {
                Ok(line) => deliver(&line, &mut on_line, &mut combined),
                Err(RecvTimeoutError::Timeout) => {
                    // The child may be gone while a descendant keeps the pipes open.
                    if let Some(status) = child.try_wait()? {
                        drain_until(&rx, Instant::now() + EXIT_DRAIN, &mut on_line, &mut combined);
                        kill_group(&child);
                        exited = Some(status);
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = match exited {
            Some(status) => status,
            None => wait_cancellable(&mut child, cancel)?,
        };
        let exit_code = status.code().unwrap_or(-1);
        debug!("{} exited with code {}", self.program.display(), exit_code);

        Ok(ProcessOutput {
            output: combined,
            exit_code,
        })
    }
}

/// Forward every line of `stream` to `tx`, splitting on `\n` and `\r`.
///
/// Builders redraw percent counters with carriage returns; each redraw is
/// delivered as its own line.
fn spawn_line_reader<R: Read + Send + 'static>(stream: R, tx: Sender<String>) {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for chunk in reader.split(b'\n').map_while(Result::ok) {
            let text = String::from_utf8_lossy(&chunk);
            for part in text.split('\r') {
                let line = part.trim_end();
                if line.is_empty() {
                    continue;
                }
                if tx.send(line.to_string()).is_err() {
                    return;
                }
            }
        }
    });
}

fn deliver(line: &str, on_line: &mut Option<&mut dyn FnMut(&str)>, combined: &mut String) {
    if let Some(callback) = on_line.as_mut() {
        callback(line);
    }
    combined.push_str(line);
    combined.push('\n');
}

/// Collect whatever output arrives before `deadline` or until the pipes close.
fn drain_until(
    rx: &Receiver<String>,
    deadline: Instant,
    on_line: &mut Option<&mut dyn FnMut(&str)>,
    combined: &mut String,
) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        match rx.recv_timeout(deadline - now) {
            Ok(line) => deliver(&line, on_line, combined),
            Err(_) => return,
        }
    }
}

fn wait_cancellable(child: &mut Child, cancel: &CancelToken) -> ConvertResult<ExitStatus> {
    loop {
        if cancel.is_cancelled() {
            terminate(child);
            return Err(ConvertError::Cancelled);
        }
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        std::thread::sleep(EXIT_POLL);
    }
}

/// Kill the child and its process group, then reap it.
fn terminate(child: &mut Child) {
    warn!("terminating builder process {}", child.id());
    kill_group(child);
    let _ = child.kill();
    let _ = child.wait();
}

/// SIGKILL every process left in the child's process group.
fn kill_group(child: &Child) {
    #[cfg(unix)]
    {
        let pgid = child.id() as libc::pid_t;
        // SAFETY: signalling a process group we created; no memory is touched.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}
