//! Process runner: launch one external command under a wall-clock budget.
//!
//! The child is placed in its own process group so that a timeout reaches the
//! whole tree (assistant CLIs and git hooks spawn helpers of their own).
//! Escalation is terminate, then kill once the grace window has passed.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::RunnerError;
use crate::process::output::{MAX_OUTPUT_SIZE, OutputSink, OutputStream, truncate_output};
use crate::process::step::{StepKind, StepResult};

/// How long to keep reading pipes after the process itself is gone.
const DRAIN_WINDOW: Duration = Duration::from_secs(2);

/// Longest command line shown in logs and journals.
const DISPLAY_LIMIT: usize = 160;

/// Stand-in deadline for budgets too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// One external command to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Variables added on top of the inherited environment.
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Printable command line, shell-quoted where needed and capped in length.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
                line.push('\'');
                line.push_str(&arg.replace('\'', "'\\''"));
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        if line.chars().count() > DISPLAY_LIMIT {
            let head: String = line.chars().take(DISPLAY_LIMIT).collect();
            format!("{head}...")
        } else {
            line
        }
    }
}

/// Executes external commands.
///
/// Production uses [`TokioProcessRunner`]; tests substitute scripted runners.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `spec` to completion or timeout, streaming output lines to `sink`.
    ///
    /// Nonzero exits and timeouts are reported inside the `StepResult`; an
    /// `Err` means the process could not be started or supervised at all.
    async fn run(&self, spec: &CommandSpec, sink: &dyn OutputSink) -> Result<StepResult, RunnerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Within budget.
    Running,
    /// Exited within budget; collecting what is left in the pipes.
    Draining,
    /// Budget exceeded, terminate signal sent.
    Terminating,
    /// Grace window exceeded, kill signal sent.
    Killed,
}

/// Runner backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    grace: Duration,
    max_output: usize,
}

impl TokioProcessRunner {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            max_output: MAX_OUTPUT_SIZE,
        }
    }

    /// Cap the captured size of each stream.
    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, spec: &CommandSpec, sink: &dyn OutputSink) -> Result<StepResult, RunnerError> {
        let started = Instant::now();
        let command_line = spec.display();

        // Spawning into a missing directory also fails with `NotFound`;
        // report it separately so it is not mistaken for a missing program.
        if !spec.working_dir.is_dir() {
            return Err(RunnerError::MissingWorkingDir {
                path: spec.working_dir.clone(),
            });
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();
        debug!(command = %command_line, pid, timeout = ?spec.timeout, "Spawned process");

        let mut stdout = child.stdout.take().map(BufReader::new);
        let mut stderr = child.stderr.take().map(BufReader::new);
        let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());
        let (mut captured_out, mut captured_err) = (String::new(), String::new());

        let mut status: Option<ExitStatus> = None;
        let mut phase = Phase::Running;
        let mut deadline = deadline_after(started, spec.timeout);

        loop {
            let stdout_open = stdout.is_some();
            let stderr_open = stderr.is_some();
            if status.is_some() && !stdout_open && !stderr_open {
                break;
            }

            tokio::select! {
                read = read_line(&mut stdout, &mut out_buf), if stdout_open => match read {
                    Ok(Some(line)) => {
                        sink.line(OutputStream::Stdout, &line);
                        captured_out.push_str(&line);
                        captured_out.push('\n');
                    }
                    Ok(None) => stdout = None,
                    Err(e) => {
                        debug!(command = %command_line, error = %e, "stdout read failed");
                        stdout = None;
                    }
                },
                read = read_line(&mut stderr, &mut err_buf), if stderr_open => match read {
                    Ok(Some(line)) => {
                        sink.line(OutputStream::Stderr, &line);
                        captured_err.push_str(&line);
                        captured_err.push('\n');
                    }
                    Ok(None) => stderr = None,
                    Err(e) => {
                        debug!(command = %command_line, error = %e, "stderr read failed");
                        stderr = None;
                    }
                },
                waited = child.wait(), if status.is_none() => {
                    let exit = waited.map_err(|source| RunnerError::Wait {
                        program: spec.program.clone(),
                        source,
                    })?;
                    status = Some(exit);
                    if phase == Phase::Running {
                        phase = Phase::Draining;
                        deadline = deadline.min(Instant::now() + DRAIN_WINDOW);
                    }
                },
                _ = tokio::time::sleep_until(deadline) => match phase {
                    Phase::Running => {
                        warn!(
                            command = %command_line,
                            timeout = ?spec.timeout,
                            grace = ?self.grace,
                            "Process exceeded its budget; sending terminate"
                        );
                        terminate(&mut child, pid);
                        phase = Phase::Terminating;
                        deadline = deadline_after(Instant::now(), self.grace);
                    }
                    Phase::Terminating => {
                        warn!(command = %command_line, "Process ignored terminate; killing");
                        force_kill(&mut child, pid);
                        phase = Phase::Killed;
                        deadline = Instant::now() + DRAIN_WINDOW;
                    }
                    Phase::Draining => {
                        debug!(command = %command_line, "Pipes still open after exit; killing process group");
                        force_kill(&mut child, pid);
                        break;
                    }
                    Phase::Killed => break,
                },
            }
        }

        let flushed = stdout.is_none() && stderr.is_none();
        let kind = match phase {
            Phase::Terminating => StepKind::TimedOut {
                after: spec.timeout,
                forced: false,
            },
            Phase::Killed => StepKind::TimedOut {
                after: spec.timeout,
                forced: true,
            },
            Phase::Running | Phase::Draining => classify_status(status),
        };

        let elapsed = started.elapsed();
        info!(
            command = %command_line,
            kind = kind.label(),
            flushed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Process finished"
        );

        Ok(StepResult {
            command: command_line,
            kind,
            stdout: truncate_output(&captured_out, self.max_output),
            stderr: truncate_output(&captured_err, self.max_output),
            flushed,
            elapsed,
        })
    }
}

/// Read one line, tolerating invalid UTF-8.
///
/// Bytes read before a cancelled call stay in `buf` and are completed by the
/// next call, which keeps this usable as a `select!` branch.
async fn read_line<R>(reader: &mut Option<R>, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(reader) = reader.as_mut() else {
        return Ok(None);
    };
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 && buf.is_empty() {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf)
        .trim_end_matches(['\r', '\n'])
        .to_string();
    buf.clear();
    Ok(Some(line))
}

/// `now + budget`, or a far-off instant when that would overflow.
fn deadline_after(now: Instant, budget: Duration) -> Instant {
    now.checked_add(budget).unwrap_or_else(|| now + FAR_FUTURE)
}

fn classify_status(status: Option<ExitStatus>) -> StepKind {
    match status {
        Some(s) if s.success() => StepKind::Success,
        Some(s) => StepKind::Failed {
            exit_code: exit_code_of(s),
        },
        None => StepKind::Failed { exit_code: -1 },
    }
}

/// Exit code, or 128 + signal number for signal deaths.
fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) -> Result<(), RunnerError> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return Ok(());
    };
    let raw = i32::try_from(pid).map_err(|_| RunnerError::Signal {
        pid,
        reason: "pid out of range".into(),
    })?;
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(RunnerError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(unix)]
fn terminate(_child: &mut Child, pid: Option<u32>) {
    if let Err(e) = signal_group(pid, nix::sys::signal::Signal::SIGTERM) {
        warn!(error = %e, "Failed to send terminate");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "Failed to stop process");
    }
}

fn force_kill(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Err(e) = signal_group(pid, nix::sys::signal::Signal::SIGKILL) {
        warn!(error = %e, "Failed to kill process group");
    }
    #[cfg(not(unix))]
    let _ = pid;
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "start_kill after exit");
    }
}
