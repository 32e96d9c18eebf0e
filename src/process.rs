//! External command execution with timeouts and cancellation.
//!
//! The media toolchain (ffmpeg/ffprobe) and the vocal separator are invoked
//! as subprocesses. Long-running invocations poll the pipeline cancellation
//! token so Ctrl+C kills the child promptly instead of waiting for it.

use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{DubError, DubResult};
use crate::runner::CancellationToken;

#[must_use]
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

pub fn run_command(program: &str, args: &[String], cwd: Option<&Path>) -> DubResult<Output> {
    run_command_with_timeout(program, args, cwd, None)
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Option<Duration>,
) -> DubResult<Output> {
    run_supervised(program, args, cwd, timeout, None)
}

/// Run a subprocess, polling `token.checkpoint()` every iteration. On
/// cancellation the child is killed and the `Cancelled` error propagates.
/// The optional hard timeout is still honored as a safety net.
pub fn run_command_cancellable(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    token: &CancellationToken,
    hard_timeout: Option<Duration>,
) -> DubResult<Output> {
    run_supervised(program, args, cwd, hard_timeout, Some(token))
}

fn run_supervised(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Option<Duration>,
    token: Option<&CancellationToken>,
) -> DubResult<Output> {
    if !command_exists(program) {
        return Err(DubError::CommandMissing {
            command: program.to_owned(),
        });
    }

    let rendered = format!("{} {}", program, args.join(" "));
    let mut command = Command::new(program);
    command.args(args);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let mut child = command.spawn()?;
    let started_at = Instant::now();

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");

    let (stdout_tx, stdout_rx) = std::sync::mpsc::channel();
    let (stderr_tx, stderr_rx) = std::sync::mpsc::channel();

    thread::spawn(move || {
        use std::io::Read;
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf);
        let _ = stdout_tx.send(buf);
    });
    thread::spawn(move || {
        use std::io::Read;
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf);
        let _ = stderr_tx.send(buf);
    });

    loop {
        if let Some(status) = child.try_wait()? {
            let stdout = stdout_rx
                .recv_timeout(Duration::from_millis(100))
                .unwrap_or_default();
            let stderr = stderr_rx
                .recv_timeout(Duration::from_millis(100))
                .unwrap_or_default();
            let output = Output {
                status,
                stdout,
                stderr,
            };
            return validate_output(&rendered, output);
        }

        if let Some(tok) = token {
            if let Err(err) = tok.checkpoint() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        }

        if let Some(limit) = timeout {
            if started_at.elapsed() >= limit {
                let _ = child.kill();
                let _ = child.wait();
                return Err(DubError::CommandTimedOut {
                    command: rendered,
                    timeout_ms: limit.as_millis().try_into().unwrap_or(u64::MAX),
                });
            }
        }

        thread::sleep(Duration::from_millis(25));
    }
}

fn validate_output(rendered: &str, output: Output) -> DubResult<Output> {
    if output.status.success() {
        return Ok(output);
    }
    let status = output.status.code().unwrap_or(-1);
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    Err(DubError::from_command_failure(
        rendered.to_owned(),
        status,
        stderr,
    ))
}
