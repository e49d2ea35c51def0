//! Helpers for running child processes under a deadline with bounded output.
//!
//! Stdout and stderr share one anonymous capture file, so the captured text
//! keeps the order in which the child wrote it and a chatty child can never
//! block on a full pipe.

use std::io::{Read, Seek, SeekFrom};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::budget::CancelToken;

/// How often a blocking wait is checked for cancellation.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why the wait for a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Exited,
    TimedOut,
    Cancelled,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    /// Combined stdout and stderr, at most `output_limit_bytes` long.
    pub output: Vec<u8>,
    /// Bytes dropped past the limit.
    pub truncated: usize,
    pub stop: StopReason,
}

impl CommandOutput {
    pub fn truncated_notice(&self, label: &str) -> String {
        if self.truncated > 0 {
            format!("\n[{label} output truncated {} bytes]\n", self.truncated)
        } else {
            String::new()
        }
    }

    /// Output as lossy UTF-8, with a truncation notice when bytes were dropped.
    pub fn text(&self, label: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.output).into_owned();
        text.push_str(&self.truncated_notice(label));
        text
    }
}

/// Run a command until it exits, `timeout` elapses, or `cancel` fires.
///
/// The child is placed in its own process group. On timeout or cancellation
/// the whole group is killed and the child reaped before returning; after a
/// natural exit, stray background members of the group are killed too.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes = output_limit_bytes))]
pub fn run_command_with_deadline(
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancelToken,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut capture = tempfile::tempfile().context("create output capture file")?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(
            capture.try_clone().context("clone capture for stdout")?,
        ))
        .stderr(Stdio::from(
            capture.try_clone().context("clone capture for stderr")?,
        ));
    isolate_process_group(&mut cmd);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    // The parent's copies of the capture handles went into `cmd`; drop it so
    // only the child holds them.
    drop(cmd);

    let started = Instant::now();
    let (status, stop) = loop {
        let remaining = timeout.saturating_sub(started.elapsed());
        if let Some(status) = child
            .wait_timeout(remaining.min(POLL_INTERVAL))
            .context("wait for command")?
        {
            break (status, StopReason::Exited);
        }

        let reason = if cancel.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if started.elapsed() >= timeout {
            Some(StopReason::TimedOut)
        } else {
            None
        };
        if let Some(reason) = reason {
            warn!(
                ?reason,
                timeout_ms = timeout.as_millis() as u64,
                "stopping command, killing process group"
            );
            kill_process_group(&mut child).context("kill command")?;
            let status = child.wait().context("wait command after kill")?;
            break (status, reason);
        }
    };

    if stop == StopReason::Exited {
        // Background jobs the script left behind must not outlive the run.
        // The leader is already reaped. While any member survives, its pid
        // stays reserved as the group id. Once the group is empty, the pid
        // could only collide if it were reissued as another group's id
        // between the reap and this call. That risk is accepted.
        if let Err(err) = kill_process_group(&mut child) {
            debug!(err = %err, "no stray processes to reap");
        }
    }

    capture
        .seek(SeekFrom::Start(0))
        .context("rewind output capture")?;
    let (output, truncated) = read_stream_limited(&mut capture, output_limit_bytes)?;

    if truncated > 0 {
        warn!(truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), ?stop, "command finished");
    Ok(CommandOutput {
        status,
        output,
        truncated,
        stop,
    })
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

/// SIGKILL every process in the child's group. A group that is already gone
/// is not an error.
#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).context("child pid out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => {
            warn!(%errno, pgid, "killpg failed, killing child only");
            child.kill().context("kill child")
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> Result<()> {
    match child.kill() {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e).context("kill child"),
    }
}

fn read_stream_limited<R: Read>(reader: &mut R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs::File;
    use std::io::Write;

    use super::*;

    fn scratch_file(contents: &[u8]) -> File {
        let mut file = tempfile::tempfile().expect("tempfile");
        file.write_all(contents).expect("write");
        file.seek(SeekFrom::Start(0)).expect("seek");
        file
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn read_stream_limited_counts_dropped_bytes() {
        let mut file = scratch_file(b"0123456789");
        let (kept, truncated) = read_stream_limited(&mut file, 4).expect("read");
        assert_eq!(kept, b"0123");
        assert_eq!(truncated, 6);
    }

    #[test]
    fn captures_stdout_and_stderr_in_order() {
        let out = run_command_with_deadline(
            sh("echo one; echo two >&2; echo three"),
            Duration::from_secs(5),
            &CancelToken::new(),
            1000,
        )
        .expect("run");
        assert_eq!(out.stop, StopReason::Exited);
        assert!(out.status.success());
        assert_eq!(out.text("test"), "one\ntwo\nthree\n");
    }

    #[test]
    fn reports_non_zero_exit() {
        let out = run_command_with_deadline(
            sh("exit 3"),
            Duration::from_secs(5),
            &CancelToken::new(),
            1000,
        )
        .expect("run");
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stop, StopReason::Exited);
    }

    #[test]
    fn kills_on_timeout() {
        let started = Instant::now();
        let out = run_command_with_deadline(
            sh("echo before; sleep 10; echo after"),
            Duration::from_millis(200),
            &CancelToken::new(),
            1000,
        )
        .expect("run");
        assert_eq!(out.stop, StopReason::TimedOut);
        assert!(!out.status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(out.text("test"), "before\n");
    }

    #[test]
    fn kills_on_cancel() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            trigger.cancel();
        });
        let started = Instant::now();
        let out = run_command_with_deadline(sh("sleep 10"), Duration::from_secs(30), &cancel, 1000)
            .expect("run");
        handle.join().expect("join");
        assert_eq!(out.stop, StopReason::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn truncates_long_output() {
        let out = run_command_with_deadline(
            sh("i=0; while [ $i -lt 100 ]; do echo 0123456789; i=$((i+1)); done"),
            Duration::from_secs(5),
            &CancelToken::new(),
            50,
        )
        .expect("run");
        assert_eq!(out.output.len(), 50);
        assert_eq!(out.truncated, 1100 - 50);
        assert!(out.text("test").contains("[test output truncated 1050 bytes]"));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_command_with_deadline(
            Command::new("/nonexistent/shell"),
            Duration::from_secs(1),
            &CancelToken::new(),
            100,
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
