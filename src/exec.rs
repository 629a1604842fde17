//! Runs the renderer subprocess once and assembles a verdict.
//!
//! Spawns the renderer as its own process group leader so a timeout or
//! stop can take down any grandchildren it spawns, pumps its stdout (and
//! stderr, unless merged) through coalescing readers, and folds whatever
//! went wrong (kill reason, wait error, output overflow, nonzero exit,
//! reader fault, missing artifact) into a single `RenderError` by the
//! precedence the error taxonomy defines.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RenderError;
use crate::protocol::{Format, Stream};
use crate::reader::{spawn_reader, ReaderOutcome, MAX_SIZE};
use crate::stopper::Stopper;
use crate::timer::Timer;

pub struct ExecSpec<'a> {
    pub renderer_bin: &'a str,
    pub workdir: &'a Path,
    pub mainname: &'a str,
    pub format: Format,
    pub stderr_redir: bool,
    pub verbosity: u8,
}

pub struct ExecOutcome {
    pub artifact: Option<Vec<u8>>,
    pub error: Option<RenderError>,
}

/// Kills the entire process group on drop, not just the leader PID —
/// `kill_on_drop` alone would leave grandchildren the renderer spawns as
/// orphans.
struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        kill_process_group(self.pid);
    }
}

fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

fn kill_reason(timer: &Timer) -> RenderError {
    match timer.current_duration() {
        Some(secs) if secs > 0.0 => RenderError::TimeLimit { secs },
        _ => RenderError::Stopped,
    }
}

fn verbosity_flag(verbosity: u8) -> Option<&'static str> {
    match verbosity {
        0 => None,
        1 => Some("-v"),
        2 => Some("-vv"),
        _ => Some("-vvv"),
    }
}

pub async fn execute(
    spec: ExecSpec<'_>,
    timer: &Timer,
    stopper: Stopper,
    output_tx: mpsc::Sender<(Stream, Vec<u8>)>,
) -> ExecOutcome {
    let outname = spec.workdir.join(format!("output.{}", spec.format.as_ext()));
    let mut argv = vec![
        "-offscreen".to_string(),
        "-outformat".to_string(),
        spec.format.as_ext().to_string(),
        spec.mainname.to_string(),
        "-outname".to_string(),
        outname.to_string_lossy().into_owned(),
    ];
    if let Some(flag) = verbosity_flag(spec.verbosity) {
        argv.push(flag.to_string());
    }

    let mut cmd = Command::new(spec.renderer_bin);
    cmd.args(&argv)
        .current_dir(spec.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .process_group(0);

    if spec.stderr_redir {
        // True fd-level aliasing, not a second independently-coalesced
        // reader — dup2'ing stderr onto stdout inside the child is the
        // only way to get byte-order-correct interleaving between the two
        // streams, matching what a shared fd gives the real renderer.
        cmd.stderr(Stdio::null());
        unsafe {
            cmd.pre_exec(|| {
                if libc::dup2(1, 2) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    } else {
        cmd.stderr(Stdio::piped());
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return ExecOutcome {
                artifact: None,
                error: Some(RenderError::Io(e)),
            };
        }
    };

    let _pg_guard = ProcessGroupGuard { pid: child.id() };
    let pid = child.id();
    timer.start().await;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take();

    let cancel_readers = CancellationToken::new();
    let abort_on_overflow = CancellationToken::new();
    let (stdout_tx, mut stdout_rx) = mpsc::channel(8);
    let stdout_handle = spawn_reader(
        stdout,
        stdout_tx,
        cancel_readers.clone(),
        abort_on_overflow.clone(),
    );

    let stderr_setup = stderr.map(|stderr| {
        let (tx, rx) = mpsc::channel(8);
        let handle = spawn_reader(stderr, tx, cancel_readers.clone(), abort_on_overflow.clone());
        (handle, rx)
    });
    let (stderr_handle, mut stderr_rx) = match stderr_setup {
        Some((handle, rx)) => (Some(handle), Some(rx)),
        None => (None, None),
    };

    let forward_tx = output_tx.clone();
    let forward = tokio::spawn(async move {
        let mut stdout_done = false;
        let mut stderr_done = stderr_rx.is_none();
        loop {
            tokio::select! {
                chunk = stdout_rx.recv(), if !stdout_done => {
                    match chunk {
                        Some(bytes) => { let _ = forward_tx.send((Stream::Stdout, bytes)).await; }
                        None => stdout_done = true,
                    }
                }
                chunk = async { stderr_rx.as_mut().unwrap().recv().await }, if !stderr_done => {
                    match chunk {
                        Some(bytes) => { let _ = forward_tx.send((Stream::Stderr, bytes)).await; }
                        None => stderr_done = true,
                    }
                }
                else => break,
            }
        }
    });

    let mut reason: Option<RenderError> = None;
    let wait_result = tokio::select! {
        _ = stopper.stopped() => {
            reason = Some(kill_reason(timer));
            kill_process_group(pid);
            child.wait().await
        }
        _ = timer.end().cancelled() => {
            reason = Some(kill_reason(timer));
            kill_process_group(pid);
            child.wait().await
        }
        _ = abort_on_overflow.cancelled() => {
            reason = Some(RenderError::OutputLimit(MAX_SIZE));
            kill_process_group(pid);
            child.wait().await
        }
        res = child.wait() => res,
    };

    cancel_readers.cancel();
    let stdout_outcome = stdout_handle.await.unwrap_or(ReaderOutcome::Stopped);
    let stderr_outcome = match stderr_handle {
        Some(handle) => handle.await.unwrap_or(ReaderOutcome::Stopped),
        None => ReaderOutcome::Eof,
    };
    let _ = forward.await;

    let mut error = reason;

    let status = match wait_result {
        Ok(s) => Some(s),
        Err(e) => {
            error = Some(fold(error, RenderError::WaitError(e)));
            None
        }
    };

    if matches!(stdout_outcome, ReaderOutcome::Truncated)
        || matches!(stderr_outcome, ReaderOutcome::Truncated)
    {
        error = Some(fold(error, RenderError::OutputLimit(MAX_SIZE)));
    }
    if let Some(status) = &status {
        if !status.success() {
            error = Some(fold(error, RenderError::ExecutionFailed));
        }
    }
    if let ReaderOutcome::Io(e) = stdout_outcome {
        error = Some(fold(error, RenderError::Io(e)));
    }
    if let ReaderOutcome::Io(e) = stderr_outcome {
        error = Some(fold(error, RenderError::Io(e)));
    }

    let artifact = tokio::fs::read(&outname).await.ok();

    if artifact.is_none() {
        error = Some(fold(error, RenderError::NoImage));
    }

    ExecOutcome { artifact, error }
}

/// Keeps the higher-precedence of `current` and `candidate`, per the kill
/// reason / wait error / output limit / nonzero exit / I/O error / missing
/// artifact order.
fn fold(current: Option<RenderError>, candidate: RenderError) -> RenderError {
    match current {
        Some(existing) => existing.prefer(candidate),
        None => candidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_single_flags() {
        assert_eq!(verbosity_flag(0), None);
        assert_eq!(verbosity_flag(1), Some("-v"));
        assert_eq!(verbosity_flag(2), Some("-vv"));
        assert_eq!(verbosity_flag(3), Some("-vvv"));
    }
}
