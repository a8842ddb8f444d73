//! External command execution with a deadline.
//!
//! `mount`/`umount` can hang on a flaky USB device; a hung child would keep
//! the run lock held forever, so every command is polled against a timeout and
//! the cancellation token and killed when either fires.

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::cancel::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} timed out after {}s", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Run `cmd` to completion, killing it on timeout or cancellation.
///
/// Stdout is discarded. A non-zero exit status is reported as
/// [`CommandError::Failed`] with the child's trimmed stderr.
pub fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), CommandError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!("Running {:?} (timeout {}s)", cmd, timeout.as_secs());

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stderr = drain(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => {
                kill(&mut child);
                return Err(CommandError::Wait { program, source });
            }
        }
        if cancel.is_cancelled() {
            kill(&mut child);
            return Err(CommandError::Cancelled { program });
        }
        if started.elapsed() >= timeout {
            kill(&mut child);
            return Err(CommandError::TimedOut { program, timeout });
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let stderr = collect(stderr);
    if status.success() {
        Ok(())
    } else {
        Err(CommandError::Failed {
            program,
            status,
            stderr: stderr.trim().to_string(),
        })
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut reader| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
