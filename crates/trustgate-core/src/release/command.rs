//! Bounded subprocess execution.
//!
//! Every external command in the release path (`git`, drill build/test
//! commands) runs with piped output read on helper threads, a wall-clock
//! deadline, and a bounded reap after kill. Output beyond the byte cap is
//! discarded.

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Maximum bytes retained per stream.
pub const MAX_OUTPUT_BYTES: u64 = 16 * 1024 * 1024;

/// Time allowed for a killed process to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors from running a command.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CommandError {
    /// The program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The deadline passed; the process was killed.
    #[error("{program} timed out after {timeout_ms} ms")]
    Timeout {
        /// Program name.
        program: String,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// A killed process could not be reaped.
    #[error("{program} could not be reaped after kill")]
    ReapTimeout {
        /// Program name.
        program: String,
    },
}

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit status.
    pub status: ExitStatus,
    /// Captured stdout (bounded).
    pub stdout: Vec<u8>,
    /// Captured stderr (bounded).
    pub stderr: Vec<u8>,
    /// Wall-clock runtime.
    pub elapsed: Duration,
}

impl CommandOutput {
    /// Whether the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Lossy UTF-8 stderr.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Lossy UTF-8 stdout, trimmed.
    #[must_use]
    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Reads up to [`MAX_OUTPUT_BYTES`] from `stream`, then drains the rest so a
/// chatty child never blocks on a full pipe.
fn spawn_reader(stream: Option<impl Read + Send + 'static>) -> Option<JoinHandle<Vec<u8>>> {
    stream.map(|mut stream| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Err(e) = (&mut stream).take(MAX_OUTPUT_BYTES).read_to_end(&mut buf) {
                tracing::debug!(error = %e, "command output read failed");
                return buf;
            }
            match io::copy(&mut stream, &mut io::sink()) {
                Ok(0) => {},
                Ok(dropped) => {
                    tracing::debug!(dropped_bytes = dropped, "command output over cap discarded");
                },
                Err(e) => tracing::debug!(error = %e, "command output drain failed"),
            }
            buf
        })
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn program_name(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

/// Runs `command` to completion or until `timeout` elapses.
///
/// stdin is closed; stdout and stderr are captured.
///
/// # Errors
///
/// Returns [`CommandError::Timeout`] if the deadline passes (the process is
/// killed first), or a spawn/reap error.
pub fn run_bounded(mut command: Command, timeout: Duration) -> Result<CommandOutput, CommandError> {
    let program = program_name(&command);
    let started = Instant::now();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let deadline = started + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {},
            Err(_) => return Err(CommandError::ReapTimeout { program }),
        }
        if Instant::now() >= deadline {
            if let Err(e) = child.kill() {
                tracing::debug!(program = %program, error = %e, "kill after timeout failed");
            }
            bounded_reap(&mut child, &program)?;
            drop(child);
            // Readers see EOF once the pipes close; a descendant holding a
            // pipe open would block them, so they are not joined here.
            tracing::warn!(
                program = %program,
                timeout_ms = duration_ms(timeout),
                "command timed out and was killed"
            );
            return Err(CommandError::Timeout {
                program,
                timeout_ms: duration_ms(timeout),
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    Ok(CommandOutput {
        status,
        stdout: join_reader(stdout),
        stderr: join_reader(stderr),
        elapsed: started.elapsed(),
    })
}

fn bounded_reap(child: &mut Child, program: &str) -> Result<(), CommandError> {
    let deadline = Instant::now() + REAP_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return Ok(()),
            Ok(None) => {},
        }
        if Instant::now() >= deadline {
            return Err(CommandError::ReapTimeout {
                program: program.to_string(),
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Milliseconds in `duration`, saturating.
#[must_use]
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
