//! Bounded execution of external command-line tools.

use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: PathBuf, timeout: Duration },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: PathBuf,
        status: ExitStatus,
        stderr: String,
    },
    #[error("i/o while waiting for {program}: {source}")]
    Io {
        program: PathBuf,
        source: std::io::Error,
    },
}

/// Run `program` with `args`, returning its output if it exits successfully
/// within `timeout`.
pub(crate) fn run<I, S>(program: &Path, args: I, timeout: Duration) -> Result<Output, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    tracing::debug!(?cmd, "running external tool");

    let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
        program: program.to_path_buf(),
        source,
    })?;

    let output = wait_with_timeout(&mut child, timeout).map_err(|e| match e {
        WaitError::Timeout => ToolError::Timeout {
            program: program.to_path_buf(),
            timeout,
        },
        WaitError::Io(source) => ToolError::Io {
            program: program.to_path_buf(),
            source,
        },
    })?;

    if !output.status.success() {
        return Err(ToolError::Failed {
            program: program.to_path_buf(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

enum WaitError {
    Timeout,
    Io(std::io::Error),
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Output, WaitError> {
    // Drain both pipes while waiting so a chatty tool cannot block on a full buffer.
    let stdout_reader = child.stdout.take();
    let stderr_reader = child.stderr.take();
    let stdout_thread = std::thread::spawn(move || drain(stdout_reader));
    let stderr_thread = std::thread::spawn(move || drain(stderr_reader));

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().map_err(WaitError::Io)? {
            let stdout = join(stdout_thread)?;
            let stderr = join(stderr_thread)?;
            return Ok(Output { status, stdout, stderr });
        }

        if start.elapsed() > timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(WaitError::Timeout);
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R: Read>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut r) = reader {
        r.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

fn join(handle: std::thread::JoinHandle<std::io::Result<Vec<u8>>>) -> Result<Vec<u8>, WaitError> {
    handle
        .join()
        .map_err(|_| WaitError::Io(std::io::Error::other("pipe reader thread panicked")))?
        .map_err(WaitError::Io)
}
